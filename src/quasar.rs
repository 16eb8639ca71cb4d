//! Yandex smart-home client.
//!
//! Handles the token exchange (OAuth credential + CSRF token), the cached
//! smart-home topology fetch, station discovery, and casting a media link to
//! a station through the Quasar endpoint.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::TtlCache;
use crate::error::{BotError, Result};
use crate::session::{Session, Token};

// ============================================================================
// Constants
// ============================================================================

const CSRF_TOKEN_URL: &str = "https://frontend.vh.yandex.ru/csrf_token";
const USER_INFO_URL: &str = "https://api.iot.yandex.net/v1.0/user/info";
const STATION_CAST_URL: &str = "https://yandex.ru/video/station";
const OAUTH_AUTHORIZE_URL: &str = "https://oauth.yandex.com/authorize";

/// Devices whose type contains this marker are castable stations.
const STATION_TYPE_SUBSTR: &str = "yandex.station";

/// Total cast attempts, first try included. No backoff between attempts.
const CAST_ATTEMPTS: u32 = 5;

pub const NO_STATIONS_REPLY: &str =
    "I didn't find any Yandex stations on your account. Is your smart home configured?";
pub const NO_DEVICE_SELECTED_REPLY: &str =
    "Cannot play the link. No station has been selected.";
pub const CAST_REJECTED_REPLY: &str =
    "Could not send the link to your station. Please try again later.";

// ============================================================================
// Wire Types
// ============================================================================

/// Full topology snapshot for one account, as returned by the user-info
/// endpoint. Cached per chat for a bounded window.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartHomeInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub households: Vec<Household>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    /// Room id; may reference a room missing from the snapshot.
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub quasar_info: QuasarInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuasarInfo {
    /// Provider-internal id used to address the device for casting, distinct
    /// from the smart-home device id.
    #[serde(rename = "device_id")]
    pub device_id: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub household_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Household {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
struct CastRequest<'a> {
    device: &'a str,
    msg: CastMessage<'a>,
}

#[derive(Debug, Serialize)]
struct CastMessage<'a> {
    player_id: &'a str,
    provider_item_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CastResponse {
    #[serde(default)]
    status: String,
}

// ============================================================================
// Client
// ============================================================================

/// Client for the Yandex IoT and Quasar endpoints.
///
/// Endpoint bases are injectable so tests can point the client at a local
/// mock server.
#[derive(Clone)]
pub struct QuasarClient {
    client_id: String,
    cache: TtlCache<SmartHomeInfo>,
    http: reqwest::Client,
    csrf_url: String,
    user_info_url: String,
    cast_url: String,
}

impl QuasarClient {
    pub fn new(
        client_id: impl Into<String>,
        cache: TtlCache<SmartHomeInfo>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            cache,
            http,
            csrf_url: CSRF_TOKEN_URL.to_string(),
            user_info_url: USER_INFO_URL.to_string(),
            cast_url: STATION_CAST_URL.to_string(),
        }
    }

    /// Override the provider endpoints. Used by tests.
    #[must_use]
    pub fn with_endpoints(
        mut self,
        csrf_url: impl Into<String>,
        user_info_url: impl Into<String>,
        cast_url: impl Into<String>,
    ) -> Self {
        self.csrf_url = csrf_url.into();
        self.user_info_url = user_info_url.into();
        self.cast_url = cast_url.into();
        self
    }

    /// OAuth authorization URL for the configured application.
    #[must_use]
    pub fn oauth_url(&self) -> String {
        format!(
            "{OAUTH_AUTHORIZE_URL}?response_type=token&client_id={}",
            self.client_id
        )
    }

    /// Exchange a transport-encoded credential for the OAuth and CSRF tokens.
    ///
    /// The credential is `base64(accessToken:expiresInSeconds)`. A malformed
    /// expiry degrades to `None`; a malformed credential or a failed CSRF
    /// exchange is an error.
    pub async fn exchange_token(&self, raw: &str) -> Result<(Token, Token)> {
        let oauth_token = decode_credential(raw)?;
        let csrf_token = self.csrf_token(&oauth_token.value).await?;
        Ok((oauth_token, csrf_token))
    }

    /// Fetch the CSRF token for privileged cast calls.
    ///
    /// The raw response body becomes the token value, with no expiry.
    async fn csrf_token(&self, oauth_token: &str) -> Result<Token> {
        if oauth_token.is_empty() {
            return Err(BotError::Auth(
                "an OAuth token is required to fetch the CSRF token".to_string(),
            ));
        }

        let body = self
            .http
            .get(&self.csrf_url)
            .header("Authorization", format!("OAuth {oauth_token}"))
            .send()
            .await?
            .text()
            .await?;

        Ok(Token::new(body, None))
    }

    /// Topology snapshot for the session's account, cache-first.
    ///
    /// Only a fully decoded, status-ok envelope is ever written to the cache.
    pub async fn smart_home_info(&self, session: &Session) -> Result<SmartHomeInfo> {
        let key = topology_cache_key(session.chat_id);
        if let Some(info) = self.cache.try_get(&key) {
            return Ok(info);
        }

        let bytes = self
            .http
            .get(&self.user_info_url)
            .header("Authorization", format!("OAuth {}", session.oauth_token.value))
            .send()
            .await?
            .bytes()
            .await?;
        let info: SmartHomeInfo = serde_json::from_slice(&bytes)?;

        if info.status != "ok" {
            return Err(BotError::Provider(format!(
                "user info request completed with status `{}`: {}",
                info.status, info.message
            )));
        }

        self.cache.save(&key, info.clone());
        Ok(info)
    }

    /// Castable stations on the account, in provider order.
    ///
    /// An empty result is a user-facing error, distinct from transport or
    /// provider failures.
    pub async fn stations(&self, session: &Session) -> Result<Vec<Device>> {
        let info = self.smart_home_info(session).await?;
        let stations: Vec<Device> = info.devices.into_iter().filter(is_station).collect();

        if stations.is_empty() {
            return Err(BotError::user(NO_STATIONS_REPLY));
        }
        Ok(stations)
    }

    /// Cast a media link to a station.
    ///
    /// An explicit `device` wins over the session's default device; with
    /// neither present this is a user-facing error. Retries internal failures
    /// up to the fixed attempt budget; user-facing errors (the provider
    /// rejecting the cast) return immediately.
    pub async fn play_media(
        &self,
        session: &Session,
        device: Option<&Device>,
        url: &str,
    ) -> Result<()> {
        let quasar_id = device
            .or(session.default_device.as_ref())
            .map(|d| d.quasar_info.device_id.as_str())
            .unwrap_or_default();
        if quasar_id.is_empty() {
            return Err(BotError::user(NO_DEVICE_SELECTED_REPLY));
        }

        let request = CastRequest {
            device: quasar_id,
            msg: CastMessage {
                player_id: "youtube",
                provider_item_id: url,
            },
        };

        let mut last_err = BotError::Provider("cast was never attempted".to_string());
        for attempt in 1..=CAST_ATTEMPTS {
            match self.try_cast(session, &request).await {
                Ok(()) => return Ok(()),
                Err(err @ BotError::User(_)) => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "cast attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn try_cast(&self, session: &Session, request: &CastRequest<'_>) -> Result<()> {
        let response = self
            .http
            .post(&self.cast_url)
            .header("Authorization", format!("OAuth {}", session.oauth_token.value))
            .header("x-csrf-token", session.csrf_token.value.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(BotError::Provider(format!(
                "cast request returned unexpected status code {status}"
            )));
        }

        let body: CastResponse = serde_json::from_slice(&response.bytes().await?)?;
        if body.status == "error" {
            return Err(BotError::user(CAST_REJECTED_REPLY));
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Cache key for a chat's topology snapshot. The dispatcher evicts this key
/// on /reset so a deleted session never leaves cached topology behind.
#[must_use]
pub fn topology_cache_key(chat_id: i64) -> String {
    format!("{chat_id}_iotuserinfo")
}

fn is_station(device: &Device) -> bool {
    device.device_type.contains(STATION_TYPE_SUBSTR)
}

/// Decode `base64(accessToken:expiresInSeconds)` into an OAuth token.
fn decode_credential(raw: &str) -> Result<Token> {
    let bytes = STANDARD
        .decode(raw)
        .map_err(|e| BotError::Auth(format!("credential is not valid base64: {e}")))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|e| BotError::Auth(format!("credential is not valid utf-8: {e}")))?;

    let (value, expires) = match decoded.split_once(':') {
        Some((value, expires)) => (value.to_string(), expires.parse::<u64>().ok()),
        None => (decoded, None),
    };
    Ok(Token::new(value, expires))
}
