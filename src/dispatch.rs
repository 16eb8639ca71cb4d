//! Command and callback dispatcher.
//!
//! Transport-agnostic state machine over one piece of visible state per chat:
//! Unauthenticated -> Authenticated (no default station) -> Authenticated
//! (default station set), with /reset dropping any state back to
//! Unauthenticated and evicting the chat's cached topology.
//!
//! Inbound traffic arrives as [`Event`] values and every handler resolves to
//! a list of [`Outbound`] replies; the Telegram adapter owns the wire on both
//! sides. Callback payloads are decoded once at this boundary into
//! [`CallbackAction`], never string-split deeper in the call graph.

use tracing::{debug, error, warn};

use crate::cache::TtlCache;
use crate::error::{BotError, Result};
use crate::quasar::{Device, QuasarClient, SmartHomeInfo, topology_cache_key};
use crate::session::{Session, SessionStore};
use crate::urls;

// ============================================================================
// Reply Texts
// ============================================================================

pub const AUTH_REQUIRED_REPLY: &str =
    "Please authenticate to perform this action. Send /start to begin.";
pub const READY_REPLY: &str =
    "Looks like everything is ready. Send me a link and I will play it on your station.";
pub const GREETING_REPLY: &str = "Hello!\n\
    To get started I need to link your Yandex account. Please click the link below to \
    authenticate.\n\
    Authentication is done through Yandex.OAuth. I will never ask for your login or password.";
pub const AUTH_OK_REPLY: &str =
    "Authentication is complete.\nSend me a link and I will play it on your station. Have fun!";
pub const AUTH_FAILED_REPLY: &str =
    "Could not complete the authentication process. Please try again.";
pub const GENERIC_ERROR_REPLY: &str =
    "Something went wrong. Please try again, or send /reset to start over.";
pub const RESET_REPLY: &str =
    "Done. Your account has been unlinked. Send /start to link it again.";
pub const NO_LINK_REPLY: &str = "I could not find a link in that message.";
pub const UNSUPPORTED_LINK_REPLY: &str = "Only YouTube links are supported for now.";
pub const DEFAULT_GONE_REPLY: &str =
    "Your default station is no longer available. Pick another one with /selectasdefault.";
pub const DEVICE_UNAVAILABLE_REPLY: &str = "That station is not available anymore.";
pub const ORIGIN_LOST_REPLY: &str =
    "I could not find the original message with the link. Please send it again.";
pub const CHOOSE_CAST_REPLY: &str = "Choose a station to play this on:";
pub const CHOOSE_DEFAULT_REPLY: &str = "Choose a station to use by default:";

// ============================================================================
// Events & Replies
// ============================================================================

/// Bot commands understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    ListDevices,
    SelectAsDefault,
    Reset,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "start" => Some(Self::Start),
            "listdevices" => Some(Self::ListDevices),
            "selectasdefault" => Some(Self::SelectAsDefault),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Split a leading-slash message into a known command and its argument tail.
///
/// Returns `None` for unknown commands and for text without a slash prefix.
/// A `@botname` suffix on the command is tolerated.
pub fn parse_command(text: &str) -> Option<(Command, String)> {
    let rest = text.strip_prefix('/')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let name = name.split('@').next().unwrap_or(name);
    Command::parse(name).map(|command| (command, args.to_string()))
}

/// Marker prefix for "make this the default station" callbacks.
pub const SET_DEFAULT_MARKER: &str = "sad";
/// Marker prefix for "cast once to this station" callbacks.
pub const ONE_TIME_CAST_MARKER: &str = "otp";

/// Decoded callback payload: `"<marker>:<device_id>"` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    SetDefault(String),
    OneTimeCast(String),
}

impl CallbackAction {
    pub fn parse(payload: &str) -> Option<Self> {
        let (marker, device_id) = payload.split_once(':')?;
        if device_id.is_empty() {
            return None;
        }
        match marker {
            SET_DEFAULT_MARKER => Some(Self::SetDefault(device_id.to_string())),
            ONE_TIME_CAST_MARKER => Some(Self::OneTimeCast(device_id.to_string())),
            _ => None,
        }
    }

    /// Wire form of this action. Telegram caps callback payloads at 64 bytes,
    /// which provider device ids comfortably fit.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::SetDefault(id) => format!("{SET_DEFAULT_MARKER}:{id}"),
            Self::OneTimeCast(id) => format!("{ONE_TIME_CAST_MARKER}:{id}"),
        }
    }
}

/// One inbound messaging event, already stripped of transport details.
#[derive(Debug, Clone)]
pub enum Event {
    Command {
        chat_id: i64,
        message_id: i32,
        command: Command,
        args: String,
    },
    Text {
        chat_id: i64,
        message_id: i32,
        text: String,
    },
    Callback {
        chat_id: i64,
        action: CallbackAction,
        /// Text of the message the keyboard replied to, when available. The
        /// one-time-cast flow re-extracts the URL from here instead of the
        /// size-capped callback payload.
        origin_text: Option<String>,
    },
}

impl Event {
    pub fn chat_id(&self) -> i64 {
        match self {
            Self::Command { chat_id, .. }
            | Self::Text { chat_id, .. }
            | Self::Callback { chat_id, .. } => *chat_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

/// One outbound reply for the gateway to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text {
        text: String,
        reply_to: Option<i32>,
    },
    Keyboard {
        text: String,
        buttons: Vec<Button>,
        reply_to: Option<i32>,
    },
}

impl Outbound {
    fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            reply_to: None,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound events through the authorization gate to their handlers and
/// translates errors into replies.
#[derive(Clone)]
pub struct Dispatcher {
    sessions: SessionStore,
    cache: TtlCache<SmartHomeInfo>,
    client: QuasarClient,
}

impl Dispatcher {
    pub fn new(
        sessions: SessionStore,
        cache: TtlCache<SmartHomeInfo>,
        client: QuasarClient,
    ) -> Self {
        Self {
            sessions,
            cache,
            client,
        }
    }

    /// Handle one event, always resolving to at least one reply when anything
    /// went wrong. User-facing errors are forwarded verbatim; everything else
    /// is logged and collapsed to a generic retry hint.
    pub async fn handle(&self, event: Event) -> Vec<Outbound> {
        let chat_id = event.chat_id();
        let mut replies = Vec::new();

        if let Err(err) = self.dispatch(event, &mut replies).await {
            match err.user_message() {
                Some(msg) => replies.push(Outbound::text(msg)),
                None => {
                    error!(chat_id, error = %err, "event dispatch failed");
                    replies.push(Outbound::text(GENERIC_ERROR_REPLY));
                }
            }
        }
        replies
    }

    async fn dispatch(&self, event: Event, replies: &mut Vec<Outbound>) -> Result<()> {
        // /start is the only entry point that works without a session.
        if let Event::Command {
            chat_id,
            command: Command::Start,
            ref args,
            ..
        } = event
        {
            return self.handle_start(chat_id, args, replies).await;
        }

        // The single authorization gate, enforced once per inbound event.
        let Some(session) = self.sessions.try_get(event.chat_id()) else {
            return Err(BotError::user(AUTH_REQUIRED_REPLY));
        };

        match event {
            Event::Command { command, .. } => match command {
                Command::Start => Ok(()), // handled before the gate
                Command::ListDevices => self.handle_list_devices(&session, replies).await,
                Command::SelectAsDefault => self.handle_select_default(&session, replies).await,
                Command::Reset => {
                    self.handle_reset(session.chat_id, replies);
                    Ok(())
                }
            },
            Event::Text {
                message_id, text, ..
            } => {
                self.handle_media_text(&session, message_id, &text, replies)
                    .await
            }
            Event::Callback {
                action,
                origin_text,
                ..
            } => self.handle_callback(session, action, origin_text, replies).await,
        }
    }

    // ------------------------------------------------------------------------
    // /start
    // ------------------------------------------------------------------------

    async fn handle_start(
        &self,
        chat_id: i64,
        args: &str,
        replies: &mut Vec<Outbound>,
    ) -> Result<()> {
        // Re-issuing /start never creates a second session.
        if self.sessions.try_get(chat_id).is_some() {
            replies.push(Outbound::text(READY_REPLY));
            return Ok(());
        }

        if !args.is_empty() {
            let (oauth_token, csrf_token) = match self.client.exchange_token(args).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    warn!(chat_id, error = %err, "token exchange failed");
                    return Err(BotError::user(AUTH_FAILED_REPLY));
                }
            };

            self.sessions
                .save_or_update(Session::new(chat_id, oauth_token, csrf_token));
            replies.push(Outbound::text(AUTH_OK_REPLY));
            return Ok(());
        }

        replies.push(Outbound::text(GREETING_REPLY));
        replies.push(Outbound::text(self.client.oauth_url()));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // /listdevices and /selectasdefault
    // ------------------------------------------------------------------------

    async fn handle_list_devices(
        &self,
        session: &Session,
        replies: &mut Vec<Outbound>,
    ) -> Result<()> {
        let stations = self.client.stations(session).await?;
        let info = self.client.smart_home_info(session).await?;

        let lines: Vec<String> = sorted_by_id(stations)
            .iter()
            .enumerate()
            .map(|(i, device)| {
                let prefix = if is_default(session, device) { "Default: " } else { "" };
                format!("{}. {prefix}{}", i + 1, station_label(&info, device))
            })
            .collect();

        replies.push(Outbound::text(lines.join("\n")));
        Ok(())
    }

    async fn handle_select_default(
        &self,
        session: &Session,
        replies: &mut Vec<Outbound>,
    ) -> Result<()> {
        let stations = self.client.stations(session).await?;
        let info = self.client.smart_home_info(session).await?;

        let buttons = sorted_by_id(stations)
            .iter()
            .map(|device| {
                let prefix = if is_default(session, device) { "Default: " } else { "" };
                Button {
                    label: format!("{prefix}{}", station_label(&info, device)),
                    payload: CallbackAction::SetDefault(device.id.clone()).encode(),
                }
            })
            .collect();

        replies.push(Outbound::Keyboard {
            text: CHOOSE_DEFAULT_REPLY.to_string(),
            buttons,
            reply_to: None,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Free text with a link
    // ------------------------------------------------------------------------

    async fn handle_media_text(
        &self,
        session: &Session,
        message_id: i32,
        text: &str,
        replies: &mut Vec<Outbound>,
    ) -> Result<()> {
        let url = extract_video_url(text)?;
        let stations = self.client.stations(session).await?;

        // Resolution order: validated default station, then the only station,
        // then an interactive choice tagged for a one-time cast.
        if let Some(default) = &session.default_device {
            if !stations.iter().any(|s| s.id == default.id) {
                return Err(BotError::user(DEFAULT_GONE_REPLY));
            }
            self.client.play_media(session, None, &url).await?;
            replies.push(Outbound::text(cast_confirmation(&default.name)));
            return Ok(());
        }

        if let [only] = stations.as_slice() {
            self.client.play_media(session, Some(only), &url).await?;
            replies.push(Outbound::text(cast_confirmation(&only.name)));
            return Ok(());
        }

        let info = self.client.smart_home_info(session).await?;
        let buttons = sorted_by_id(stations)
            .iter()
            .map(|device| Button {
                label: station_label(&info, device),
                payload: CallbackAction::OneTimeCast(device.id.clone()).encode(),
            })
            .collect();

        // Sent as a reply so the callback can recover the URL from the
        // original message instead of the 64-byte callback payload.
        replies.push(Outbound::Keyboard {
            text: CHOOSE_CAST_REPLY.to_string(),
            buttons,
            reply_to: Some(message_id),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    async fn handle_callback(
        &self,
        session: Session,
        action: CallbackAction,
        origin_text: Option<String>,
        replies: &mut Vec<Outbound>,
    ) -> Result<()> {
        match action {
            CallbackAction::SetDefault(device_id) => {
                let stations = self.client.stations(&session).await?;
                let Some(device) = stations.into_iter().find(|s| s.id == device_id) else {
                    debug!(chat_id = session.chat_id, device_id = %device_id, "selected station vanished");
                    replies.push(Outbound::text(DEVICE_UNAVAILABLE_REPLY));
                    return Ok(());
                };

                let name = device.name.clone();
                self.sessions
                    .save_or_update(session.with_default_device(device));
                replies.push(Outbound::text(format!("{name} is now your default station.")));
                Ok(())
            }
            CallbackAction::OneTimeCast(device_id) => {
                let origin = origin_text.ok_or_else(|| BotError::user(ORIGIN_LOST_REPLY))?;
                let url = extract_video_url(&origin)?;

                let stations = self.client.stations(&session).await?;
                let Some(device) = stations.iter().find(|s| s.id == device_id) else {
                    replies.push(Outbound::text(DEVICE_UNAVAILABLE_REPLY));
                    return Ok(());
                };

                self.client.play_media(&session, Some(device), &url).await?;
                replies.push(Outbound::text(cast_confirmation(&device.name)));
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // /reset
    // ------------------------------------------------------------------------

    /// Delete the session and its cached topology together; the two must
    /// never diverge after a reset.
    fn handle_reset(&self, chat_id: i64, replies: &mut Vec<Outbound>) {
        self.sessions.delete(chat_id);
        self.cache.delete(&topology_cache_key(chat_id));
        replies.push(Outbound::text(RESET_REPLY));
    }
}

// ============================================================================
// Rendering Helpers
// ============================================================================

fn extract_video_url(text: &str) -> Result<String> {
    let url = urls::find_url(text).ok_or_else(|| BotError::user(NO_LINK_REPLY))?;
    if !urls::is_youtube(url) {
        return Err(BotError::user(UNSUPPORTED_LINK_REPLY));
    }
    Ok(urls::normalize_youtube(url))
}

fn sorted_by_id(mut stations: Vec<Device>) -> Vec<Device> {
    stations.sort_by(|a, b| a.id.cmp(&b.id));
    stations
}

fn is_default(session: &Session, device: &Device) -> bool {
    session
        .default_device
        .as_ref()
        .is_some_and(|d| d.id == device.id)
}

/// `household - room - device`, with missing references rendered as empty
/// names. Topologies are small; linear scans are fine.
fn station_label(info: &SmartHomeInfo, device: &Device) -> String {
    let room = info.rooms.iter().find(|r| r.id == device.room);
    let room_name = room.map(|r| r.name.as_str()).unwrap_or_default();
    let household_name = room
        .and_then(|r| info.households.iter().find(|h| h.id == r.household_id))
        .map(|h| h.name.as_str())
        .unwrap_or_default();
    format!("{household_name} - {room_name} - {}", device.name)
}

fn cast_confirmation(device_name: &str) -> String {
    format!("Sent the video to {device_name}.")
}
