//! End-to-end dispatcher tests against a mock Yandex API.
//!
//! A small axum app stands in for the provider's three endpoints (CSRF
//! exchange, user info, cast) on an ephemeral port; the dispatcher is driven
//! through plain events and its replies are asserted directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use stationcast::cache::TtlCache;
use stationcast::dispatch::{
    AUTH_FAILED_REPLY, AUTH_OK_REPLY, AUTH_REQUIRED_REPLY, CallbackAction, Command,
    DEFAULT_GONE_REPLY, DEVICE_UNAVAILABLE_REPLY, Dispatcher, Event, GENERIC_ERROR_REPLY,
    NO_LINK_REPLY, ORIGIN_LOST_REPLY, Outbound, READY_REPLY, RESET_REPLY, UNSUPPORTED_LINK_REPLY,
};
use stationcast::quasar::{
    CAST_REJECTED_REPLY, Device, NO_STATIONS_REPLY, QuasarClient, QuasarInfo, SmartHomeInfo,
    topology_cache_key,
};
use stationcast::session::SessionStore;

/// base64 of `abc:3600`.
const CREDENTIAL: &str = "YWJjOjM2MDA=";
const CHAT: i64 = 42;

// ============================================================================
// Mock Provider
// ============================================================================

#[derive(Clone, Copy)]
enum CastMode {
    Accept,
    TransportFailure,
    Rejected,
}

#[derive(Clone)]
struct ProviderState {
    topology: Value,
    cast_mode: CastMode,
    info_hits: Arc<AtomicUsize>,
    cast_hits: Arc<AtomicUsize>,
    last_cast: Arc<Mutex<Option<Value>>>,
}

impl ProviderState {
    fn new(topology: Value, cast_mode: CastMode) -> Self {
        Self {
            topology,
            cast_mode,
            info_hits: Arc::new(AtomicUsize::new(0)),
            cast_hits: Arc::new(AtomicUsize::new(0)),
            last_cast: Arc::new(Mutex::new(None)),
        }
    }
}

async fn csrf_token() -> &'static str {
    "csrf-secret"
}

async fn user_info(State(state): State<ProviderState>) -> Json<Value> {
    state.info_hits.fetch_add(1, Ordering::SeqCst);
    Json(state.topology.clone())
}

async fn cast(
    State(state): State<ProviderState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.cast_hits.fetch_add(1, Ordering::SeqCst);
    *state.last_cast.lock().await = Some(body);

    match state.cast_mode {
        CastMode::Accept => (StatusCode::OK, Json(json!({"status": "ok"}))),
        CastMode::TransportFailure => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))),
        CastMode::Rejected => (
            StatusCode::OK,
            Json(json!({"status": "error", "message": "device not found"})),
        ),
    }
}

async fn spawn_provider(state: ProviderState) -> SocketAddr {
    let app = Router::new()
        .route("/csrf_token", get(csrf_token))
        .route("/v1.0/user/info", get(user_info))
        .route("/video/station", post(cast))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ============================================================================
// Fixtures
// ============================================================================

fn two_station_topology() -> Value {
    // Devices deliberately out of id order; the dispatcher sorts for display.
    json!({
        "status": "ok",
        "devices": [
            {
                "id": "dev-b",
                "name": "Station Max",
                "type": "devices.types.smart_speaker.yandex.station",
                "room": "room-1",
                "quasar_info": {"device_id": "quasar-b", "platform": "yandexstation"}
            },
            {
                "id": "dev-lamp",
                "name": "Lamp",
                "type": "devices.types.light",
                "room": "room-1",
                "quasar_info": {"device_id": "", "platform": ""}
            },
            {
                "id": "dev-a",
                "name": "Station Mini",
                "type": "devices.types.smart_speaker.yandex.station.mini",
                "room": "room-2",
                "quasar_info": {"device_id": "quasar-a", "platform": "yandexmini"}
            }
        ],
        "rooms": [
            {"id": "room-1", "name": "Kitchen", "household_id": "hh-1"},
            {"id": "room-2", "name": "Living Room", "household_id": "hh-1"}
        ],
        "households": [{"id": "hh-1", "name": "Home"}]
    })
}

fn single_station_topology() -> Value {
    json!({
        "status": "ok",
        "devices": [
            {
                "id": "dev-a",
                "name": "Station Mini",
                "type": "devices.types.smart_speaker.yandex.station.mini",
                "room": "room-2",
                "quasar_info": {"device_id": "quasar-a", "platform": "yandexmini"}
            }
        ],
        "rooms": [{"id": "room-2", "name": "Living Room", "household_id": "hh-1"}],
        "households": [{"id": "hh-1", "name": "Home"}]
    })
}

fn no_station_topology() -> Value {
    json!({
        "status": "ok",
        "devices": [
            {
                "id": "dev-lamp",
                "name": "Lamp",
                "type": "devices.types.light",
                "room": "room-1",
                "quasar_info": {"device_id": "", "platform": ""}
            }
        ],
        "rooms": [],
        "households": []
    })
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dispatcher: Dispatcher,
    sessions: SessionStore,
    cache: TtlCache<SmartHomeInfo>,
    provider: ProviderState,
}

async fn harness(topology: Value, cast_mode: CastMode) -> Harness {
    let provider = ProviderState::new(topology, cast_mode);
    let addr = spawn_provider(provider.clone()).await;

    let cache = TtlCache::with_default_ttls();
    let sessions = SessionStore::new();
    let client = QuasarClient::new("client-id", cache.clone(), reqwest::Client::new())
        .with_endpoints(
            format!("http://{addr}/csrf_token"),
            format!("http://{addr}/v1.0/user/info"),
            format!("http://{addr}/video/station"),
        );
    let dispatcher = Dispatcher::new(sessions.clone(), cache.clone(), client);

    Harness {
        dispatcher,
        sessions,
        cache,
        provider,
    }
}

fn command(command: Command, args: &str) -> Event {
    Event::Command {
        chat_id: CHAT,
        message_id: 1,
        command,
        args: args.to_string(),
    }
}

fn text_event(message_id: i32, text: &str) -> Event {
    Event::Text {
        chat_id: CHAT,
        message_id,
        text: text.to_string(),
    }
}

fn callback(action: CallbackAction, origin_text: Option<&str>) -> Event {
    Event::Callback {
        chat_id: CHAT,
        action,
        origin_text: origin_text.map(str::to_string),
    }
}

fn text_of(reply: &Outbound) -> &str {
    match reply {
        Outbound::Text { text, .. } => text,
        Outbound::Keyboard { text, .. } => text,
    }
}

async fn authenticate(h: &Harness) {
    let replies = h.dispatcher.handle(command(Command::Start, CREDENTIAL)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(text_of(&replies[0]), AUTH_OK_REPLY);
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn commands_without_a_session_hit_the_auth_gate() {
    let h = harness(two_station_topology(), CastMode::Accept).await;

    for event in [
        command(Command::ListDevices, ""),
        command(Command::SelectAsDefault, ""),
        command(Command::Reset, ""),
        text_event(1, "https://youtu.be/XYZ123"),
        callback(CallbackAction::SetDefault("dev-a".to_string()), None),
    ] {
        let replies = h.dispatcher.handle(event).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(text_of(&replies[0]), AUTH_REQUIRED_REPLY);
    }
    assert_eq!(h.provider.info_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_without_argument_sends_greeting_then_oauth_url() {
    let h = harness(two_station_topology(), CastMode::Accept).await;

    let replies = h.dispatcher.handle(command(Command::Start, "")).await;
    assert_eq!(replies.len(), 2);
    assert!(text_of(&replies[0]).starts_with("Hello!"));
    assert_eq!(
        text_of(&replies[1]),
        "https://oauth.yandex.com/authorize?response_type=token&client_id=client-id"
    );
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn start_with_credential_creates_session_with_decoded_tokens() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let session = h.sessions.try_get(CHAT).unwrap();
    assert_eq!(session.oauth_token.value, "abc");
    assert_eq!(session.oauth_token.expires_in, Some(3600));
    assert_eq!(session.csrf_token.value, "csrf-secret");
    assert_eq!(session.csrf_token.expires_in, None);
    assert!(session.default_device.is_none());
}

#[tokio::test]
async fn start_is_idempotent_per_chat() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h.dispatcher.handle(command(Command::Start, CREDENTIAL)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(text_of(&replies[0]), READY_REPLY);
    assert_eq!(h.sessions.len(), 1);
    // The original session survived untouched.
    assert_eq!(h.sessions.try_get(CHAT).unwrap().oauth_token.value, "abc");
}

#[tokio::test]
async fn start_with_invalid_credential_replies_and_creates_no_session() {
    let h = harness(two_station_topology(), CastMode::Accept).await;

    let replies = h.dispatcher.handle(command(Command::Start, "%%%not-base64")).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(text_of(&replies[0]), AUTH_FAILED_REPLY);
    assert!(h.sessions.is_empty());
}

// ============================================================================
// Listing & Selection
// ============================================================================

#[tokio::test]
async fn list_devices_renders_numbered_list_sorted_by_id() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h.dispatcher.handle(command(Command::ListDevices, "")).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(
        text_of(&replies[0]),
        "1. Home - Living Room - Station Mini\n2. Home - Kitchen - Station Max"
    );
}

#[tokio::test]
async fn list_devices_marks_exactly_the_default_line() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;
    h.dispatcher
        .handle(callback(CallbackAction::SetDefault("dev-b".to_string()), None))
        .await;

    let replies = h.dispatcher.handle(command(Command::ListDevices, "")).await;
    assert_eq!(
        text_of(&replies[0]),
        "1. Home - Living Room - Station Mini\n2. Default: Home - Kitchen - Station Max"
    );
}

#[tokio::test]
async fn select_as_default_offers_sorted_keyboard() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h.dispatcher.handle(command(Command::SelectAsDefault, "")).await;
    assert_eq!(replies.len(), 1);
    let Outbound::Keyboard { buttons, reply_to, .. } = &replies[0] else {
        panic!("expected a keyboard, got {:?}", replies[0]);
    };
    assert_eq!(reply_to, &None);
    assert_eq!(buttons.len(), 2);
    assert_eq!(buttons[0].payload, "sad:dev-a");
    assert_eq!(buttons[0].label, "Home - Living Room - Station Mini");
    assert_eq!(buttons[1].payload, "sad:dev-b");
}

#[tokio::test]
async fn set_default_callback_validates_and_updates_session() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(callback(CallbackAction::SetDefault("dev-a".to_string()), None))
        .await;
    assert_eq!(text_of(&replies[0]), "Station Mini is now your default station.");

    let session = h.sessions.try_get(CHAT).unwrap();
    assert_eq!(session.default_device.unwrap().id, "dev-a");
}

#[tokio::test]
async fn set_default_callback_rejects_vanished_device() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(callback(CallbackAction::SetDefault("dev-gone".to_string()), None))
        .await;
    assert_eq!(text_of(&replies[0]), DEVICE_UNAVAILABLE_REPLY);
    assert!(h.sessions.try_get(CHAT).unwrap().default_device.is_none());
}

#[tokio::test]
async fn topology_with_no_stations_is_a_user_facing_error() {
    let h = harness(no_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h.dispatcher.handle(command(Command::ListDevices, "")).await;
    assert_eq!(text_of(&replies[0]), NO_STATIONS_REPLY);
}

// ============================================================================
// Cache & Reset
// ============================================================================

#[tokio::test]
async fn topology_is_fetched_once_within_the_ttl_window() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    h.dispatcher.handle(command(Command::ListDevices, "")).await;
    h.dispatcher.handle(command(Command::ListDevices, "")).await;
    assert_eq!(h.provider.info_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reset_unlinks_the_chat_and_evicts_its_topology() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;
    h.dispatcher.handle(command(Command::ListDevices, "")).await;
    assert!(h.cache.try_get(&topology_cache_key(CHAT)).is_some());

    let replies = h.dispatcher.handle(command(Command::Reset, "")).await;
    assert_eq!(text_of(&replies[0]), RESET_REPLY);
    assert!(h.cache.try_get(&topology_cache_key(CHAT)).is_none());

    // Behaves as if no session ever existed.
    let replies = h.dispatcher.handle(command(Command::ListDevices, "")).await;
    assert_eq!(text_of(&replies[0]), AUTH_REQUIRED_REPLY);
}

// ============================================================================
// Casting
// ============================================================================

#[tokio::test]
async fn free_text_without_a_link_is_rejected() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h.dispatcher.handle(text_event(1, "just words")).await;
    assert_eq!(text_of(&replies[0]), NO_LINK_REPLY);

    let replies = h
        .dispatcher
        .handle(text_event(1, "look https://vimeo.com/123"))
        .await;
    assert_eq!(text_of(&replies[0]), UNSUPPORTED_LINK_REPLY);
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_station_casts_directly_with_normalized_url() {
    let h = harness(single_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(text_event(1, "check this out https://youtu.be/XYZ123 nice"))
        .await;
    assert_eq!(text_of(&replies[0]), "Sent the video to Station Mini.");
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 1);

    let body = h.provider.last_cast.lock().await.clone().unwrap();
    assert_eq!(body["device"], "quasar-a");
    assert_eq!(body["msg"]["player_id"], "youtube");
    assert_eq!(
        body["msg"]["provider_item_id"],
        "https://www.youtube.com/watch?v=XYZ123"
    );
}

#[tokio::test]
async fn two_stations_without_default_prompt_a_choice() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(text_event(77, "check this out https://youtu.be/XYZ123 nice"))
        .await;
    assert_eq!(replies.len(), 1);
    let Outbound::Keyboard { buttons, reply_to, .. } = &replies[0] else {
        panic!("expected a keyboard, got {:?}", replies[0]);
    };
    assert_eq!(reply_to, &Some(77));
    assert_eq!(buttons[0].payload, "otp:dev-a");
    assert_eq!(buttons[1].payload, "otp:dev-b");
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn default_station_casts_directly_even_with_many_stations() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;
    h.dispatcher
        .handle(callback(CallbackAction::SetDefault("dev-b".to_string()), None))
        .await;

    let replies = h
        .dispatcher
        .handle(text_event(1, "https://youtu.be/XYZ123"))
        .await;
    assert_eq!(text_of(&replies[0]), "Sent the video to Station Max.");

    let body = h.provider.last_cast.lock().await.clone().unwrap();
    assert_eq!(body["device"], "quasar-b");
}

#[tokio::test]
async fn vanished_default_station_fails_without_casting() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let stale = Device {
        id: "dev-gone".to_string(),
        name: "Old Station".to_string(),
        device_type: "devices.types.smart_speaker.yandex.station".to_string(),
        room: String::new(),
        quasar_info: QuasarInfo::default(),
    };
    let session = h.sessions.try_get(CHAT).unwrap().with_default_device(stale);
    h.sessions.save_or_update(session);

    let replies = h
        .dispatcher
        .handle(text_event(1, "https://youtu.be/XYZ123"))
        .await;
    assert_eq!(text_of(&replies[0]), DEFAULT_GONE_REPLY);
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_time_cast_callback_recovers_url_from_origin_message() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(callback(
            CallbackAction::OneTimeCast("dev-b".to_string()),
            Some("check this out https://youtu.be/XYZ123 nice"),
        ))
        .await;
    assert_eq!(text_of(&replies[0]), "Sent the video to Station Max.");

    let body = h.provider.last_cast.lock().await.clone().unwrap();
    assert_eq!(body["device"], "quasar-b");
    assert_eq!(
        body["msg"]["provider_item_id"],
        "https://www.youtube.com/watch?v=XYZ123"
    );

    // One-time casts never touch the stored session.
    assert!(h.sessions.try_get(CHAT).unwrap().default_device.is_none());
}

#[tokio::test]
async fn one_time_cast_callback_without_origin_is_rejected() {
    let h = harness(two_station_topology(), CastMode::Accept).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(callback(CallbackAction::OneTimeCast("dev-b".to_string()), None))
        .await;
    assert_eq!(text_of(&replies[0]), ORIGIN_LOST_REPLY);
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Retry Policy
// ============================================================================

#[tokio::test]
async fn transient_cast_failures_retry_five_attempts_then_collapse() {
    let h = harness(single_station_topology(), CastMode::TransportFailure).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(text_event(1, "https://youtu.be/XYZ123"))
        .await;
    assert_eq!(text_of(&replies[0]), GENERIC_ERROR_REPLY);
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn provider_rejection_returns_immediately_without_retrying() {
    let h = harness(single_station_topology(), CastMode::Rejected).await;
    authenticate(&h).await;

    let replies = h
        .dispatcher
        .handle(text_event(1, "https://youtu.be/XYZ123"))
        .await;
    assert_eq!(text_of(&replies[0]), CAST_REJECTED_REPLY);
    assert_eq!(h.provider.cast_hits.load(Ordering::SeqCst), 1);
}
