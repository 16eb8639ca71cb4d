//! Per-chat authentication and selection state.
//!
//! One session per Telegram chat, created only after a successful token
//! exchange, so a stored session always carries both tokens. Sessions are
//! volatile; a restart unlinks everyone.

use std::sync::Arc;

use dashmap::DashMap;

use crate::quasar::Device;

/// Opaque provider token. Never parsed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    /// Lifetime in seconds, when the provider reported one. Best-effort
    /// metadata only.
    pub expires_in: Option<u64>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self {
            value: value.into(),
            expires_in,
        }
    }
}

/// Authenticated state for one chat.
#[derive(Debug, Clone)]
pub struct Session {
    pub chat_id: i64,
    pub oauth_token: Token,
    pub csrf_token: Token,
    /// Chosen once via /selectasdefault; staleness is tolerated and
    /// re-validated lazily on the next cast.
    pub default_device: Option<Device>,
}

impl Session {
    pub fn new(chat_id: i64, oauth_token: Token, csrf_token: Token) -> Self {
        Self {
            chat_id,
            oauth_token,
            csrf_token,
            default_device: None,
        }
    }

    /// Copy of this session with the default device replaced.
    #[must_use]
    pub fn with_default_device(mut self, device: Device) -> Self {
        self.default_device = Some(device);
        self
    }
}

/// In-memory session store keyed by chat id.
///
/// All three operations are plain map mutations with no merge logic; a new
/// session always wins over the old one. Cheap to clone; clones share storage.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<i64, Session>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or fully replace the session for its chat id.
    pub fn save_or_update(&self, session: Session) {
        self.sessions.insert(session.chat_id, session);
    }

    pub fn try_get(&self, chat_id: i64) -> Option<Session> {
        self.sessions.get(&chat_id).map(|s| s.value().clone())
    }

    /// Remove the session for a chat. No-op if absent.
    pub fn delete(&self, chat_id: i64) {
        self.sessions.remove(&chat_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
