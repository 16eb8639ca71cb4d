//! Error types shared across the bot.
//!
//! Errors come in two tiers: `User` carries a ready-to-send reply and is
//! surfaced to the chat verbatim; every other variant is internal, gets logged
//! with context, and is collapsed to a generic retry hint before it reaches
//! the user.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BotError>;

#[derive(Debug, Error)]
pub enum BotError {
    /// Recoverable, user-facing error. The payload is sent to the chat as-is.
    #[error("{0}")]
    User(String),

    /// Credential decoding or token exchange failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The provider answered with an unexpected status or envelope.
    #[error("provider returned an error: {0}")]
    Provider(String),

    /// Transport-level failure talking to the provider.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider response body could not be decoded.
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BotError {
    /// Shorthand for a user-facing error.
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    /// The ready-to-send reply, if this error is user-facing.
    pub fn user_message(&self) -> Option<&str> {
        match self {
            Self::User(msg) => Some(msg),
            _ => None,
        }
    }
}
