//! Stationcast - a Telegram bridge to Yandex smart-home stations.
//!
//! Links a chat to a Yandex account via OAuth, discovers the account's
//! stations, and casts YouTube links to one of them.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod cache;
pub mod config;
pub mod error;
pub mod server;

// ============================================================================
// Domain
// ============================================================================

pub mod dispatch;
pub mod quasar;
pub mod session;
pub mod urls;

// ============================================================================
// Gateway
// ============================================================================

pub mod telegram;
