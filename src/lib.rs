//! Offline-aware client data layer for the stillnest photo-sharing app.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod loader;
pub mod logging;
pub mod notify;
pub mod optimistic;
pub mod retry;
pub mod scroll;
