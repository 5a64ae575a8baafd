//! # Token Lifecycle
//!
//! OAuth token validation and refresh for N users: a stateless
//! [`TokenClient`] for the wire operations, a [`TokenManager`] owning the
//! per-user records and hook registry, and a drift-compensated background
//! loop keeping every token fresh for weeks of unattended operation.

mod background;
mod client;
mod manager;

pub use background::TokenHealth;
pub use client::{RefreshErrorKind, TokenClient, TokenOutcome, TokenResult};
pub use manager::{TokenHook, TokenInfo, TokenManager, TokenState};

/// Render a second count as a compact human duration (`2h05m`, `42s`).
pub(crate) fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
