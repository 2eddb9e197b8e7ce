//! Time source for the sans-IO state machines.
//!
//! The engines take `std::time::Instant`; reading it through tokio keeps
//! paused-time tests deterministic.

use std::time::Instant;

pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
