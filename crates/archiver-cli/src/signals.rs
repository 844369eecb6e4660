use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context as _, Result};
use archiver_core::cancel::CancelToken;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::debug;

/// Cancellation token tripped by SIGINT/SIGTERM and, optionally, a deadline.
///
/// In-flight builds stop at the next record; committed archives are kept.
pub fn cancel_on_signal(deadline: Option<Duration>) -> Result<CancelToken> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .with_context(|| format!("Failed to install handler for signal {signal}"))?;
    }

    let token = CancelToken::from_flag(flag);
    Ok(match deadline {
        Some(limit) => {
            debug!(deadline_secs = limit.as_secs(), "run deadline set");
            token.with_timeout(limit)
        }
        None => token,
    })
}
