//! Drift-compensated background refresh loop.
//!
//! The loop sleeps a jittered base interval between iterations and
//! measures how late each iteration actually starts. Sustained lateness
//! (drift) means the process was starved or suspended, so the loop tightens
//! its own schedule once and widens refresh thresholds until timing
//! recovers. Per-user failures never stop the loop or affect other users.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::client::{TokenOutcome, remaining_secs};
use super::format_duration;
use super::manager::{TokenManager, TokenState, UserEntry};

/// Forced refresh attempts allowed while an expiry stays unknown.
const MAX_FORCED_UNKNOWN_ATTEMPTS: u32 = 3;

/// Triage of a token's health for one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenHealth {
    /// Nothing to do beyond the normal threshold check.
    Healthy,
    /// Approaching expiry under drift, or expiry unknown; worth watching.
    Degraded,
    /// Expired, about to expire under drift, or unknown despite repeated
    /// forced attempts; refresh immediately.
    Critical,
}

/// Classify a token for this iteration.
///
/// `remaining` is the signed remaining lifetime (`None` when the expiry is
/// unknown), `unknown_attempts` counts forced refreshes spent trying to
/// resolve an unknown expiry, and `drift` is the current loop lateness.
#[must_use]
pub fn assess_token_health(
    remaining: Option<f64>,
    unknown_attempts: u32,
    drift: f64,
    refresh_threshold: f64,
) -> TokenHealth {
    let Some(remaining) = remaining else {
        // Unknown expiry that has resisted the resolution protocol is no
        // longer merely suspicious.
        if unknown_attempts >= MAX_FORCED_UNKNOWN_ATTEMPTS {
            return TokenHealth::Critical;
        }
        return TokenHealth::Degraded;
    };

    if remaining <= 0.0 || (remaining <= 300.0 && drift > 60.0) {
        return TokenHealth::Critical;
    }
    if remaining <= refresh_threshold && drift > 30.0 {
        return TokenHealth::Degraded;
    }
    TokenHealth::Healthy
}

/// Refresh threshold widened for drift: lose up to half the drift, capped
/// at 30% of the base threshold, and half again when proactive mode is
/// forced.
fn trigger_threshold(base_threshold: f64, force_proactive: bool, drift: f64) -> f64 {
    let compensated = if drift > 0.0 {
        base_threshold - (drift * 0.5).min(base_threshold * 0.3)
    } else {
        base_threshold
    };
    if force_proactive {
        compensated * 1.5
    } else {
        compensated
    }
}

/// Whether a refresh triggered only by the widened proactive threshold
/// should be forced (so the skip-fast path cannot ignore it).
fn should_force_due_to_drift(
    force_proactive: bool,
    drift: f64,
    remaining: f64,
    base_threshold: f64,
) -> bool {
    force_proactive
        && drift > 60.0
        && remaining > base_threshold
        && remaining <= base_threshold * 2.0
}

/// One-shot shortened sleep applied after sustained drift.
fn corrected_sleep(base: f64, drift: f64) -> f64 {
    (base - drift * 0.5).max(base * 0.3)
}

pub(super) async fn run(manager: Arc<TokenManager>) {
    let base = manager.config.background_base_sleep.as_secs_f64();
    let mut last_loop = Instant::now();
    let mut consecutive_drift: u32 = 0;
    let mut correction_applied = false;

    while manager.is_running() {
        let now = Instant::now();
        let drift = (now - last_loop).as_secs_f64();
        let drifted = drift > base * 3.0;

        let sleep_duration = if drifted {
            consecutive_drift += 1;
            tracing::warn!(
                drift_secs = drift as u64,
                base_secs = base as u64,
                consecutive = consecutive_drift,
                "Token manager loop drift detected"
            );
            if consecutive_drift >= 3 && !correction_applied {
                let corrected = corrected_sleep(base, drift);
                tracing::info!(
                    sleep_secs = format!("{corrected:.1}"),
                    drift_secs = drift as u64,
                    "Applied drift correction to loop sleep"
                );
                correction_applied = true;
                corrected
            } else {
                base
            }
        } else {
            consecutive_drift = 0;
            correction_applied = false;
            base
        };

        let users: Vec<(String, Arc<UserEntry>)> = {
            let tokens = manager.tokens.read().await;
            let paused = manager.paused.lock().await;
            tokens
                .iter()
                .filter(|(name, _)| !paused.contains(*name))
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };

        for (username, entry) in users {
            if let Err(e) =
                process_single(&manager, &username, &entry, drifted, drift).await
            {
                tracing::error!(
                    user = %username,
                    error = %e,
                    drift_secs = drift as u64,
                    "Background refresh error, continuing with other users"
                );
            }
        }

        last_loop = now;
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        if !cancellable_sleep(&manager, Duration::from_secs_f64(sleep_duration * jitter)).await {
            break;
        }
    }
    tracing::debug!("Token manager background loop exited");
}

/// Sleep that aborts early on the manager's stop signal. Returns `false`
/// when the loop should exit.
async fn cancellable_sleep(manager: &TokenManager, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => manager.is_running(),
        () = manager.stop_signal.notified() => false,
    }
}

async fn process_single(
    manager: &Arc<TokenManager>,
    username: &str,
    entry: &Arc<UserEntry>,
    force_proactive: bool,
    drift: f64,
) -> crate::error::RuntimeResult<()> {
    let threshold = manager.config.refresh_threshold.as_secs_f64();

    let (remaining, unknown_attempts) = {
        let data = entry.data.lock().await;
        (data.expiry.map(remaining_secs), data.forced_unknown_attempts)
    };
    log_remaining(username, remaining);

    match assess_token_health(remaining, unknown_attempts, drift, threshold) {
        TokenHealth::Critical => {
            tracing::warn!(
                user = username,
                remaining_secs = remaining.map(|r| r as i64),
                drift_secs = format!("{drift:.1}"),
                "Critical token health, forcing refresh"
            );
            manager.ensure_fresh(username, true).await?;
            return Ok(());
        }
        TokenHealth::Degraded => {
            tracing::info!(
                user = username,
                remaining_secs = remaining.map(|r| r as i64),
                drift_secs = format!("{drift:.1}"),
                "Degraded token health"
            );
        }
        TokenHealth::Healthy => {}
    }

    let Some(remaining) = resolve_unknown_or_validate(manager, username, entry, remaining).await
    else {
        return Ok(());
    };

    if remaining < 0.0 {
        entry.data.lock().await.state = TokenState::Expired;
        tracing::warn!(
            user = username,
            remaining_secs = remaining as i64,
            "Unexpected expired state detected"
        );
        manager.ensure_fresh(username, true).await?;
        return Ok(());
    }

    let trigger = trigger_threshold(threshold, force_proactive, drift);
    if remaining <= trigger {
        if should_force_due_to_drift(force_proactive, drift, remaining, threshold) {
            manager.ensure_fresh(username, true).await?;
        } else {
            manager.ensure_fresh(username, false).await?;
        }
    }
    Ok(())
}

/// Resolve an unknown expiry, or run the periodic remote validation when
/// due. Returns the (possibly updated) remaining seconds, `None` when the
/// expiry is still unknown.
async fn resolve_unknown_or_validate(
    manager: &Arc<TokenManager>,
    username: &str,
    entry: &Arc<UserEntry>,
    remaining: Option<f64>,
) -> Option<f64> {
    let expiry_known = entry.data.lock().await.expiry.is_some();
    if !expiry_known {
        handle_unknown_expiry(manager, username, entry).await;
        return entry.data.lock().await.expiry.map(remaining_secs);
    }

    let validation_due = {
        let data = entry.data.lock().await;
        match data.last_validation {
            Some(last) => last.elapsed() >= manager.config.periodic_validation_interval,
            None => true,
        }
    };
    if !validation_due {
        return remaining;
    }

    match manager.validate(username).await {
        Ok(TokenOutcome::Valid) => {
            let updated = entry.data.lock().await.expiry.map(remaining_secs);
            if let Some(updated) = updated {
                tracing::info!(
                    user = username,
                    remaining = %format_duration(updated.max(0.0) as u64),
                    "Periodic remote token validation ok"
                );
            }
            updated
        }
        Ok(_) => {
            let pre = entry.data.lock().await.expiry.map(remaining_secs);
            tracing::error!(
                user = username,
                remaining_secs = pre.map(|r| r as i64),
                "Periodic remote token validation failed, forcing refresh"
            );
            let outcome = manager.ensure_fresh(username, true).await;
            let post = entry.data.lock().await.expiry.map(remaining_secs);
            tracing::info!(
                user = username,
                outcome = ?outcome,
                remaining_secs = post.map(|r| r as i64),
                "Forced refresh after failed periodic validation"
            );
            post
        }
        Err(e) => {
            tracing::warn!(
                user = username,
                error = %e,
                "Periodic remote token validation error"
            );
            entry.data.lock().await.expiry.map(remaining_secs)
        }
    }
}

/// Resolve an unknown expiry: one un-forced attempt, then up to three
/// forced attempts with exponential backoff. The attempt counter resets on
/// success and caps the backoff exponent.
async fn handle_unknown_expiry(
    manager: &Arc<TokenManager>,
    username: &str,
    entry: &Arc<UserEntry>,
) {
    let outcome = match manager.ensure_fresh(username, false).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!(user = username, error = %e, "Unknown-expiry probe error");
            TokenOutcome::Failed
        }
    };

    let still_unknown = entry.data.lock().await.expiry.is_none();
    if still_unknown {
        let attempt = {
            let mut data = entry.data.lock().await;
            if data.forced_unknown_attempts < MAX_FORCED_UNKNOWN_ATTEMPTS {
                data.forced_unknown_attempts += 1;
            }
            data.forced_unknown_attempts
        };
        let base = manager.config.background_base_sleep.as_secs_f64();
        let delay = base * f64::from(1u32 << (attempt - 1));
        if !cancellable_sleep(manager, Duration::from_secs_f64(delay)).await {
            return;
        }

        let forced = manager.ensure_fresh(username, true).await;
        match forced {
            Ok(TokenOutcome::Failed) | Err(_) => {
                tracing::warn!(
                    user = username,
                    attempt,
                    "Forced refresh attempt failed resolving unknown expiry"
                );
            }
            Ok(_) => {
                tracing::info!(
                    user = username,
                    attempt,
                    "Forced refresh resolved unknown expiry"
                );
                entry.data.lock().await.forced_unknown_attempts = 0;
            }
        }
    } else {
        entry.data.lock().await.forced_unknown_attempts = 0;
    }

    if outcome == TokenOutcome::Failed && entry.data.lock().await.expiry.is_none() {
        tracing::warn!(user = username, "Validation failed with unknown expiry");
    }
}

fn log_remaining(username: &str, remaining: Option<f64>) {
    let Some(remaining) = remaining else {
        tracing::debug!(user = username, "Token expiry unknown, will validate or refresh");
        return;
    };
    let secs = remaining as i64;
    tracing::debug!(
        user = username,
        remaining = %format_duration(secs.max(0) as u64),
        remaining_secs = secs,
        "Access token validity"
    );
}
