//! Link supervision and reconnection
//!
//! The supervisor task waits on the current receive loop. When the loop ends
//! because the link failed, it fails outstanding requests, then dials the
//! transport again under a bounded exponential backoff. Subscriptions live in
//! the connection, not the link, so they carry over untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::LinkError;
use crate::config::BackoffPolicy;
use crate::connection::Shared;
use crate::receiver::ReceiverExit;
use crate::stats::Counters;
use crate::types::LinkState;

/// Delay schedule for reconnection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    started: Instant,
}

impl Backoff {
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self { policy: policy.clone(), attempts: 0, started: Instant::now() }
    }

    /// Delay before the next attempt, or `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled || self.attempts >= self.policy.max_attempts {
            return None;
        }
        let elapsed = self.started.elapsed();
        let max_elapsed = Duration::from_millis(self.policy.max_elapsed_ms);
        if elapsed >= max_elapsed {
            return None;
        }

        let scaled = self.policy.initial_delay_ms as f64 * self.policy.multiplier.powi(self.attempts as i32);
        let capped = scaled.min(self.policy.max_delay_ms as f64);
        self.attempts += 1;

        let delay = Duration::from_millis(capped as u64);
        // Never sleep past the overall budget
        Some(delay.min(max_elapsed - elapsed))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Watch receive loops for the lifetime of the connection.
pub(crate) async fn supervise(shared: Arc<Shared>, first: JoinHandle<ReceiverExit>) {
    info!("Link supervisor started");
    let mut receiver = first;

    loop {
        let exit = match receiver.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "Receive loop aborted");
                ReceiverExit::LinkLost(LinkError::link_lost("receive loop aborted"))
            }
        };
        if shared.cancel.is_cancelled() {
            debug!("Connection closing, supervisor stopping");
            break;
        }

        match &exit {
            ReceiverExit::LinkLost(e) => warn!(error = %e, "Robot link lost"),
            ReceiverExit::Cancelled => warn!("Robot link dropped after a write failure"),
        }
        shared.detach().await;

        if !shared.config.reconnect.enabled {
            info!("Reconnection disabled");
            break;
        }
        shared.state.send_replace(LinkState::Reconnecting);

        match reconnect(&shared).await {
            Some(next) => receiver = next,
            None => break,
        }
    }

    shared.finish().await;
    info!("Link supervisor ended");
}

/// Dial until a link comes up and checks out, or the backoff runs out.
async fn reconnect(shared: &Arc<Shared>) -> Option<JoinHandle<ReceiverExit>> {
    let mut backoff = Backoff::new(&shared.config.reconnect);
    let locator = shared.transport.locator();

    loop {
        let Some(delay) = backoff.next_delay() else {
            warn!(%locator, attempts = backoff.attempts(), "Giving up on reconnection");
            return None;
        };
        tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = backoff.attempts();
        let connected = tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            result = shared.transport.connect(shared.config.connect_timeout()) => result,
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                debug!(%locator, attempt, error = %e, "Reconnect attempt failed");
                continue;
            }
        };

        let receiver = shared.attach(link).await;
        match shared.revalidate_identity().await {
            Ok(()) => {}
            Err(e @ LinkError::IdentityMismatch { .. }) => {
                error!(%locator, error = %e, "Reconnected to a different robot");
                shared.drop_link().await;
                let _ = receiver.await;
                return None;
            }
            Err(e) => {
                debug!(%locator, attempt, error = %e, "Identity check failed, retrying");
                shared.drop_link().await;
                let _ = receiver.await;
                continue;
            }
        }

        shared.state.send_replace(LinkState::Connected);
        Counters::bump(&shared.counters().reconnects);
        info!(%locator, attempt, "Robot link re-established");
        shared.resubscribe().await;
        return Some(receiver);
    }
}
