//! Waiting for a freshly started target to accept requests.
//!
//! The probe sends `health` and retries with bounded, jittered exponential
//! backoff until a success arrives or the deadline passes. Replies to
//! earlier, timed-out probes may still show up later; they carry a lower id
//! and are discarded so that pairing stays aligned for the workflow.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{RpcClient, RpcTransport, TransportError};

/// Default liveness method used by the probe.
pub const HEALTH_METHOD: &str = "health";

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessPolicy {
    /// Sleep for a constant duration and hope the target is listening.
    FixedDelay(Duration),
    /// Actively probe until the target answers.
    Probe(ProbePolicy),
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::Probe(ProbePolicy::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbePolicy {
    pub method: String,
    /// How long to wait for each probe's reply before re-probing.
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up after this much total time.
    pub deadline: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            method: HEALTH_METHOD.to_string(),
            attempt_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            deadline: Duration::from_secs(30),
        }
    }
}

impl ProbePolicy {
    /// Backoff before probe number `attempt` (1-based), before jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("target not ready after {attempts} probe(s) in {elapsed:?}: {last}")]
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        last: String,
    },

    #[error("target stream failed while probing: {0}")]
    Transport(#[source] TransportError),
}

/// How readiness was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub attempts: u32,
    pub waited: Duration,
}

/// Apply `policy` against the target behind `client`.
pub async fn await_ready<T: RpcTransport>(
    client: &mut RpcClient<T>,
    policy: &ReadinessPolicy,
) -> Result<ReadinessReport, ReadinessError> {
    match policy {
        ReadinessPolicy::FixedDelay(delay) => {
            crate::supervisor::await_ready(*delay).await;
            Ok(ReadinessReport {
                attempts: 0,
                waited: *delay,
            })
        }
        ReadinessPolicy::Probe(probe) => run_probe(client, probe).await,
    }
}

async fn run_probe<T: RpcTransport>(
    client: &mut RpcClient<T>,
    policy: &ProbePolicy,
) -> Result<ReadinessReport, ReadinessError> {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let request = client
            .send(&policy.method, None)
            .await
            .map_err(|e| ReadinessError::Transport(e.source))?;

        let remaining = policy.deadline.saturating_sub(started.elapsed());
        let wait = policy.attempt_timeout.min(remaining.max(Duration::from_millis(1)));
        let attempt_started = Instant::now();

        // Read until our reply shows up, dropping stale replies to earlier
        // probes, or until this attempt's window closes.
        let last = loop {
            let budget = wait.saturating_sub(attempt_started.elapsed());
            match client.receive(Some(budget)).await {
                Ok(resp) if resp.id < request.id => {
                    debug!(stale_id = resp.id, "discarding reply to earlier probe");
                    continue;
                }
                Ok(resp) if resp.id > request.id => {
                    return Err(ReadinessError::Transport(TransportError::Mismatch {
                        expected: request.id,
                        actual: resp.id,
                    }));
                }
                Ok(resp) => {
                    if resp.is_success() {
                        let waited = started.elapsed();
                        info!(attempts, waited_ms = waited.as_millis() as u64, "target is ready");
                        return Ok(ReadinessReport { attempts, waited });
                    }
                    break resp
                        .error()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "error response".to_string());
                }
                Err(TransportError::Timeout(_)) => break format!("no reply within {wait:?}"),
                Err(e) => return Err(ReadinessError::Transport(e)),
            }
        };

        let elapsed = started.elapsed();
        if elapsed >= policy.deadline {
            return Err(ReadinessError::DeadlineExceeded {
                attempts,
                elapsed,
                last,
            });
        }

        let base = policy.backoff_for(attempts);
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
        let delay = (base + Duration::from_millis(jitter_ms))
            .min(policy.deadline.saturating_sub(elapsed));
        warn!(attempts, delay_ms = delay.as_millis() as u64, last = %last, "target not ready yet");
        tokio::time::sleep(delay).await;
    }
}
