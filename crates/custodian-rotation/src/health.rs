//! Rollout health verification.
//!
//! After a secret changes, the consuming service is reloaded and probed
//! until it reports ready and live or the attempt budget runs out. Every
//! probe is recorded so a failed rollout can be explained afterwards.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custodian_core::{AttemptError, RetryPolicy, retry_observed};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RotationError};

/// Default deadline for one health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness and liveness of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Accepting traffic.
    pub ready: bool,
    /// Process alive.
    pub live: bool,
}

impl HealthStatus {
    /// Ready and live.
    pub const HEALTHY: Self = Self { ready: true, live: true };

    /// Returns true if the service is ready and live.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.ready && self.live
    }
}

/// Reloads services and reports their health.
#[async_trait]
pub trait Deployment: Send + Sync {
    /// Restarts or reloads `service` so it picks up changed secrets.
    async fn restart_or_reload(&self, service: &str) -> Result<()>;

    /// Current health of `service`.
    async fn health(&self, service: &str) -> Result<HealthStatus>;
}

/// Reads the certificate a service presents during a TLS handshake.
#[async_trait]
pub trait TlsEndpointProbe: Send + Sync {
    /// DER of the leaf certificate presented by `service`.
    async fn presented_certificate(&self, service: &str) -> Result<Vec<u8>>;
}

/// One probe of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutCheck {
    /// Service probed.
    pub service_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
    /// Ready and live.
    pub healthy: bool,
    /// Reported readiness.
    pub ready: bool,
    /// Reported liveness.
    pub live: bool,
    /// What the probe saw, or why it failed.
    pub detail: String,
}

/// Result of verifying a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutVerdict {
    /// Service probed.
    pub service: String,
    /// Whether a probe saw the service ready and live.
    pub healthy: bool,
    /// Every probe, in order.
    pub checks: Vec<RolloutCheck>,
}

impl RolloutVerdict {
    /// One-line account of the probes.
    #[must_use]
    pub fn summary(&self) -> String {
        let attempts = self.checks.len();
        if self.healthy {
            return format!("healthy after {attempts} probe(s)");
        }
        match self.checks.last() {
            Some(last) => format!("unhealthy after {attempts} probe(s); last probe: {}", last.detail),
            None => "never probed".to_string(),
        }
    }

    /// Converts an unhealthy verdict into an error.
    pub fn into_result(self) -> Result<Self> {
        if self.healthy {
            Ok(self)
        } else {
            Err(RotationError::RolloutHealth {
                reason: self.summary(),
                service: self.service,
            })
        }
    }
}

enum ProbeFailure {
    Unhealthy(HealthStatus),
    Error(RotationError),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhealthy(status) => write!(f, "ready={} live={}", status.ready, status.live),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

async fn probe(deployment: &dyn Deployment, service: &str) -> std::result::Result<HealthStatus, ProbeFailure> {
    match deployment.health(service).await {
        Ok(status) if status.is_healthy() => Ok(status),
        Ok(status) => Err(ProbeFailure::Unhealthy(status)),
        Err(e) => Err(ProbeFailure::Error(e)),
    }
}

/// Probes a service after a rollout until it is healthy.
#[derive(Clone)]
pub struct RolloutHealthVerifier {
    deployment: Arc<dyn Deployment>,
    probe_timeout: Duration,
}

impl RolloutHealthVerifier {
    /// Creates a verifier over `deployment`.
    #[must_use]
    pub fn new(deployment: Arc<dyn Deployment>) -> Self {
        Self {
            deployment,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Sets the per-probe deadline.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// The deployment collaborator.
    #[must_use]
    pub fn deployment(&self) -> &Arc<dyn Deployment> {
        &self.deployment
    }

    /// Probes `service` up to `max_attempts` times, `interval` apart,
    /// stopping at the first ready and live probe.
    pub async fn check(&self, service: &str, max_attempts: u32, interval: Duration) -> RolloutVerdict {
        let policy = RetryPolicy::new(max_attempts, interval).with_attempt_timeout(self.probe_timeout);
        let deployment = self.deployment.as_ref();
        let mut checks = Vec::new();

        let outcome = retry_observed(
            &policy,
            move |_| probe(deployment, service),
            |attempt, result| {
                let (status, detail) = match result {
                    Ok(status) => (*status, "ready=true live=true".to_string()),
                    Err(AttemptError::Failed(ProbeFailure::Unhealthy(status))) => {
                        (*status, format!("ready={} live={}", status.ready, status.live))
                    }
                    Err(other) => (HealthStatus::default(), format!("probe failed: {other}")),
                };
                debug!(service, attempt, ready = status.ready, live = status.live, "health probe");
                checks.push(RolloutCheck {
                    service_name: service.to_string(),
                    attempt,
                    timestamp: Utc::now(),
                    healthy: status.is_healthy(),
                    ready: status.ready,
                    live: status.live,
                    detail,
                });
            },
        )
        .await;

        let verdict = RolloutVerdict {
            service: service.to_string(),
            healthy: outcome.is_ok(),
            checks,
        };
        if verdict.healthy {
            info!(service, probes = verdict.checks.len(), "rollout healthy");
        } else {
            warn!(service, summary = %verdict.summary(), "rollout unhealthy");
        }
        verdict
    }
}

impl fmt::Debug for RolloutHealthVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RolloutHealthVerifier")
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeDeployment;

    #[tokio::test(start_paused = true)]
    async fn healthy_on_first_attempt() {
        let deployment = Arc::new(FakeDeployment::healthy());
        let verdict = RolloutHealthVerifier::new(deployment)
            .check("api", 5, Duration::from_secs(2))
            .await;
        assert!(verdict.healthy);
        assert_eq!(verdict.checks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_healthy_after_warmup() {
        let deployment = Arc::new(FakeDeployment::healthy());
        deployment.script(vec![
            HealthStatus { ready: false, live: true },
            HealthStatus { ready: false, live: true },
        ]);
        let verdict = RolloutHealthVerifier::new(deployment)
            .check("api", 5, Duration::from_secs(2))
            .await;
        assert!(verdict.healthy);
        assert_eq!(verdict.checks.len(), 3);
        assert!(!verdict.checks[0].ready);
        assert!(verdict.checks[2].ready);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_when_never_ready() {
        let deployment = Arc::new(FakeDeployment::unhealthy());
        let verdict = RolloutHealthVerifier::new(deployment)
            .check("api", 3, Duration::from_secs(1))
            .await;
        assert!(!verdict.healthy);
        assert_eq!(verdict.checks.len(), 3);
        assert!(verdict.summary().contains("ready=false"));

        let err = verdict.into_result().expect_err("unhealthy");
        assert!(matches!(err, RotationError::RolloutHealth { ref service, .. } if service == "api"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_check_counts_as_failed_attempt() {
        let deployment = Arc::new(FakeDeployment::stalled());
        let verdict = RolloutHealthVerifier::new(deployment)
            .with_probe_timeout(Duration::from_secs(1))
            .check("api", 2, Duration::from_millis(10))
            .await;
        assert!(!verdict.healthy);
        assert_eq!(verdict.checks.len(), 2);
        assert!(verdict.checks.iter().all(|c| c.detail.starts_with("probe failed")));
    }
}
