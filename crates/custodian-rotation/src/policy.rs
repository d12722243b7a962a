//! Per-type rotation policy.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::types::CredentialType;

/// How new material reaches consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The new version is added beside the old one; both stay valid until
    /// the grace window ends.
    DualKey,
    /// The new version replaces the old one in place.
    ReplaceInPlace,
}

/// Rotation policy of one credential type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    /// How long the previous version stays valid after activation.
    pub grace: Duration,
    /// How material is rolled out.
    pub strategy: Strategy,
    /// Health probes before a rollout is declared failed.
    pub health_attempts: u32,
    /// Delay between health probes.
    pub health_interval: StdDuration,
}

impl RotationPolicy {
    /// The built-in policy for `credential_type`.
    ///
    /// JWT keys keep the old public key for the maximum token lifetime plus
    /// clock skew; data keys stay readable for 30 days; database roles
    /// overlap for 15 minutes; certificates are replaced with no overlap.
    #[must_use]
    pub fn default_for(credential_type: CredentialType) -> Self {
        let (grace, strategy) = match credential_type {
            CredentialType::Jwt => (Duration::hours(24) + Duration::minutes(5), Strategy::DualKey),
            CredentialType::SymmetricKey => (Duration::days(30), Strategy::DualKey),
            CredentialType::DbPassword => (Duration::minutes(15), Strategy::ReplaceInPlace),
            CredentialType::TlsCert => (Duration::zero(), Strategy::ReplaceInPlace),
        };
        Self {
            grace,
            strategy,
            health_attempts: 10,
            health_interval: StdDuration::from_secs(6),
        }
    }
}

/// Policies for every credential type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    policies: BTreeMap<CredentialType, RotationPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            policies: CredentialType::ROTATION_ORDER
                .into_iter()
                .map(|t| (t, RotationPolicy::default_for(t)))
                .collect(),
        }
    }
}

impl PolicySet {
    /// The policy for `credential_type`.
    #[must_use]
    pub fn for_type(&self, credential_type: CredentialType) -> RotationPolicy {
        self.policies
            .get(&credential_type)
            .cloned()
            .unwrap_or_else(|| RotationPolicy::default_for(credential_type))
    }

    /// Overrides the grace window of one type.
    #[must_use]
    pub fn with_grace(mut self, credential_type: CredentialType, grace: Duration) -> Self {
        self.policies
            .entry(credential_type)
            .or_insert_with(|| RotationPolicy::default_for(credential_type))
            .grace = grace;
        self
    }

    /// Sets the health probe budget of every type.
    #[must_use]
    pub fn with_health(mut self, attempts: u32, interval: StdDuration) -> Self {
        for policy in self.policies.values_mut() {
            policy.health_attempts = attempts;
            policy.health_interval = interval;
        }
        self
    }
}
