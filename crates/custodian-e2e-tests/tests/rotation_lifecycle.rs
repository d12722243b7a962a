//! End-to-end tests for credential rotation (custodian-rotation, custodian-crypto).
//!
//! These tests verify:
//! 1. Tokens signed with the previous JWT key stay valid through the grace window
//! 2. A failed rollout health check rolls the secret back to its previous contents
//! 3. Old data keys keep decrypting after a symmetric key rotation
//! 4. The registry never holds more than one active version per type

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use custodian_core::FailureKind;
use custodian_crypto::jwt::public_key_field;
use custodian_crypto::{JwtSigner, JwtVerifier, TokenClaims, VersionedKeyring};
use custodian_rotation::{CredentialType, JobOutcome, RotationError, RotationState, VersionStatus};
use helpers::*;
use proptest::prelude::*;

fn status_of(h: &RotationHarness, credential_type: CredentialType, version: u32) -> Option<VersionStatus> {
    h.controller
        .registry()
        .versions(credential_type)
        .into_iter()
        .find(|v| v.version == version)
        .map(|v| v.status)
}

// ============================================================================
// JWT Grace Window
// ============================================================================

#[tokio::test]
async fn test_jwt_v1_tokens_valid_through_grace_then_rejected() {
    init_tracing();
    let h = RotationHarness::new();
    let target = RotationHarness::jwt_target();

    let first = h.controller.rotate(&h.token, &target).await.unwrap();
    assert_eq!(first.outcome, Some(JobOutcome::Success));
    let v1_token = JwtSigner::from_fields(&h.fields(&target).await)
        .unwrap()
        .sign(&TokenClaims::new("user-42", "auth", ChronoDuration::hours(2)))
        .unwrap();

    let second = h.controller.rotate(&h.token, &target).await.unwrap();
    assert_eq!(second.outcome, Some(JobOutcome::Success));
    assert_eq!(second.version, Some(2));

    // New tokens are signed with v2; v1 tokens still verify.
    let fields = h.fields(&target).await;
    let signer = JwtSigner::from_fields(&fields).unwrap();
    assert_eq!(signer.kid(), "v2");
    let verifier = JwtVerifier::from_fields(&fields).unwrap();
    let claims: TokenClaims = verifier.verify(&v1_token).unwrap();
    assert_eq!(claims.sub, "user-42");
    assert_eq!(status_of(&h, CredentialType::Jwt, 1), Some(VersionStatus::Retiring));

    // Within the grace window nothing is retired.
    let early = h
        .controller
        .retire_expired(&h.token, &[target.clone()], Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert!(early.is_empty());
    assert!(h.fields(&target).await.contains_key(&public_key_field("v1")));

    // After the grace window v1 is gone and its tokens are rejected.
    let retired = h
        .controller
        .retire_expired(&h.token, &[target.clone()], Utc::now() + ChronoDuration::hours(25))
        .await
        .unwrap();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].version, 1);
    assert_eq!(status_of(&h, CredentialType::Jwt, 1), Some(VersionStatus::Retired));

    let fields = h.fields(&target).await;
    assert!(!fields.contains_key(&public_key_field("v1")));
    let verifier = JwtVerifier::from_fields(&fields).unwrap();
    assert!(verifier.verify::<TokenClaims>(&v1_token).is_err());
    let v2_token = JwtSigner::from_fields(&fields)
        .unwrap()
        .sign(&TokenClaims::new("user-42", "auth", ChronoDuration::hours(2)))
        .unwrap();
    assert!(verifier.verify::<TokenClaims>(&v2_token).is_ok());
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn test_health_failure_rolls_back_to_previous_secret() {
    let h = RotationHarness::new();
    let target = RotationHarness::jwt_target();
    h.controller.rotate(&h.token, &target).await.unwrap();
    let before = h.fields(&target).await;
    let reloads_before = h.deployment.reloads();

    // Every probe of the rollout check fails; the service recovers once the
    // previous secret is back.
    h.deployment.script(std::iter::repeat_n(UNREADY, HEALTH_ATTEMPTS as usize));
    let job = h.controller.rotate(&h.token, &target).await.unwrap();

    assert_eq!(job.outcome, Some(JobOutcome::RolledBack));
    let failure = job.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::RolloutHealthFailed);
    assert_eq!(failure.state, RotationState::Verifying);
    assert_eq!(job.last_completed_state(), Some(RotationState::RollingBack));

    assert_eq!(h.fields(&target).await, before);
    assert_eq!(status_of(&h, CredentialType::Jwt, 1), Some(VersionStatus::Active));
    assert!(h.controller.registry().staged(CredentialType::Jwt).is_none());
    // Rollout reload plus rollback reload.
    assert_eq!(h.deployment.reloads(), reloads_before + 2);

    let journal = h.controller.journal().list();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[1].outcome, Some(JobOutcome::RolledBack));

    // The next rotation goes through.
    let retry = h.controller.rotate(&h.token, &target).await.unwrap();
    assert_eq!(retry.outcome, Some(JobOutcome::Success));
}

#[tokio::test]
async fn test_failed_rollback_leaves_a_staged_version_until_abandoned() {
    let h = RotationHarness::new();
    let target = RotationHarness::jwt_target();
    h.controller.rotate(&h.token, &target).await.unwrap();

    h.deployment.set_default(UNREADY);
    let job = h.controller.rotate(&h.token, &target).await.unwrap();
    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    assert_eq!(job.failure.as_ref().unwrap().kind, FailureKind::RollbackFailed);

    let blocked = h.controller.rotate(&h.token, &target).await.unwrap_err();
    assert!(matches!(blocked, RotationError::ConcurrentRotation { .. }));

    h.deployment.set_default(custodian_rotation::HealthStatus::HEALTHY);
    let abandoned = h.controller.abandon_staged(CredentialType::Jwt).unwrap().unwrap();
    assert_eq!(abandoned.version, 2);
    let job = h.controller.rotate(&h.token, &target).await.unwrap();
    assert_eq!(job.outcome, Some(JobOutcome::Success));
}

// ============================================================================
// Symmetric Keys
// ============================================================================

#[tokio::test]
async fn test_old_ciphertexts_decrypt_after_key_rotation() {
    let h = RotationHarness::new();
    let target = RotationHarness::dek_target();
    h.controller.rotate(&h.token, &target).await.unwrap();

    let fields = h.fields(&target).await;
    let sealed = VersionedKeyring::from_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
        .unwrap()
        .encrypt(b"card ending 4242")
        .unwrap();

    h.controller.rotate(&h.token, &target).await.unwrap();
    let fields = h.fields(&target).await;
    let keyring = VersionedKeyring::from_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))).unwrap();
    assert_eq!(keyring.active_version(), 2);
    assert_eq!(keyring.decrypt(&sealed).unwrap(), b"card ending 4242");
}

// ============================================================================
// Registry Invariant
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_at_most_one_active_version(healthy in proptest::collection::vec(any::<bool>(), 1..6)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let h = RotationHarness::new();
            let target = RotationHarness::jwt_target();
            let mut successes = 0u32;

            for ok in healthy {
                if !ok {
                    h.deployment.script(std::iter::repeat_n(UNREADY, HEALTH_ATTEMPTS as usize));
                }
                let job = h.controller.rotate(&h.token, &target).await.unwrap();
                if job.outcome == Some(JobOutcome::Success) {
                    successes += 1;
                }

                let versions = h.controller.registry().versions(CredentialType::Jwt);
                let active: Vec<_> = versions.iter().filter(|v| v.status == VersionStatus::Active).collect();
                prop_assert!(active.len() <= 1);
                prop_assert_eq!(active.len(), usize::from(successes > 0));
                prop_assert!(versions.iter().all(|v| v.status != VersionStatus::Staged));
                prop_assert!(versions.windows(2).all(|w| w[0].version < w[1].version));
            }
            Ok(())
        })?;
    }
}
