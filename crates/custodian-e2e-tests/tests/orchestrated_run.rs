//! End-to-end tests for the orchestrated run (custodian-cli).
//!
//! A local HTTP listener stands in for the rotated services and a shell
//! script for `pg_dump`. These tests verify:
//! 1. A full run backs up, rotates, verifies, health-checks and retires
//! 2. A second run keeps the previous versions retiring
//! 3. A held lock stops the run before anything happens
//! 4. An unhealthy rollout stops the run and names the last completed step

#![cfg(unix)]

mod helpers;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use custodian_cli::orchestrator::{Orchestrator, RunStep};
use custodian_cli::{CliError, Config, Context};
use custodian_core::{FailureKind, FileLockManager, LockManager};
use custodian_rotation::{CredentialType, JobOutcome, VersionStatus};
use helpers::*;

/// Local stand-in for the rotated services.
///
/// `/readyz` answers 503 while `unready` is above zero, counting down.
struct FakeService {
    base: String,
    unready: Arc<AtomicU32>,
}

impl FakeService {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let unready = Arc::new(AtomicU32::new(0));
        let countdown = unready.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let is_ready_probe = request.starts_with(b"GET /readyz");
                let failing = is_ready_probe
                    && countdown
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                let status = if failing { "503 Service Unavailable" } else { "200 OK" };
                let _ = write!(stream, "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            }
        });

        Self { base, unready }
    }

    fn fail_next_ready_checks(&self, n: u32) {
        self.unready.store(n, Ordering::SeqCst);
    }
}

fn fake_pg_dump(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("pg_dump");
    std::fs::write(
        &path,
        r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --file=*) printf 'PGDMP\001\016 orders table rows' > "${arg#--file=}" ;;
  esac
done
"#,
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(dir: &Path, service: &FakeService) -> Config {
    let toml = format!(
        r#"
state_dir = "{state}"

[health]
attempts = 2
interval_ms = 10

[backup]
pg_dump = "{pg_dump}"
region_attempts = 1
region_interval_ms = 10

[[backup.sources]]
name = "orders"
system = "postgres"
connection = "postgres://backup@localhost/orders"

[[backup.secondary_regions]]
region = "eu-central-1"
bucket = "custodian-copy"

[[rotation.targets]]
type = "symmetric-key"
secret = "orders-data-key"
service = "orders-api"

[[rotation.targets]]
type = "jwt"
secret = "auth-signing"
service = "auth"

[services.auth]
reload_url = "{base}/reload"
ready_url = "{base}/readyz"

[services.orders-api]
reload_url = "{base}/reload"
ready_url = "{base}/readyz"
live_url = "{base}/livez"
"#,
        state = dir.join("state").display(),
        pg_dump = fake_pg_dump(dir).display(),
        base = service.base,
    );
    Config::from_toml(&toml).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_run_completes_every_step() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::start();
    let context = Context::open(config(dir.path(), &service)).unwrap();

    let report = Orchestrator::new(&context, false).run().await.unwrap();

    assert!(report.failure.is_none(), "{:?}", report.failure);
    assert_eq!(report.last_completed_step, RunStep::Retired);
    assert_eq!(report.backups.len(), 1);
    assert!(!report.backups[0].replication.degraded);
    assert_eq!(report.verifications.len(), 1);
    assert!(report.verifications[0].is_valid());
    assert!(report.finished_at.is_some());

    // Rotation follows the fixed type order, not configuration order.
    let order: Vec<_> = report.rotations.iter().map(|j| j.credential_type).collect();
    assert_eq!(order, vec![CredentialType::Jwt, CredentialType::SymmetricKey]);
    assert!(report.rotations.iter().all(|j| j.outcome == Some(JobOutcome::Success)));
    let services: Vec<_> = report.health.iter().map(|v| v.service.as_str()).collect();
    assert_eq!(services, vec!["auth", "orders-api"]);

    let backup = context.catalog().get(&report.backups[0].artifact.id).unwrap();
    assert!(backup.verified);

    // The lock is released afterwards.
    assert!(context.locks().inspect("custodian").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_run_keeps_previous_versions_retiring() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::start();
    let context = Context::open(config(dir.path(), &service)).unwrap();

    Orchestrator::new(&context, false).run().await.unwrap();
    let second = Orchestrator::new(&context, false).run().await.unwrap();
    assert!(second.failure.is_none(), "{:?}", second.failure);
    assert!(second.retired.is_empty());

    let registry = context.registry().unwrap();
    for credential_type in [CredentialType::Jwt, CredentialType::SymmetricKey] {
        assert_eq!(registry.active(credential_type).unwrap().version, 2);
        let retiring = registry.retiring(credential_type);
        assert_eq!(retiring.len(), 1);
        assert_eq!(retiring[0].status, VersionStatus::Retiring);
    }
    assert_eq!(context.catalog().list().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_held_lock_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::start();
    let context = Context::open(config(dir.path(), &service)).unwrap();

    let other = FileLockManager::new(context.config().lock_dir(), "other-host:7");
    let _token = other.acquire("custodian").unwrap();

    let err = Orchestrator::new(&context, false).run().await.unwrap_err();
    assert!(matches!(err, CliError::Lock(_)));
    assert_eq!(err.kind(), FailureKind::LockHeld);
    assert_eq!(err.exit_code(), 10);
    assert!(context.catalog().list().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unhealthy_rollout_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::start();
    let context = Context::open(config(dir.path(), &service)).unwrap();

    // Both probes of the jwt rollout check fail; the rollback check passes.
    service.fail_next_ready_checks(2);
    let report = Orchestrator::new(&context, false).run().await.unwrap();

    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::RolloutHealthFailed);
    assert_eq!(failure.last_completed, "rolling-back");
    assert_eq!(report.last_completed_step, RunStep::BackedUp);
    assert_eq!(report.rotations.len(), 1);
    assert_eq!(report.rotations[0].outcome, Some(JobOutcome::RolledBack));
    assert!(report.verifications.is_empty());

    let err: CliError = failure.into();
    assert_eq!(err.exit_code(), 16);
    assert!(context.locks().inspect("custodian").unwrap().is_none());
}
