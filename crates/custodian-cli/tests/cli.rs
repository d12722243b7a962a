//! Black-box tests of the `custodian` binary.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use custodian_core::{FileLockManager, LockManager};
use predicates::prelude::*;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("custodian.toml")
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn fake_pg_dump(&self) -> PathBuf {
        self.script(
            "pg_dump",
            r#"for arg in "$@"; do
  case "$arg" in
    --file=*) printf 'PGDMP\001\016 fake rows for the orders table' > "${arg#--file=}" ;;
  esac
done"#,
        )
    }

    fn write_config(&self, pg_dump: &Path, service_base: &str) {
        let config = format!(
            r#"
state_dir = "{state}"

[lock]
ttl_minutes = 5

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
type = "jwt"
secret = "auth-signing"
service = "auth"

[services.auth]
reload_url = "{service_base}/reload"
ready_url = "{service_base}/readyz"
"#,
            state = self.state_dir().display(),
            pg_dump = pg_dump.display(),
        );
        std::fs::write(self.config_path(), config).expect("write config");
    }

    fn custodian(&self) -> Command {
        let mut cmd = Command::cargo_bin("custodian").expect("binary");
        cmd.arg("--config").arg(self.config_path()).env("RUST_LOG", "warn");
        cmd
    }
}

/// Answers every request, 200 unless the path is `/readyz` and `ready` is false.
fn serve(ready: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
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
            let head = String::from_utf8_lossy(&request);
            let status = if head.starts_with("GET /readyz") && !ready {
                "503 Service Unavailable"
            } else {
                "200 OK"
            };
            let _ = write!(stream, "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        }
    });
    format!("http://{addr}")
}

const UNREACHABLE: &str = "http://127.0.0.1:9";

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = Command::cargo_bin("custodian").expect("binary");
    cmd.arg("--help").assert().success().stdout(
        predicate::str::contains("backup")
            .and(predicate::str::contains("rotate"))
            .and(predicate::str::contains("verify"))
            .and(predicate::str::contains("retention-sweep"))
            .and(predicate::str::contains("retry-replication"))
            .and(predicate::str::contains("retire-expired"))
            .and(predicate::str::contains("unlock"))
            .and(predicate::str::contains("status")),
    );
}

#[test]
fn missing_config_is_an_internal_failure() {
    let ws = Workspace::new();
    ws.custodian()
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn status_of_a_fresh_state_dir() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);
    ws.custodian()
        .args(["--format", "json", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"backups\": []"));
}

#[test]
fn held_lock_fails_fast_with_lock_held() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);
    let other = FileLockManager::new(ws.state_dir().join("locks"), "other-host:42");
    let _token = other.acquire("custodian").expect("acquire");

    ws.custodian()
        .args(["backup", "orders"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("LockHeld"));

    ws.custodian()
        .arg("unlock")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("other-host:42"));

    ws.custodian().args(["unlock", "--force"]).assert().success();
    ws.custodian().args(["backup", "orders"]).assert().success();
}

#[test]
fn backup_then_verify() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);

    let output = ws
        .custodian()
        .args(["--format", "json", "backup", "orders"])
        .output()
        .expect("run backup");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    let id = report["artifact"]["id"].as_str().expect("artifact id").to_string();
    assert_eq!(report["replication"]["degraded"], false);

    ws.custodian()
        .args(["verify", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));

    ws.custodian()
        .args(["--format", "json", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));
}

#[test]
fn failing_dump_exits_with_dump_failed() {
    let ws = Workspace::new();
    let pg_dump = ws.script("pg_dump", "echo 'connection refused' >&2\nexit 2");
    ws.write_config(&pg_dump, UNREACHABLE);

    ws.custodian()
        .args(["backup", "orders"])
        .assert()
        .code(11)
        .stderr(predicate::str::contains("Error [DumpFailed]"))
        .stderr(predicate::str::contains("after step 'started'"))
        .stderr(predicate::str::contains("connection refused"));
}

#[test]
fn verify_of_an_unknown_backup_names_the_step() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);
    ws.custodian()
        .args(["verify", "postgres-missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("after step 'started'"))
        .stderr(predicate::str::contains("postgres-missing"));
}

#[test]
fn unknown_source_is_rejected() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);
    ws.custodian().args(["backup", "billing"]).assert().code(1);
}

#[test]
fn unknown_credential_type_is_rejected() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);
    ws.custodian().args(["rotate", "ssh-key"]).assert().code(1);
}

#[test]
fn jwt_rotation_against_a_healthy_service() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), &serve(true));

    ws.custodian()
        .args(["--format", "json", "rotate", "jwt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\""));

    ws.custodian()
        .args(["--format", "json", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": 1"));
}

#[test]
fn unhealthy_service_leaves_a_staged_version_to_abandon() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), &serve(false));

    // Health never recovers, so the rollback's own health check fails too.
    ws.custodian()
        .args(["rotate", "jwt"])
        .assert()
        .code(17)
        .stderr(predicate::str::contains("RollbackFailed"));

    ws.custodian().args(["rotate", "jwt"]).assert().failure();

    ws.custodian()
        .args(["--format", "json", "rotate", "jwt", "--abandon-staged"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": 1"));
}

#[test]
fn retention_sweep_of_an_empty_catalog() {
    let ws = Workspace::new();
    ws.write_config(&ws.fake_pg_dump(), UNREACHABLE);
    ws.custodian()
        .args(["--format", "json", "retention-sweep", "--classification", "daily"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"classification\": \"daily\""));

    ws.custodian()
        .args(["retention-sweep", "--classification", "hourly"])
        .assert()
        .code(1);
}
