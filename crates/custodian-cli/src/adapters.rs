//! Production collaborators for the rotation controller.
//!
//! - [`HttpDeployment`] reloads services and reads their readiness and
//!   liveness endpoints over HTTP.
//! - [`HttpsCertificateProbe`] completes a TLS handshake against a service
//!   and returns the certificate it presented.
//! - [`PsqlDatabaseAdmin`] manages postgres login roles through `psql`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use custodian_rotation::database::ROLE_SUFFIXES;
use custodian_rotation::{DatabaseAdmin, Deployment, HealthStatus, RotationError, TlsEndpointProbe};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, ServiceConfig};
use crate::error::CliError;

type RotationResult<T> = std::result::Result<T, RotationError>;

fn endpoint<'a>(services: &'a BTreeMap<String, ServiceConfig>, service: &str) -> RotationResult<&'a ServiceConfig> {
    services.get(service).ok_or_else(|| RotationError::Deployment {
        service: service.to_string(),
        reason: "service is not configured".to_string(),
    })
}

/// Deployment driven by per-service HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpDeployment {
    client: reqwest::Client,
    services: BTreeMap<String, ServiceConfig>,
}

impl HttpDeployment {
    /// Creates a deployment over `services`; `timeout` bounds every request.
    pub fn new(services: BTreeMap<String, ServiceConfig>, timeout: Duration) -> Result<Self, CliError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CliError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, services })
    }

    async fn answers(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "probe request failed");
                false
            }
        }
    }
}

#[async_trait]
impl Deployment for HttpDeployment {
    async fn restart_or_reload(&self, service: &str) -> RotationResult<()> {
        let endpoint = endpoint(&self.services, service)?;
        let failed = |reason: String| RotationError::Deployment {
            service: service.to_string(),
            reason,
        };

        self.client
            .post(&endpoint.reload_url)
            .send()
            .await
            .map_err(|e| failed(format!("reload request failed: {e}")))?
            .error_for_status()
            .map_err(|e| failed(format!("reload rejected: {e}")))?;
        info!(service, "reload requested");
        Ok(())
    }

    async fn health(&self, service: &str) -> RotationResult<HealthStatus> {
        let endpoint = endpoint(&self.services, service)?;
        let ready = self.answers(&endpoint.ready_url).await;
        let live = match &endpoint.live_url {
            Some(url) => self.answers(url).await,
            None => ready,
        };
        Ok(HealthStatus { ready, live })
    }
}

/// Reads the certificate a service presents during the TLS handshake.
///
/// The handshake must validate against the system roots or the configured
/// CA root before the certificate is returned.
#[derive(Debug, Clone)]
pub struct HttpsCertificateProbe {
    client: reqwest::Client,
    services: BTreeMap<String, ServiceConfig>,
}

impl HttpsCertificateProbe {
    /// Creates a probe trusting `ca_pem` in addition to the system roots.
    pub fn new(
        services: BTreeMap<String, ServiceConfig>,
        ca_pem: &str,
        timeout: Duration,
    ) -> Result<Self, CliError> {
        let root = reqwest::Certificate::from_pem(ca_pem.as_bytes())
            .map_err(|e| CliError::Config(format!("invalid CA certificate: {e}")))?;
        let client = reqwest::Client::builder()
            .tls_info(true)
            .add_root_certificate(root)
            .timeout(timeout)
            .build()
            .map_err(|e| CliError::Config(format!("failed to build HTTPS client: {e}")))?;
        Ok(Self { client, services })
    }
}

#[async_trait]
impl TlsEndpointProbe for HttpsCertificateProbe {
    async fn presented_certificate(&self, service: &str) -> RotationResult<Vec<u8>> {
        let failed = |reason: String| RotationError::Deployment {
            service: service.to_string(),
            reason,
        };
        let url = endpoint(&self.services, service)?
            .tls_url
            .as_deref()
            .ok_or_else(|| failed("service has no tls_url".to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(format!("TLS handshake failed: {e}")))?;
        response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(reqwest::tls::TlsInfo::peer_certificate)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| failed("no peer certificate presented".to_string()))
    }
}

/// Postgres login administration through `psql`.
///
/// SQL is written to the child's stdin and passwords travel in
/// `PGPASSWORD`, so neither appears in the process list.
#[derive(Debug, Clone)]
pub struct PsqlDatabaseAdmin {
    psql: String,
    admin_dsn: String,
    login_dsn: String,
}

impl PsqlDatabaseAdmin {
    /// Creates an admin from the `[database]` section.
    #[must_use]
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            psql: config.psql.clone(),
            admin_dsn: config.admin_dsn.clone(),
            login_dsn: config.login_dsn.clone(),
        }
    }

    async fn run(&self, dsn: &str, sql: &str, password: Option<&str>) -> std::io::Result<std::process::Output> {
        let mut command = tokio::process::Command::new(&self.psql);
        command
            .args(["--no-psqlrc", "--quiet", "--set=ON_ERROR_STOP=1", "--dbname"])
            .arg(dsn)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = password {
            command.env("PGPASSWORD", password);
        }

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(sql.as_bytes()).await?;
        }
        child.wait_with_output().await
    }

    async fn admin(&self, role: &str, sql: &str) -> RotationResult<()> {
        let failed = |reason: String| RotationError::Database {
            role: role.to_string(),
            reason,
        };
        let output = self
            .run(&self.admin_dsn, sql, None)
            .await
            .map_err(|e| failed(format!("failed to run {}: {e}", self.psql)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        Err(failed(format!("psql exited with {}: {last}", output.status)))
    }
}

fn checked_role(role: &str) -> RotationResult<&str> {
    if !role.is_empty() && role.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(role)
    } else {
        Err(RotationError::Database {
            role: role.to_string(),
            reason: "role names are limited to [a-z0-9_]".to_string(),
        })
    }
}

fn checked_password<'a>(role: &str, password: &'a str) -> RotationResult<&'a str> {
    if password.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(password)
    } else {
        Err(RotationError::Database {
            role: role.to_string(),
            reason: "generated passwords are alphanumeric".to_string(),
        })
    }
}

/// SQL that creates `role` if needed, makes it a member of its base role
/// and sets its password.
#[must_use]
pub fn set_password_sql(role: &str, password: &str) -> String {
    let mut sql = format!(
        "DO $$ BEGIN\n  IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = '{role}') THEN\n    CREATE ROLE \"{role}\" LOGIN;\n  END IF;\nEND $$;\n"
    );
    if let Some(base) = ROLE_SUFFIXES.iter().find_map(|s| role.strip_suffix(s)) {
        sql.push_str(&format!("GRANT \"{base}\" TO \"{role}\";\n"));
    }
    sql.push_str(&format!("ALTER ROLE \"{role}\" WITH LOGIN PASSWORD '{password}';\n"));
    sql
}

/// SQL that stops `role` from logging in and ends its sessions.
#[must_use]
pub fn revoke_login_sql(role: &str) -> String {
    format!(
        "ALTER ROLE \"{role}\" NOLOGIN;\nSELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE usename = '{role}';\n"
    )
}

#[async_trait]
impl DatabaseAdmin for PsqlDatabaseAdmin {
    async fn set_password(&self, role: &str, password: &str) -> RotationResult<()> {
        let role = checked_role(role)?;
        let password = checked_password(role, password)?;
        self.admin(role, &set_password_sql(role, password)).await?;
        info!(role, "login password set");
        Ok(())
    }

    async fn check_login(&self, role: &str, password: &str) -> RotationResult<bool> {
        let role = checked_role(role)?;
        let dsn = format!("{} user={role}", self.login_dsn);
        let output = self
            .run(&dsn, "SELECT 1;\n", Some(password))
            .await
            .map_err(|e| RotationError::Database {
                role: role.to_string(),
                reason: format!("failed to run {}: {e}", self.psql),
            })?;
        debug!(role, ok = output.status.success(), "login check");
        Ok(output.status.success())
    }

    async fn revoke_login(&self, role: &str) -> RotationResult<()> {
        let role = checked_role(role)?;
        self.admin(role, &revoke_login_sql(role)).await?;
        info!(role, "login revoked");
        Ok(())
    }
}
