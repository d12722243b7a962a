//! System-wide mutual exclusion for rotation workflows.
//!
//! A lock is a well-known resource created with an atomic
//! create-if-absent. A second [`LockManager::acquire`] while the resource
//! exists fails fast with [`LockError::AlreadyLocked`]; it never blocks.
//!
//! Every lock carries an expiry. A holder that crashed leaves a stale
//! lock behind, which the next caller takes over once the TTL has passed.
//! Long-running holders call [`LockManager::renew`] to push the expiry out.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::failure::FailureKind;

/// Default time-to-live of a lock.
pub const DEFAULT_TTL_MINUTES: i64 = 30;

/// Errors returned by a [`LockManager`].
#[derive(Debug, Error)]
pub enum LockError {
    /// The scope is already locked by a live holder.
    #[error("lock '{scope}' is held by {holder} since {acquired_at}")]
    AlreadyLocked {
        /// The contended scope.
        scope: String,
        /// Identity recorded by the current holder.
        holder: String,
        /// When the current holder acquired the lock.
        acquired_at: DateTime<Utc>,
    },

    /// The token does not match the lock currently held for its scope.
    #[error("lock '{scope}' is held by another token")]
    NotHolder {
        /// The scope.
        scope: String,
    },

    /// The scope name is not usable as a lock resource name.
    #[error("invalid lock scope '{scope}'")]
    InvalidScope {
        /// The rejected scope.
        scope: String,
    },

    /// Filesystem failure.
    #[error("lock I/O error on {path}: {source}")]
    Io {
        /// The lock resource path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// Failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::AlreadyLocked { .. } => FailureKind::LockHeld,
            _ => FailureKind::Internal,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Proof of lock ownership, also the persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    scope: String,
    token: Uuid,
    holder: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockToken {
    fn new(scope: &str, holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            scope: scope.to_string(),
            token: Uuid::new_v4(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// The locked scope.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Unique token value.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.token
    }

    /// Identity of the holder.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// When the lock was acquired.
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// When the lock stops protecting its scope unless renewed.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the lock has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.token)
    }
}

/// Mutual exclusion over named scopes.
pub trait LockManager: Send + Sync {
    /// Acquires `scope`, failing fast if it is held.
    fn acquire(&self, scope: &str) -> Result<LockToken>;

    /// Releases the lock held by `token`.
    fn release(&self, token: &LockToken) -> Result<()>;

    /// Extends the expiry of a held lock.
    fn renew(&self, token: &LockToken) -> Result<LockToken>;

    /// Returns the current holder of `scope`, if any.
    fn inspect(&self, scope: &str) -> Result<Option<LockToken>>;

    /// Removes the lock for `scope` regardless of holder. Returns true if a
    /// lock existed. Operator use only.
    fn force_release(&self, scope: &str) -> Result<bool>;
}

/// Lock manager backed by exclusive file creation in a shared directory.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    dir: PathBuf,
    holder: String,
    ttl: Duration,
}

impl FileLockManager {
    /// Creates a manager storing lock files in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            holder: holder.into(),
            ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
        }
    }

    /// Sets the lock time-to-live.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Path of the lock resource for `scope`.
    #[must_use]
    pub fn lock_path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{scope}.lock"))
    }

    fn validate_scope(scope: &str) -> Result<()> {
        let valid = !scope.is_empty()
            && scope.len() <= 128
            && scope
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !scope.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(LockError::InvalidScope {
                scope: scope.to_string(),
            })
        }
    }

    /// Atomically creates the lock file; fails with `AlreadyExists` if present.
    fn create_exclusive(path: &Path, token: &LockToken) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let body = serde_json::to_vec_pretty(token).map_err(io::Error::other)?;
        file.write_all(&body)?;
        file.sync_all()
    }

    /// Reads a lock record. `None` means missing or not (yet) parseable.
    fn read_record(path: &Path) -> Result<Option<LockToken>> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    fn take_over(&self, path: &Path, stale: &LockToken, fresh: LockToken) -> Result<LockToken> {
        let aside = path.with_extension(format!("stale-{}", Uuid::new_v4()));

        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::io(path, e)),
        }

        // Another caller may have replaced the stale lock between our read
        // and the rename; put theirs back.
        if let Some(moved) = Self::read_record(&aside)? {
            if moved.token != stale.token {
                if let Err(e) = fs::rename(&aside, path) {
                    warn!(path = %path.display(), error = %e, "failed to restore concurrently acquired lock");
                }
                return Err(LockError::AlreadyLocked {
                    scope: moved.scope,
                    holder: moved.holder,
                    acquired_at: moved.acquired_at,
                });
            }
        }
        let _ = fs::remove_file(&aside);

        match Self::create_exclusive(path, &fresh) {
            Ok(()) => {
                warn!(
                    scope = %fresh.scope,
                    stale_holder = %stale.holder,
                    stale_expired_at = %stale.expires_at,
                    "took over expired lock"
                );
                Ok(fresh)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.contended(path, &fresh.scope)
            }
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    fn contended(&self, path: &Path, scope: &str) -> Result<LockToken> {
        let current = Self::read_record(path)?;
        Err(match current {
            Some(held) => LockError::AlreadyLocked {
                scope: scope.to_string(),
                holder: held.holder,
                acquired_at: held.acquired_at,
            },
            None => LockError::AlreadyLocked {
                scope: scope.to_string(),
                holder: "unknown".to_string(),
                acquired_at: Utc::now(),
            },
        })
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self, scope: &str) -> Result<LockToken> {
        Self::validate_scope(scope)?;
        fs::create_dir_all(&self.dir).map_err(|e| LockError::io(&self.dir, e))?;

        let path = self.lock_path(scope);
        let token = LockToken::new(scope, &self.holder, self.ttl);

        match Self::create_exclusive(&path, &token) {
            Ok(()) => {
                info!(scope, holder = %self.holder, expires_at = %token.expires_at, "lock acquired");
                Ok(token)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match Self::read_record(&path)? {
                    Some(held) if held.is_expired_at(Utc::now()) => self.take_over(&path, &held, token),
                    Some(held) => {
                        debug!(scope, holder = %held.holder, "lock is held");
                        Err(LockError::AlreadyLocked {
                            scope: scope.to_string(),
                            holder: held.holder,
                            acquired_at: held.acquired_at,
                        })
                    }
                    // Unreadable record: either mid-write or corrupt. Both mean held.
                    None => self.contended(&path, scope),
                }
            }
            Err(e) => Err(LockError::io(&path, e)),
        }
    }

    fn release(&self, token: &LockToken) -> Result<()> {
        let path = self.lock_path(&token.scope);

        match Self::read_record(&path)? {
            None if !path.exists() => {
                warn!(scope = %token.scope, "lock already released");
                return Ok(());
            }
            Some(held) if held.token != token.token && !held.is_expired_at(Utc::now()) => {
                return Err(LockError::NotHolder {
                    scope: token.scope.clone(),
                });
            }
            _ => {}
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                info!(scope = %token.scope, "lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::io(&path, e)),
        }
    }

    fn renew(&self, token: &LockToken) -> Result<LockToken> {
        let path = self.lock_path(&token.scope);
        let held = Self::read_record(&path)?.ok_or_else(|| LockError::NotHolder {
            scope: token.scope.clone(),
        })?;
        if held.token != token.token {
            return Err(LockError::NotHolder {
                scope: token.scope.clone(),
            });
        }

        let mut renewed = held;
        renewed.expires_at = Utc::now() + self.ttl;

        let tmp = path.with_extension(format!("renew-{}", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(&renewed)
            .map_err(|e| LockError::io(&tmp, io::Error::other(e)))?;
        fs::write(&tmp, body).map_err(|e| LockError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| LockError::io(&path, e))?;

        debug!(scope = %renewed.scope, expires_at = %renewed.expires_at, "lock renewed");
        Ok(renewed)
    }

    fn inspect(&self, scope: &str) -> Result<Option<LockToken>> {
        Self::validate_scope(scope)?;
        Self::read_record(&self.lock_path(scope))
    }

    fn force_release(&self, scope: &str) -> Result<bool> {
        Self::validate_scope(scope)?;
        let path = self.lock_path(scope);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!(scope, "lock forcibly released by operator");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::io(&path, e)),
        }
    }
}
