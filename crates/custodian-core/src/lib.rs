//! # custodian-core
//!
//! Building blocks shared by every Custodian crate:
//!
//! - [`lock`]: system-wide mutual exclusion for rotation workflows
//! - [`retry`]: the single bounded-retry helper and per-call deadlines
//! - [`persist`]: JSON snapshot persistence for catalogs and registries
//! - [`failure`]: the failure taxonomy surfaced to operators
//!
//! ## Example
//!
//! ```rust
//! use custodian_core::lock::{FileLockManager, LockManager};
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let locks = FileLockManager::new(dir.path(), "operator@host");
//!
//! let token = locks.acquire("rotation").expect("lock is free");
//! assert!(locks.acquire("rotation").is_err());
//! locks.release(&token).expect("release");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod failure;
pub mod lock;
pub mod persist;
pub mod retry;

pub use failure::FailureKind;
pub use lock::{FileLockManager, LockError, LockManager, LockToken};
pub use persist::{JsonStore, PersistError};
pub use retry::{retry, retry_observed, with_deadline, AttemptError, Exhausted, RetryPolicy, Succeeded, TimedOut};
