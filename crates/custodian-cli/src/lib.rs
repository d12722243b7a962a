//! # custodian-cli
//!
//! Operator command line for the credential lifecycle and backup pipeline.
//!
//! Provides commands for:
//! - Backups of configured database sources
//! - Credential rotation and retirement
//! - Backup verification and retention sweeps
//! - The full orchestrated `run`
//! - Lock inspection and manual release
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   Config   ┌─────────┐   builds   ┌──────────────────────┐
//! │ custodian CLI │───────────►│ Context │───────────►│ pipelines/controller │
//! └───────────────┘            └─────────┘            └──────────────────────┘
//!         │                         │
//!         │  run                    │ FileLockManager
//!         ▼                         ▼
//!   ┌──────────────┐         state_dir/locks
//!   │ Orchestrator │
//!   └──────────────┘
//! ```
//!
//! Every mutating command holds the workflow lock for its duration;
//! `verify` and `status` only read.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapters;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod output;

pub use cli::{Cli, Commands, Format};
pub use config::Config;
pub use context::Context;
pub use error::CliError;
pub use output::OutputFormat;
