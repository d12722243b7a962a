//! # custodian-rotation
//!
//! Zero-downtime credential rotation.
//!
//! A rotation generates new material, stages it in the [`registry`],
//! patches the secret through the [`secret_store`] client, reloads the
//! consuming service and waits for the [`health`] verifier before
//! activating the new version. Previous versions stay valid for a per-type
//! grace window ([`policy`]) and are cleaned up by the retirement sweep.
//! Every attempt is recorded in the [`journal`].
//!
//! | Credential | Strategy | Default grace |
//! |---|---|---|
//! | JWT signing key (Ed25519) | dual key | 24h + 5m |
//! | Symmetric data key | dual key | 30 days |
//! | Database password | alternating roles | 15 minutes |
//! | TLS certificate | replace in place | none |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod controller;
pub mod database;
pub mod error;
pub mod health;
pub mod journal;
pub mod policy;
pub mod registry;
pub mod secret_store;
pub mod types;

pub use controller::{RotationController, RotationTarget, TlsSubject};
pub use database::DatabaseAdmin;
pub use error::{Result, RotationError};
pub use health::{Deployment, HealthStatus, RolloutCheck, RolloutHealthVerifier, RolloutVerdict, TlsEndpointProbe};
pub use journal::JobJournal;
pub use policy::{PolicySet, RotationPolicy, Strategy};
pub use registry::{Activation, CredentialRegistry};
pub use secret_store::{LocalSecretStore, SecretBackend, SecretPatch, SecretRef, SecretSnapshot, SecretStoreClient};
pub use types::{
    CredentialType, CredentialVersion, JobFailure, JobOutcome, RotationJob, RotationState, StepResult, VersionStatus,
};
