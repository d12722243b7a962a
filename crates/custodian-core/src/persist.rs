//! JSON snapshot persistence.
//!
//! A [`JsonStore`] owns one file `<state_dir>/<name>.json`. Saves are
//! atomic: the snapshot is written to a sibling temp file, synced, then
//! renamed over the target, so readers see either the old or the new
//! snapshot and never a torn write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::failure::FailureKind;

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The snapshot could not be encoded or decoded.
    #[error("snapshot {path} is not valid JSON: {source}")]
    Serialization {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistError {
    let path = path.to_path_buf();
    move |source| PersistError::Io { path, source }
}

impl PersistError {
    /// Failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        FailureKind::Internal
    }
}

/// A single JSON snapshot file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Creates a store for `<state_dir>/<name>.json`.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            path: state_dir.as_ref().join(format!("{name}.json")),
        }
    }

    /// Snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot. A missing file yields `T::default()`; a corrupt
    /// one is an error, never silently replaced.
    pub fn load<T>(&self) -> Result<T, PersistError>
    where
        T: DeserializeOwned + Default,
    {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot yet, starting empty");
                return Ok(T::default());
            }
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| PersistError::Serialization {
            path: self.path.clone(),
            source,
        })
    }

    /// Atomically replaces the snapshot with `value`.
    pub fn save<T>(&self, value: &T) -> Result<(), PersistError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialization {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&body).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;

        debug!(path = %self.path.display(), bytes = body.len(), "snapshot saved");
        Ok(())
    }
}
