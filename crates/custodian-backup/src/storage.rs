//! Object storage contract and two implementations.
//!
//! [`FsObjectStorage`] lays objects out as `<root>/<region>/<bucket>/<key>`
//! with a JSON metadata sidecar; [`MemoryObjectStorage`] keeps everything
//! in memory and can simulate region outages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::StorageLocation;

/// Per-object metadata tags.
pub type ObjectMetadata = BTreeMap<String, String>;

/// Errors from an object store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object under this key.
    #[error("object '{key}' not found in {region}")]
    NotFound {
        /// Region.
        region: String,
        /// Object key.
        key: String,
    },

    /// The region could not serve the request.
    #[error("region '{region}' unavailable: {reason}")]
    Unavailable {
        /// Region.
        region: String,
        /// What went wrong.
        reason: String,
    },

    /// The key is not a safe relative path.
    #[error("invalid object key '{key}'")]
    InvalidKey {
        /// Rejected key.
        key: String,
    },

    /// Filesystem failure.
    #[error("storage I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Summary of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Metadata tags.
    pub metadata: ObjectMetadata,
}

/// A regional object store.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `key`, replacing any existing object.
    async fn put(
        &self,
        location: &StorageLocation,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo, StorageError>;

    /// Reads an object.
    async fn get(&self, location: &StorageLocation, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Returns object info, or `None` if absent.
    async fn head(&self, location: &StorageLocation, key: &str) -> Result<Option<ObjectInfo>, StorageError>;

    /// Server-side copy of `key` from `from` into `to`, metadata included.
    async fn copy(
        &self,
        from: &StorageLocation,
        key: &str,
        to: &StorageLocation,
    ) -> Result<ObjectInfo, StorageError>;

    /// Deletes an object. Returns false if it did not exist.
    async fn delete(&self, location: &StorageLocation, key: &str) -> Result<bool, StorageError>;

    /// Lists objects whose key starts with `prefix`.
    async fn list(&self, location: &StorageLocation, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && !key.ends_with(".meta.json")
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(StorageError::InvalidKey { key: key.to_string() })
    }
}

/// Object store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, location: &StorageLocation, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        validate_key(&location.region)?;
        validate_key(&location.bucket)?;
        Ok(self.root.join(&location.region).join(&location.bucket).join(key))
    }

    fn meta_path(object: &Path) -> PathBuf {
        let mut name = object.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    async fn read_meta(object: &Path) -> Result<ObjectMetadata, StorageError> {
        let path = Self::meta_path(object);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObjectMetadata::new()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let io = |source: std::io::Error| StorageError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, path).await.map_err(io)
    }

    fn collect_keys(dir: &Path, base: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_keys(&path, base, out)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                let key = relative.to_string_lossy().replace('\\', "/");
                if !key.ends_with(".meta.json") && !key.contains(".tmp-") {
                    out.push((key, path));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put(
        &self,
        location: &StorageLocation,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo, StorageError> {
        let path = self.object_path(location, key)?;
        let meta = serde_json::to_vec_pretty(&metadata).map_err(|e| StorageError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        Self::write_atomic(&Self::meta_path(&path), &meta).await?;
        Self::write_atomic(&path, &bytes).await?;
        debug!(%location, key, bytes = bytes.len(), "object stored");

        Ok(ObjectInfo {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
            metadata,
        })
    }

    async fn get(&self, location: &StorageLocation, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(location, key)?;
        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    region: location.region.clone(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io { path, source }
            }
        })
    }

    async fn head(&self, location: &StorageLocation, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        let path = self.object_path(location, key)?;
        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size_bytes,
            metadata: Self::read_meta(&path).await?,
        }))
    }

    async fn copy(
        &self,
        from: &StorageLocation,
        key: &str,
        to: &StorageLocation,
    ) -> Result<ObjectInfo, StorageError> {
        let bytes = self.get(from, key).await?;
        let metadata = Self::read_meta(&self.object_path(from, key)?).await?;
        self.put(to, key, bytes, metadata).await
    }

    async fn delete(&self, location: &StorageLocation, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(location, key)?;
        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let meta = Self::meta_path(&path);
        match tokio::fs::remove_file(&meta).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StorageError::Io { path: meta, source }),
        }
        Ok(existed)
    }

    async fn list(&self, location: &StorageLocation, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        validate_key(&location.region)?;
        validate_key(&location.bucket)?;
        let base = self.root.join(&location.region).join(&location.bucket);

        let mut found = Vec::new();
        Self::collect_keys(&base, &base, &mut found).map_err(|source| StorageError::Io {
            path: base.clone(),
            source,
        })?;

        let mut out = Vec::new();
        for (key, path) in found.into_iter().filter(|(k, _)| k.starts_with(prefix)) {
            let size_bytes = tokio::fs::metadata(&path)
                .await
                .map_err(|source| StorageError::Io {
                    path: path.clone(),
                    source,
                })?
                .len();
            out.push(ObjectInfo {
                key,
                size_bytes,
                metadata: Self::read_meta(&path).await?,
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

type ObjectId = (String, String, String);

/// In-memory object store with outage simulation.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: RwLock<HashMap<ObjectId, (Vec<u8>, ObjectMetadata)>>,
    unavailable: RwLock<HashSet<String>>,
}

impl MemoryObjectStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every request touching `region` fail until [`Self::restore_region`].
    pub fn fail_region(&self, region: &str) {
        self.unavailable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region.to_string());
    }

    /// Ends a simulated outage.
    pub fn restore_region(&self, region: &str) {
        self.unavailable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(region);
    }

    /// Overwrites stored bytes in place, bypassing any checks.
    pub fn tamper(&self, location: &StorageLocation, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        match objects.get_mut(&Self::id(location, key)) {
            Some((bytes, _)) => {
                f(bytes);
                true
            }
            None => false,
        }
    }

    /// Number of objects across all regions.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn id(location: &StorageLocation, key: &str) -> ObjectId {
        (location.region.clone(), location.bucket.clone(), key.to_string())
    }

    fn check_available(&self, location: &StorageLocation) -> Result<(), StorageError> {
        if self
            .unavailable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&location.region)
        {
            return Err(StorageError::Unavailable {
                region: location.region.clone(),
                reason: "simulated outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(
        &self,
        location: &StorageLocation,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo, StorageError> {
        self.check_available(location)?;
        validate_key(key)?;
        let info = ObjectInfo {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
            metadata: metadata.clone(),
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::id(location, key), (bytes, metadata));
        Ok(info)
    }

    async fn get(&self, location: &StorageLocation, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check_available(location)?;
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::id(location, key))
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                region: location.region.clone(),
                key: key.to_string(),
            })
    }

    async fn head(&self, location: &StorageLocation, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        self.check_available(location)?;
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::id(location, key))
            .map(|(bytes, metadata)| ObjectInfo {
                key: key.to_string(),
                size_bytes: bytes.len() as u64,
                metadata: metadata.clone(),
            }))
    }

    async fn copy(
        &self,
        from: &StorageLocation,
        key: &str,
        to: &StorageLocation,
    ) -> Result<ObjectInfo, StorageError> {
        self.check_available(from)?;
        self.check_available(to)?;
        let (bytes, metadata) = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::id(from, key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                region: from.region.clone(),
                key: key.to_string(),
            })?;
        self.put(to, key, bytes, metadata).await
    }

    async fn delete(&self, location: &StorageLocation, key: &str) -> Result<bool, StorageError> {
        self.check_available(location)?;
        Ok(self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::id(location, key))
            .is_some())
    }

    async fn list(&self, location: &StorageLocation, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.check_available(location)?;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ObjectInfo> = objects
            .iter()
            .filter(|((region, bucket, key), _)| {
                *region == location.region && *bucket == location.bucket && key.starts_with(prefix)
            })
            .map(|((_, _, key), (bytes, metadata))| ObjectInfo {
                key: key.clone(),
                size_bytes: bytes.len() as u64,
                metadata: metadata.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}
