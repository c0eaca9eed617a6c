//! Media object storage.
//!
//! An [`ObjectStore`] holds the artifacts of every job in a single bucket.
//! Keys are built as `{prefix}{name}`, where the prefix is the owning job's
//! `{job_id}/`. Stages never see a raw store; they get a
//! [`ScopedObjectStore`], which checks every access against the stage's
//! capability set before delegating.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rf_core::{Action, CapabilitySet, Error, ObjectRef, ResourceKind, Result};

/// Blob storage for job artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store writes into.
    fn bucket(&self) -> &str;

    /// Local directory backing the bucket, for stores that have one.
    fn local_root(&self) -> Option<&Path> {
        None
    }

    /// Write `bytes` at `{prefix}{name}`, replacing any existing object.
    async fn put(&self, prefix: &str, name: &str, bytes: Bytes) -> Result<ObjectRef>;

    /// Read an object.
    async fn get(&self, object: &ObjectRef) -> Result<Bytes>;

    /// Whether an object exists.
    async fn exists(&self, object: &ObjectRef) -> Result<bool>;
}

/// Build and validate the key for `{prefix}{name}`.
fn object_key(prefix: &str, name: &str) -> Result<String> {
    if !prefix.is_empty() && !prefix.ends_with('/') {
        return Err(Error::Validation(format!(
            "object prefix '{prefix}' must end with '/'"
        )));
    }
    let key = format!("{prefix}{name}");
    validate_key(&key)?;
    Ok(key)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(Error::Validation(format!("invalid object key '{key}'")));
    }
    if key
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(Error::Validation(format!("invalid object key '{key}'")));
    }
    Ok(())
}

fn check_bucket(store: &str, object: &ObjectRef) -> Result<()> {
    if store == object.bucket {
        Ok(())
    } else {
        Err(Error::not_found("object", object))
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

/// In-memory store for tests and ephemeral runs.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
        }
    }

    /// All keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, prefix: &str, name: &str, bytes: Bytes) -> Result<ObjectRef> {
        let key = object_key(prefix, name)?;
        self.objects.insert(key.clone(), bytes);
        Ok(ObjectRef::new(&self.bucket, key))
    }

    async fn get(&self, object: &ObjectRef) -> Result<Bytes> {
        check_bucket(&self.bucket, object)?;
        self.objects
            .get(&object.key)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::not_found("object", object))
    }

    async fn exists(&self, object: &ObjectRef) -> Result<bool> {
        Ok(object.bucket == self.bucket && self.objects.contains_key(&object.key))
    }
}

// ---------------------------------------------------------------------------
// FsObjectStore
// ---------------------------------------------------------------------------

/// Store rooted at `{root_dir}/{bucket}` on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    bucket: String,
    root: PathBuf,
}

impl FsObjectStore {
    /// Create the store, creating its directory if needed.
    pub async fn open(root_dir: impl AsRef<Path>, bucket: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
            return Err(Error::Validation(format!("invalid bucket name '{bucket}'")));
        }
        let root = root_dir.as_ref().join(&bucket);
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { bucket, root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |p, seg| p.join(seg))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    async fn put(&self, prefix: &str, name: &str, bytes: Bytes) -> Result<ObjectRef> {
        let key = object_key(prefix, name)?;
        let path = self.path_for(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a partial object.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(bucket = %self.bucket, key = %key, size = bytes.len(), "Stored object");
        Ok(ObjectRef::new(&self.bucket, key))
    }

    async fn get(&self, object: &ObjectRef) -> Result<Bytes> {
        check_bucket(&self.bucket, object)?;
        validate_key(&object.key)?;
        match tokio::fs::read(self.path_for(&object.key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("object", object))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, object: &ObjectRef) -> Result<bool> {
        if object.bucket != self.bucket || validate_key(&object.key).is_err() {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.path_for(&object.key)).await?)
    }
}

// ---------------------------------------------------------------------------
// ScopedObjectStore
// ---------------------------------------------------------------------------

/// Capability-checked view of an [`ObjectStore`].
///
/// Every call is checked against the held [`CapabilitySet`] using the object's
/// `{bucket}/{key}` identifier; refusals surface as
/// [`Error::CapabilityDenied`] and the underlying store is not touched.
#[derive(Clone)]
pub struct ScopedObjectStore {
    inner: Arc<dyn ObjectStore>,
    capabilities: Arc<CapabilitySet>,
}

impl ScopedObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>, capabilities: Arc<CapabilitySet>) -> Self {
        Self {
            inner,
            capabilities,
        }
    }

    pub fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    pub async fn put(&self, prefix: &str, name: &str, bytes: Bytes) -> Result<ObjectRef> {
        let key = object_key(prefix, name)?;
        let resource = format!("{}/{}", self.inner.bucket(), key);
        self.capabilities
            .check(ResourceKind::ObjectStore, &resource, Action::Write)?;
        self.inner.put(prefix, name, bytes).await
    }

    pub async fn get(&self, object: &ObjectRef) -> Result<Bytes> {
        self.capabilities
            .check(ResourceKind::ObjectStore, &object.resource_id(), Action::Read)?;
        self.inner.get(object).await
    }

    pub async fn exists(&self, object: &ObjectRef) -> Result<bool> {
        self.capabilities
            .check(ResourceKind::ObjectStore, &object.resource_id(), Action::Read)?;
        self.inner.exists(object).await
    }
}
