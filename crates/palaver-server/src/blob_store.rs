//! Filesystem-backed object storage.
//!
//! Each bucket is a directory under the root. Object paths are relative,
//! `/`-separated keys; folders are virtual, so removing the last object of a
//! folder removes the folder too. Content types live in a parallel `.meta`
//! tree so they never show up in listings.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};

use palaver_shared::constants::PUBLIC_OBJECT_PREFIX;
use palaver_shared::Bucket;

use crate::error::ServerError;

const META_DIR: &str = ".meta";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata of a stored object. Folders have none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageEntry {
    pub name: String,
    pub metadata: Option<ObjectMetadata>,
}

impl StorageEntry {
    pub fn is_folder(&self) -> bool {
        self.metadata.is_none()
    }
}

/// Resolve an object key below `base`, rejecting anything that is not a
/// plain relative path.
fn ensure_within(base: &Path, key: &str) -> Result<PathBuf, ServerError> {
    if key.is_empty() || key.contains('\\') || key.split('/').any(str::is_empty) {
        return Err(ServerError::Validation(format!("Invalid object path '{key}'")));
    }

    let mut resolved = base.to_path_buf();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            _ => {
                return Err(ServerError::Validation(
                    "Path traversal detected".to_string(),
                ));
            }
        }
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    public_base: String,
}

impl BlobStore {
    /// Open the store, creating the root and one directory per bucket.
    pub async fn new(root: PathBuf, public_base: impl Into<String>) -> Result<Self, ServerError> {
        for bucket in Bucket::ALL {
            let dir = root.join(bucket.as_str());
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ServerError::storage(dir.display().to_string(), e))?;
        }

        info!(path = %root.display(), "Blob store initialized");

        Ok(Self {
            root,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn public_base(&self) -> &str {
        &self.public_base
    }

    /// `<base>/storage/v1/object/public/<bucket>/<path>`
    pub fn public_url(&self, bucket: Bucket, path: &str) -> String {
        format!(
            "{}{}/{}/{}",
            self.public_base,
            PUBLIC_OBJECT_PREFIX,
            bucket.as_str(),
            path
        )
    }

    fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.as_str())
    }

    fn object_path(&self, bucket: Bucket, key: &str) -> Result<PathBuf, ServerError> {
        ensure_within(&self.bucket_dir(bucket), key)
    }

    fn meta_path(&self, bucket: Bucket, key: &str) -> Result<PathBuf, ServerError> {
        ensure_within(&self.root.join(META_DIR).join(bucket.as_str()), key)
    }

    /// List the direct children of a folder. A folder that does not exist
    /// lists as empty.
    pub async fn list(&self, bucket: Bucket, prefix: &str) -> Result<Vec<StorageEntry>, ServerError> {
        let dir = if prefix.is_empty() {
            self.bucket_dir(bucket)
        } else {
            self.object_path(bucket, prefix)?
        };
        let location = format!("{}/{}", bucket, prefix);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::storage(location, e)),
        };

        let mut listing = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServerError::storage(location.clone(), e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = entry
                .metadata()
                .await
                .map_err(|e| ServerError::storage(format!("{location}/{name}"), e))?;

            let metadata = meta.is_file().then(|| ObjectMetadata {
                size: meta.len(),
                updated_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
            listing.push(StorageEntry { name, metadata });
        }

        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Store an object, replacing any previous object at the same key.
    pub async fn upload(
        &self,
        bucket: Bucket,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ServerError> {
        let path = self.object_path(bucket, key)?;
        let meta = self.meta_path(bucket, key)?;
        let location = format!("{bucket}/{key}");

        write_with_parents(&path, &data)
            .await
            .map_err(|e| ServerError::storage(location.clone(), e))?;
        write_with_parents(&meta, content_type.as_bytes())
            .await
            .map_err(|e| ServerError::storage(location, e))?;

        debug!(%bucket, key, size = data.len(), "Stored object");
        Ok(())
    }

    /// Read an object and its content type.
    pub async fn download(&self, bucket: Bucket, key: &str) -> Result<(Bytes, String), ServerError> {
        let path = self.object_path(bucket, key)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound("Object not found".to_string()));
            }
            Err(e) => return Err(ServerError::storage(format!("{bucket}/{key}"), e)),
        };

        let content_type = fs::read_to_string(self.meta_path(bucket, key)?)
            .await
            .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string());

        Ok((Bytes::from(data), content_type))
    }

    /// Server-side copy within a bucket.
    pub async fn copy(&self, bucket: Bucket, from: &str, to: &str) -> Result<(), ServerError> {
        let src = self.object_path(bucket, from)?;
        let dst = self.object_path(bucket, to)?;

        if !fs::try_exists(&src).await.unwrap_or(false) {
            return Err(ServerError::NotFound(format!("Object not found: {bucket}/{from}")));
        }

        let location = format!("{bucket}/{to}");
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::storage(location.clone(), e))?;
        }
        fs::copy(&src, &dst)
            .await
            .map_err(|e| ServerError::storage(location.clone(), e))?;

        let content_type = fs::read(self.meta_path(bucket, from)?)
            .await
            .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.as_bytes().to_vec());
        write_with_parents(&self.meta_path(bucket, to)?, &content_type)
            .await
            .map_err(|e| ServerError::storage(location, e))?;

        debug!(%bucket, from, to, "Copied object");
        Ok(())
    }

    /// Remove a batch of objects. Keys that do not exist are skipped.
    /// Returns how many objects were removed.
    pub async fn remove(&self, bucket: Bucket, keys: &[String]) -> Result<usize, ServerError> {
        let mut removed = 0;
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ServerError::storage(format!("{bucket}/{key}"), e)),
            }

            let meta = self.meta_path(bucket, key)?;
            let _ = fs::remove_file(&meta).await;

            prune_empty_parents(&path, &self.bucket_dir(bucket)).await;
            prune_empty_parents(&meta, &self.root.join(META_DIR).join(bucket.as_str())).await;
        }

        if removed > 0 {
            debug!(%bucket, count = removed, "Removed objects");
        }
        Ok(removed)
    }
}

async fn write_with_parents(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await
}

/// Remove now-empty folders between `path` and `stop`, bottom-up. Stops at
/// the first folder that still has children.
async fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}
