//! Storage Adapters
//!
//! Durable storage for upload bytes. Object stores cannot append, so every
//! chunk is staged as its own part object keyed by its starting offset and
//! the parts are composed into the final object exactly once, at completion.
//!
//! Layout (relative to the adapter root or bucket):
//! - parts: `.parts/<final key>/<offset, 20 digits>.part`
//! - final object: `<namespace>/<upload id>`, or `<upload id>` without a namespace

use std::path::PathBuf;

use bytes::Bytes;

use crate::error::AppError;
use crate::storage::{ObjectMetadata, S3Client};
use super::types::{FinalObject, LocatorHint, StorageLocator};

/// Prefix under which parts are staged
pub const PARTS_ROOT: &str = ".parts";

const PART_SUFFIX: &str = ".part";

// ============================================================================
// Adapter Trait
// ============================================================================

/// Storage adapter failure, classified by whether a retry can succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Network, quota or other temporary failure; state is unchanged
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Locator gone, write rejected, or data missing
    #[error("permanent storage error: {0}")]
    Permanent(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::AlreadyExists
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData => AdapterError::Permanent(err.to_string()),
            _ => AdapterError::Transient(err.to_string()),
        }
    }
}

impl From<AppError> for AdapterError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Storage(e) if !e.is_transient() => AdapterError::Permanent(e.to_string()),
            other => AdapterError::Transient(other.to_string()),
        }
    }
}

/// Trait for upload storage backends
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Reserve a location for a new upload
    async fn allocate(&self, hint: &LocatorHint) -> Result<StorageLocator, AdapterError>;

    /// Persist `data` as the byte range starting at `offset`.
    ///
    /// Rewriting the same offset replaces the previous part, so a retried
    /// chunk never duplicates bytes.
    async fn write_chunk(
        &self,
        locator: &StorageLocator,
        offset: u64,
        data: Bytes,
    ) -> Result<(), AdapterError>;

    /// Bytes persisted so far: the final object's size once composed,
    /// otherwise the contiguous run of parts starting at offset 0
    async fn read_length(&self, locator: &StorageLocator) -> Result<u64, AdapterError>;

    /// Assemble the staged parts into the final object.
    ///
    /// Idempotent: if the final object already has `final_length` bytes
    /// and no parts remain, the existing object is returned.
    async fn compose(
        &self,
        locator: &StorageLocator,
        final_length: u64,
    ) -> Result<FinalObject, AdapterError>;

    /// Release staged parts. The final object, if any, is kept.
    async fn discard(&self, locator: &StorageLocator) -> Result<(), AdapterError>;

    /// Whether no object exists under `<namespace>/`
    async fn namespace_is_empty(&self, namespace: &str) -> Result<bool, AdapterError>;
}

/// Final object key for a new upload
fn final_key(hint: &LocatorHint) -> String {
    match &hint.namespace {
        Some(namespace) => format!("{}/{}", namespace.trim_end_matches('/'), hint.id),
        None => hint.id.to_string(),
    }
}

fn part_name(offset: u64) -> String {
    format!("{:020}{}", offset, PART_SUFFIX)
}

fn parse_part_name(name: &str) -> Option<u64> {
    name.strip_suffix(PART_SUFFIX)?.parse().ok()
}

/// A staged part located by a backend-specific handle
#[derive(Debug, Clone)]
struct StagedPart<T> {
    offset: u64,
    size: u64,
    handle: T,
}

/// Parts forming the contiguous run from offset 0, and the run's length.
///
/// Parts that overlap the run or start after a gap are left out; they can
/// only be leftovers of writes that were never acknowledged.
fn contiguous_parts<T>(mut parts: Vec<StagedPart<T>>) -> (u64, Vec<StagedPart<T>>) {
    parts.sort_by_key(|p| p.offset);

    let mut length = 0;
    let mut run = Vec::new();
    for part in parts {
        if part.offset == length && part.size > 0 {
            length += part.size;
            run.push(part);
        } else if part.offset > length {
            break;
        }
    }

    (length, run)
}

/// The prefix of the contiguous run covering exactly `final_length` bytes
fn parts_for_length<T>(
    parts: Vec<StagedPart<T>>,
    final_length: u64,
    locator: &StorageLocator,
) -> Result<Vec<StagedPart<T>>, AdapterError> {
    let (_, run) = contiguous_parts(parts);

    let mut covered = 0;
    let mut selected = Vec::new();
    for part in run {
        if covered == final_length {
            break;
        }
        covered += part.size;
        selected.push(part);
    }

    if covered != final_length {
        return Err(AdapterError::Permanent(format!(
            "staged parts for {} cover {} bytes, expected {}",
            locator, covered, final_length
        )));
    }

    Ok(selected)
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem storage adapter
pub struct LocalStorageAdapter {
    root: PathBuf,
}

impl LocalStorageAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn final_path(&self, locator: &StorageLocator) -> PathBuf {
        self.root.join(locator.as_str())
    }

    fn staging_dir(&self, locator: &StorageLocator) -> PathBuf {
        self.root.join(PARTS_ROOT).join(locator.as_str())
    }

    async fn list_parts(&self, locator: &StorageLocator) -> Result<Vec<StagedPart<PathBuf>>, AdapterError> {
        let dir = self.staging_dir(locator);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(offset) = name.to_str().and_then(parse_part_name) else {
                continue;
            };
            let size = entry.metadata().await?.len();
            parts.push(StagedPart {
                offset,
                size,
                handle: entry.path(),
            });
        }

        Ok(parts)
    }

    async fn final_size(&self, locator: &StorageLocator) -> Result<Option<u64>, AdapterError> {
        match tokio::fs::metadata(self.final_path(locator)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl StorageAdapter for LocalStorageAdapter {
    async fn allocate(&self, hint: &LocatorHint) -> Result<StorageLocator, AdapterError> {
        let locator = StorageLocator::new(final_key(hint));
        let staging = self.staging_dir(&locator);

        if tokio::fs::try_exists(self.final_path(&locator)).await?
            || tokio::fs::try_exists(&staging).await?
        {
            return Err(AdapterError::Permanent(format!(
                "locator {} already in use",
                locator
            )));
        }

        tokio::fs::create_dir_all(&staging).await?;
        Ok(locator)
    }

    async fn write_chunk(
        &self,
        locator: &StorageLocator,
        offset: u64,
        data: Bytes,
    ) -> Result<(), AdapterError> {
        let staging = self.staging_dir(locator);
        let staged = match tokio::fs::metadata(&staging).await {
            Ok(meta) => meta.is_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !staged {
            return Err(AdapterError::Permanent(format!(
                "staging area for {} is gone",
                locator
            )));
        }

        // Write then rename so a torn write never looks like a part
        let part = staging.join(part_name(offset));
        let tmp = staging.join(format!("{}.tmp", part_name(offset)));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &part).await?;

        Ok(())
    }

    async fn read_length(&self, locator: &StorageLocator) -> Result<u64, AdapterError> {
        if let Some(size) = self.final_size(locator).await? {
            return Ok(size);
        }
        let (length, _) = contiguous_parts(self.list_parts(locator).await?);
        Ok(length)
    }

    async fn compose(
        &self,
        locator: &StorageLocator,
        final_length: u64,
    ) -> Result<FinalObject, AdapterError> {
        let final_path = self.final_path(locator);
        let parts = self.list_parts(locator).await?;

        if parts.is_empty() && self.final_size(locator).await? == Some(final_length) {
            return Ok(FinalObject {
                key: locator.to_string(),
                size: final_length,
            });
        }

        let selected = parts_for_length(parts, final_length, locator)?;

        let staging = self.staging_dir(locator);
        tokio::fs::create_dir_all(&staging).await?;
        let tmp = staging.join("compose.tmp");
        {
            let mut out = tokio::fs::File::create(&tmp).await?;
            for part in &selected {
                let mut input = tokio::fs::File::open(&part.handle).await?;
                tokio::io::copy(&mut input, &mut out).await?;
            }
            out.sync_all().await?;
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&tmp, &final_path).await?;

        // The final object is visible; parts are no longer needed
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(locator = %locator, error = %e, "Failed to remove staged parts");
        }

        Ok(FinalObject {
            key: locator.to_string(),
            size: final_length,
        })
    }

    async fn discard(&self, locator: &StorageLocator) -> Result<(), AdapterError> {
        match tokio::fs::remove_dir_all(self.staging_dir(locator)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn namespace_is_empty(&self, namespace: &str) -> Result<bool, AdapterError> {
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        Ok(entries.next_entry().await?.is_none())
    }
}

// ============================================================================
// S3 Storage
// ============================================================================

/// S3-based storage adapter
pub struct S3StorageAdapter {
    client: S3Client,
}

impl S3StorageAdapter {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    fn parts_prefix(locator: &StorageLocator) -> String {
        format!("{}/{}/", PARTS_ROOT, locator)
    }

    fn part_key(locator: &StorageLocator, offset: u64) -> String {
        format!("{}{}", Self::parts_prefix(locator), part_name(offset))
    }

    async fn list_parts(
        &self,
        locator: &StorageLocator,
    ) -> Result<Vec<StagedPart<ObjectMetadata>>, AdapterError> {
        let objects = self
            .client
            .list_all_objects(&Self::parts_prefix(locator))
            .await?;

        Ok(objects
            .into_iter()
            .filter_map(|obj| {
                let name = obj.key.rsplit('/').next()?;
                let offset = parse_part_name(name)?;
                Some(StagedPart {
                    offset,
                    size: obj.size.max(0) as u64,
                    handle: obj,
                })
            })
            .collect())
    }

    async fn final_size(&self, locator: &StorageLocator) -> Result<Option<u64>, AdapterError> {
        match self.client.head_object(locator.as_str()).await {
            Ok(meta) => Ok(Some(meta.size.max(0) as u64)),
            Err(AppError::Storage(crate::error::StorageError::ObjectNotFound(_))) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl StorageAdapter for S3StorageAdapter {
    async fn allocate(&self, hint: &LocatorHint) -> Result<StorageLocator, AdapterError> {
        let locator = StorageLocator::new(final_key(hint));

        if self.client.object_exists(locator.as_str()).await? {
            return Err(AdapterError::Permanent(format!(
                "locator {} already in use",
                locator
            )));
        }

        Ok(locator)
    }

    async fn write_chunk(
        &self,
        locator: &StorageLocator,
        offset: u64,
        data: Bytes,
    ) -> Result<(), AdapterError> {
        self.client
            .put_object(
                &Self::part_key(locator, offset),
                data,
                "application/octet-stream",
            )
            .await?;
        Ok(())
    }

    async fn read_length(&self, locator: &StorageLocator) -> Result<u64, AdapterError> {
        if let Some(size) = self.final_size(locator).await? {
            return Ok(size);
        }
        let (length, _) = contiguous_parts(self.list_parts(locator).await?);
        Ok(length)
    }

    async fn compose(
        &self,
        locator: &StorageLocator,
        final_length: u64,
    ) -> Result<FinalObject, AdapterError> {
        let parts = self.list_parts(locator).await?;

        if parts.is_empty() && self.final_size(locator).await? == Some(final_length) {
            return Ok(FinalObject {
                key: locator.to_string(),
                size: final_length,
            });
        }

        let selected: Vec<ObjectMetadata> = parts_for_length(parts, final_length, locator)?
            .into_iter()
            .map(|part| part.handle)
            .collect();

        self.client
            .compose_objects(&selected, locator.as_str(), "application/octet-stream")
            .await?;

        // The final object is visible; parts are no longer needed
        if let Err(e) = self
            .client
            .delete_objects_with_prefix(&Self::parts_prefix(locator))
            .await
        {
            tracing::warn!(locator = %locator, error = %e, "Failed to remove staged parts");
        }

        Ok(FinalObject {
            key: locator.to_string(),
            size: final_length,
        })
    }

    async fn discard(&self, locator: &StorageLocator) -> Result<(), AdapterError> {
        self.client
            .delete_objects_with_prefix(&Self::parts_prefix(locator))
            .await?;
        Ok(())
    }

    async fn namespace_is_empty(&self, namespace: &str) -> Result<bool, AdapterError> {
        let prefix = format!("{}/", namespace.trim_end_matches('/'));
        Ok(!self.client.prefix_has_objects(&prefix).await?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn hint(namespace: Option<&str>) -> LocatorHint {
        LocatorHint {
            id: Uuid::new_v4(),
            namespace: namespace.map(str::to_string),
        }
    }

    fn part(offset: u64, size: u64) -> StagedPart<()> {
        StagedPart {
            offset,
            size,
            handle: (),
        }
    }

    #[test]
    fn test_part_names_sort_by_offset() {
        assert_eq!(part_name(42), "00000000000000000042.part");
        assert_eq!(parse_part_name(&part_name(42)), Some(42));
        assert_eq!(parse_part_name("00000000000000000042.part.tmp"), None);
        assert!(part_name(9) < part_name(10));
    }

    #[test]
    fn test_contiguous_parts() {
        let (length, run) = contiguous_parts(vec![part(6, 4), part(0, 6), part(20, 5)]);
        assert_eq!(length, 10);
        assert_eq!(run.len(), 2);

        let (length, _) = contiguous_parts(vec![part(3, 3)]);
        assert_eq!(length, 0);
    }

    #[test]
    fn test_parts_for_length() {
        let locator = StorageLocator::new("x");
        let selected = parts_for_length(vec![part(0, 6), part(6, 4)], 10, &locator).unwrap();
        assert_eq!(selected.len(), 2);

        let err = parts_for_length(vec![part(0, 6)], 10, &locator).unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));

        assert!(parts_for_length(Vec::<StagedPart<()>>::new(), 0, &locator)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_local_write_and_compose() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());

        let locator = adapter.allocate(&hint(Some("media-files/p1"))).await.unwrap();
        assert!(locator.as_str().starts_with("media-files/p1/"));

        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"Hello, "))
            .await
            .unwrap();
        adapter
            .write_chunk(&locator, 7, Bytes::from_static(b"World!"))
            .await
            .unwrap();
        assert_eq!(adapter.read_length(&locator).await.unwrap(), 13);

        let object = adapter.compose(&locator, 13).await.unwrap();
        assert_eq!(object.size, 13);

        let data = tokio::fs::read(temp_dir.path().join(&object.key)).await.unwrap();
        assert_eq!(data, b"Hello, World!");
        assert!(!adapter.staging_dir(&locator).exists());
        assert_eq!(adapter.read_length(&locator).await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_local_retry_replaces_part() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let locator = adapter.allocate(&hint(None)).await.unwrap();

        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();

        assert_eq!(adapter.read_length(&locator).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_local_compose_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let locator = adapter.allocate(&hint(None)).await.unwrap();

        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let first = adapter.compose(&locator, 4).await.unwrap();
        let second = adapter.compose(&locator, 4).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_local_compose_missing_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let locator = adapter.allocate(&hint(None)).await.unwrap();

        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let result = adapter.compose(&locator, 10).await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_local_zero_length_compose() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let locator = adapter.allocate(&hint(None)).await.unwrap();

        let object = adapter.compose(&locator, 0).await.unwrap();
        assert_eq!(object.size, 0);
        assert!(temp_dir.path().join(&object.key).is_file());
    }

    #[tokio::test]
    async fn test_local_discard_and_locator_gone() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let locator = adapter.allocate(&hint(None)).await.unwrap();

        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();
        adapter.discard(&locator).await.unwrap();
        adapter.discard(&locator).await.unwrap();

        assert_eq!(adapter.read_length(&locator).await.unwrap(), 0);
        let result = adapter
            .write_chunk(&locator, 4, Bytes::from_static(b"more"))
            .await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_local_allocate_rejects_used_locator() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let hint = hint(Some("media-files/p1"));

        let locator = adapter.allocate(&hint).await.unwrap();
        let again = adapter.allocate(&hint).await;
        assert!(matches!(again, Err(AdapterError::Permanent(_))));

        // Once composed, the final object still claims the locator
        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        adapter.compose(&locator, 1).await.unwrap();
        let again = adapter.allocate(&hint).await;
        assert!(matches!(again, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_local_write_needs_staging_directory() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());
        let locator = StorageLocator::new("stray");

        // A plain file where the staging directory should be
        let staging = temp_dir.path().join(PARTS_ROOT).join("stray");
        std::fs::create_dir_all(staging.parent().unwrap()).unwrap();
        std::fs::write(&staging, b"").unwrap();

        let result = adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"data"))
            .await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_local_namespace_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = LocalStorageAdapter::new(temp_dir.path());

        assert!(adapter.namespace_is_empty("media-files/p1").await.unwrap());

        // Staged parts live outside the namespace
        let locator = adapter.allocate(&hint(Some("media-files/p1"))).await.unwrap();
        adapter
            .write_chunk(&locator, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(adapter.namespace_is_empty("media-files/p1").await.unwrap());

        adapter.compose(&locator, 1).await.unwrap();
        assert!(!adapter.namespace_is_empty("media-files/p1").await.unwrap());
        assert!(adapter.namespace_is_empty("media-files/p2").await.unwrap());
    }

    #[test]
    fn test_io_error_classification() {
        let gone = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(AdapterError::from(gone), AdapterError::Permanent(_)));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(AdapterError::from(reset), AdapterError::Transient(_)));
    }

    #[test]
    fn test_s3_part_keys() {
        let locator = StorageLocator::new("media-files/p1/abc");
        assert_eq!(
            S3StorageAdapter::part_key(&locator, 6),
            ".parts/media-files/p1/abc/00000000000000000006.part"
        );
    }
}
