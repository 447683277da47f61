//! Content-addressable blob store
//!
//! Blob bytes live in the storage bucket at a path derived from the digest;
//! the record (size, media type, reference count) lives in the metadata store.
//! A freshly stored blob has no references until a repository links it.

use std::ops::Range;
use std::sync::Arc;

use camino::Utf8Path;
use chrono::Utc;
use storage::{BoxReader, StorageBucket, StorageError};

use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{Insert, MetadataStore};
use crate::model::Blob;

/// Deduplicating blob storage with per-repository links.
#[derive(Debug, Clone)]
pub struct BlobStore {
    pub(crate) bucket: StorageBucket,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) config: Arc<RegistryConfig>,
}

impl BlobStore {
    /// Create a blob store over `bucket`, keeping records in `metadata`.
    pub fn new(
        bucket: StorageBucket,
        metadata: Arc<dyn MetadataStore>,
        config: Arc<RegistryConfig>,
    ) -> Self {
        Self {
            bucket,
            metadata,
            config,
        }
    }

    /// Store `content` under `digest`.
    ///
    /// The digest is verified before anything is written. If the blob already
    /// exists its record is returned unchanged and nothing is written.
    #[tracing::instrument(skip(self, content), fields(size = content.len()))]
    pub async fn store_blob(
        &self,
        digest: &Digest,
        content: &[u8],
        media_type: Option<&str>,
    ) -> RegistryResult<Blob> {
        let actual = Digest::calculate(content);
        if !digest.matches(&actual) {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        if let Some(existing) = self.metadata.blob(digest).await? {
            tracing::debug!("blob already stored");
            return Ok(existing);
        }

        let location = self.config.blob_path(digest);
        self.bucket.upload(&location, &mut &content[..]).await?;
        self.record(digest, content.len() as u64, media_type, &location)
            .await
    }

    /// Store the temporary object at `temp` under `digest`.
    ///
    /// A temporary object under the upload prefix is removed afterwards,
    /// whether the blob was new, already present, or failed verification.
    #[tracing::instrument(skip(self))]
    pub async fn store_blob_from_file(
        &self,
        digest: &Digest,
        temp: &Utf8Path,
        media_type: Option<&str>,
    ) -> RegistryResult<Blob> {
        let result = self.verify_and_promote(digest, temp, media_type).await;
        self.discard(temp).await;
        result
    }

    async fn verify_and_promote(
        &self,
        digest: &Digest,
        temp: &Utf8Path,
        media_type: Option<&str>,
    ) -> RegistryResult<Blob> {
        let mut reader = self.bucket.open(temp, None).await?;
        let (actual, size) = Digest::calculate_from_stream(&mut reader).await?;
        if !digest.matches(&actual) {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        self.promote(digest, temp, size, media_type).await
    }

    /// Move verified content at `temp` into place, unless the blob exists already.
    pub(crate) async fn promote(
        &self,
        digest: &Digest,
        temp: &Utf8Path,
        size: u64,
        media_type: Option<&str>,
    ) -> RegistryResult<Blob> {
        if let Some(existing) = self.metadata.blob(digest).await? {
            tracing::debug!(%digest, "blob already stored, discarding upload");
            return Ok(existing);
        }

        let location = self.config.blob_path(digest);
        self.bucket.rename(temp, &location).await?;
        self.record(digest, size, media_type, &location).await
    }

    async fn record(
        &self,
        digest: &Digest,
        size: u64,
        media_type: Option<&str>,
        location: &Utf8Path,
    ) -> RegistryResult<Blob> {
        let blob = Blob {
            digest: digest.clone(),
            size,
            media_type: media_type.map(str::to_string),
            location: location.to_owned(),
            reference_count: 0,
            created_at: Utc::now(),
        };

        match self.metadata.insert_blob(blob).await? {
            Insert::Created(blob) => {
                tracing::info!(%digest, size, "stored blob");
                Ok(blob)
            }
            Insert::Existing(blob) => {
                tracing::debug!(%digest, "lost blob insert race, using existing record");
                Ok(blob)
            }
        }
    }

    /// Remove a temporary object, logging rather than failing.
    ///
    /// Only objects under the upload prefix are ever removed.
    pub(crate) async fn discard(&self, temp: &Utf8Path) {
        if !self.config.is_upload_path(temp) {
            tracing::warn!(%temp, "not discarding an object outside the upload prefix");
            return;
        }
        match self.bucket.delete(temp).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => tracing::warn!(%temp, error = %err, "failed to remove temporary object"),
        }
    }

    /// Look up a blob record.
    pub async fn blob(&self, digest: &Digest) -> RegistryResult<Option<Blob>> {
        self.metadata.blob(digest).await
    }

    /// Look up a blob record, failing if it does not exist.
    pub async fn require_blob(&self, digest: &Digest) -> RegistryResult<Blob> {
        self.metadata
            .blob(digest)
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))
    }

    /// Whether a blob record exists.
    pub async fn blob_exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.metadata.blob(digest).await?.is_some())
    }

    /// Read a blob into memory.
    #[tracing::instrument(skip(self))]
    pub async fn blob_content(&self, digest: &Digest) -> RegistryResult<Vec<u8>> {
        let blob = self.require_blob(digest).await?;
        self.bucket
            .read_to_vec(&blob.location)
            .await
            .map_err(|err| content_error(digest, err))
    }

    /// Open a blob for streaming, optionally restricted to a byte range.
    ///
    /// A missing record is `BlobNotFound`; a record whose content is gone from
    /// storage is `BlobContentMissing`.
    #[tracing::instrument(skip(self))]
    pub async fn stream_blob(
        &self,
        digest: &Digest,
        range: Option<Range<u64>>,
    ) -> RegistryResult<(Blob, BoxReader)> {
        let blob = self.require_blob(digest).await?;
        if let Some(range) = &range {
            if range.start >= range.end || range.end > blob.size {
                return Err(RegistryError::RangeNotSatisfiable);
            }
        }

        let reader = self
            .bucket
            .open(&blob.location, range)
            .await
            .map_err(|err| content_error(digest, err))?;
        Ok((blob, reader))
    }

    /// Link a blob into a repository. Returns `false` if it was already linked.
    #[tracing::instrument(skip(self))]
    pub async fn link_blob_to_repository(
        &self,
        digest: &Digest,
        repository: &str,
    ) -> RegistryResult<bool> {
        let linked = self.metadata.link_blob(digest, repository).await?;
        if linked {
            tracing::debug!("linked blob");
        }
        Ok(linked)
    }

    /// Unlink a blob from a repository. Returns `false` if it was not linked.
    #[tracing::instrument(skip(self))]
    pub async fn unlink_blob_from_repository(
        &self,
        digest: &Digest,
        repository: &str,
    ) -> RegistryResult<bool> {
        let unlinked = self.metadata.unlink_blob(digest, repository).await?;
        if unlinked {
            tracing::debug!("unlinked blob");
        }
        Ok(unlinked)
    }

    /// Whether a repository links a blob.
    pub async fn blob_linked(&self, digest: &Digest, repository: &str) -> RegistryResult<bool> {
        Ok(self
            .metadata
            .blob_repositories(digest)
            .await?
            .iter()
            .any(|linked| linked == repository))
    }

    /// Link an existing blob from `from` into `to` without copying bytes.
    ///
    /// Returns `false`, with no side effects, when the blob is unknown or not
    /// linked to `from`.
    #[tracing::instrument(skip(self))]
    pub async fn mount_blob(&self, digest: &Digest, from: &str, to: &str) -> RegistryResult<bool> {
        if !self.blob_exists(digest).await? || !self.blob_linked(digest, from).await? {
            tracing::debug!("blob not available for mount");
            return Ok(false);
        }

        match self.metadata.link_blob(digest, to).await {
            Ok(_) => Ok(true),
            // Deleted between the check and the link.
            Err(RegistryError::BlobNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Delete an unreferenced blob's record and content.
    ///
    /// The reference check uses the current record, not `blob`. A referenced
    /// blob is rejected before storage is touched.
    #[tracing::instrument(skip(self, blob), fields(digest = %blob.digest))]
    pub async fn delete_blob(&self, blob: &Blob) -> RegistryResult<Blob> {
        let removed = self.metadata.remove_unreferenced_blob(&blob.digest).await?;
        match self.bucket.delete(&removed.location).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::warn!(location = %removed.location, "blob content was already missing");
            }
            Err(err) => return Err(err.into()),
        }
        tracing::info!(size = removed.size, "deleted blob");
        Ok(removed)
    }

    /// Blobs linked by no repository, or whose reference count is zero.
    pub async fn orphaned_blobs(&self) -> RegistryResult<Vec<Blob>> {
        let mut orphans = Vec::new();
        for blob in self.metadata.blobs().await? {
            let unlinked = self.metadata.blob_repositories(&blob.digest).await?.is_empty();
            if unlinked || blob.reference_count == 0 {
                orphans.push(blob);
            }
        }
        Ok(orphans)
    }
}

fn content_error(digest: &Digest, err: StorageError) -> RegistryError {
    if err.is_not_found() {
        RegistryError::BlobContentMissing {
            digest: digest.clone(),
            source: err,
        }
    } else {
        err.into()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::MemoryMetadata;
    use storage::MemoryStorage;
    use tokio::io::AsyncReadExt;

    pub(crate) fn fixture() -> (BlobStore, Arc<MemoryStorage>) {
        fixture_with(RegistryConfig::default())
    }

    pub(crate) fn fixture_with(config: RegistryConfig) -> (BlobStore, Arc<MemoryStorage>) {
        let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
        let storage = storage::Storage::new(memory.clone());
        let store = BlobStore::new(
            storage.bucket("registry"),
            Arc::new(MemoryMetadata::new()),
            Arc::new(config),
        );
        (store, memory)
    }

    #[tokio::test]
    async fn store_verifies_before_writing() {
        let (store, memory) = fixture();
        let wrong = Digest::calculate(b"something else");

        let err = store.store_blob(&wrong, b"content", None).await.unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert_eq!(memory.total_bytes().await, 0);
        assert!(!store.blob_exists(&wrong).await.unwrap());
    }

    #[tokio::test]
    async fn store_deduplicates() {
        let (store, memory) = fixture();
        let content = b"layer bytes";
        let digest = Digest::calculate(content);

        let first = store
            .store_blob(&digest, content, Some("application/octet-stream"))
            .await
            .unwrap();
        let second = store.store_blob(&digest, content, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.reference_count, 0);
        assert_eq!(memory.total_bytes().await, content.len() as u64);
        assert_eq!(store.blob_content(&digest).await.unwrap(), content);
    }

    #[tokio::test]
    async fn store_from_file_discards_temp() {
        let (store, memory) = fixture();
        let content = b"uploaded";
        let digest = Digest::calculate(content);

        for _ in 0..2 {
            let temp = Utf8Path::new("uploads/tmp/data");
            store.bucket.upload(temp, &mut &content[..]).await.unwrap();
            let blob = store.store_blob_from_file(&digest, temp, None).await.unwrap();
            assert_eq!(blob.size, content.len() as u64);
            assert!(!store.bucket.exists(temp).await.unwrap());
        }
        assert_eq!(memory.total_bytes().await, content.len() as u64);

        let temp = Utf8Path::new("uploads/bad/data");
        store.bucket.upload(temp, &mut &b"tampered"[..]).await.unwrap();
        let err = store.store_blob_from_file(&digest, temp, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(!store.bucket.exists(temp).await.unwrap());

        // Objects outside the upload prefix are never removed.
        let outside = Utf8Path::new("elsewhere/data");
        store.bucket.upload(outside, &mut &b"tampered"[..]).await.unwrap();
        store.store_blob_from_file(&digest, outside, None).await.unwrap_err();
        assert!(store.bucket.exists(outside).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_stores_share_one_record() {
        let (store, memory) = fixture();
        let content = b"raced layer";
        let digest = Digest::calculate(content);

        let (first, second) = tokio::join!(
            store.store_blob(&digest, content, None),
            store.store_blob(&digest, content, None),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first, second);
        assert_eq!(store.metadata.blobs().await.unwrap().len(), 1);
        assert_eq!(memory.total_bytes().await, content.len() as u64);
    }

    #[tokio::test]
    async fn link_counts_and_delete_precondition() {
        let (store, _) = fixture();
        let content = b"shared layer";
        let digest = Digest::calculate(content);
        store.store_blob(&digest, content, None).await.unwrap();

        for repo in ["a", "b", "c"] {
            assert!(store.link_blob_to_repository(&digest, repo).await.unwrap());
        }
        assert!(!store.link_blob_to_repository(&digest, "a").await.unwrap());
        let blob = store.require_blob(&digest).await.unwrap();
        assert_eq!(blob.reference_count, 3);

        let err = store.delete_blob(&blob).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobReferenced { .. }));
        assert_eq!(store.blob_content(&digest).await.unwrap(), content);

        for repo in ["a", "b", "c"] {
            assert!(store.unlink_blob_from_repository(&digest, repo).await.unwrap());
        }
        assert!(!store.unlink_blob_from_repository(&digest, "a").await.unwrap());

        // The stale record still says 3; the fresh count is what matters.
        store.delete_blob(&blob).await.unwrap();
        assert!(!store.blob_exists(&digest).await.unwrap());
        assert!(!store.bucket.exists(&blob.location).await.unwrap());
    }

    #[tokio::test]
    async fn mount_requires_source_link() {
        let (store, _) = fixture();
        let content = b"mountable";
        let digest = Digest::calculate(content);
        store.store_blob(&digest, content, None).await.unwrap();

        assert!(!store.mount_blob(&digest, "source", "target").await.unwrap());
        assert_eq!(store.require_blob(&digest).await.unwrap().reference_count, 0);

        store.link_blob_to_repository(&digest, "source").await.unwrap();
        assert!(store.mount_blob(&digest, "source", "target").await.unwrap());
        assert!(store.blob_linked(&digest, "target").await.unwrap());
        assert_eq!(store.require_blob(&digest).await.unwrap().reference_count, 2);

        let unknown = Digest::calculate(b"unknown");
        assert!(!store.mount_blob(&unknown, "source", "target").await.unwrap());
    }

    #[tokio::test]
    async fn stream_ranges_and_missing_content() {
        let (store, _) = fixture();
        let content = b"0123456789";
        let digest = Digest::calculate(content);
        let blob = store.store_blob(&digest, content, None).await.unwrap();

        let (_, mut reader) = store.stream_blob(&digest, Some(2..5)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"234");

        let err = store.stream_blob(&digest, Some(5..20)).await.err().unwrap();
        assert!(matches!(err, RegistryError::RangeNotSatisfiable));

        store.bucket.delete(&blob.location).await.unwrap();
        let err = store.stream_blob(&digest, None).await.err().unwrap();
        assert!(matches!(err, RegistryError::BlobContentMissing { .. }));

        let err = store.stream_blob(&Digest::calculate(b"nope"), None).await.err().unwrap();
        assert!(matches!(err, RegistryError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn orphans_include_unlinked_and_zero_count() {
        let (store, _) = fixture();
        let linked = Digest::calculate(b"linked");
        let unlinked = Digest::calculate(b"unlinked");
        store.store_blob(&linked, b"linked", None).await.unwrap();
        store.store_blob(&unlinked, b"unlinked", None).await.unwrap();
        store.link_blob_to_repository(&linked, "repo").await.unwrap();

        let orphans: Vec<Digest> = store
            .orphaned_blobs()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.digest)
            .collect();
        assert_eq!(orphans, vec![unlinked]);

        store.metadata.set_reference_count(&linked, 0).await.unwrap();
        assert_eq!(store.orphaned_blobs().await.unwrap().len(), 2);
    }
}
