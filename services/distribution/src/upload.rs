//! Resumable chunked uploads
//!
//! An upload session accumulates bytes in a temporary object under the upload
//! prefix. Chunks carry their absolute offset, so they may arrive out of order.
//! Completion verifies the digest and promotes the temporary object to a blob.

use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncReadExt};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::model::{Blob, Upload};

impl BlobStore {
    /// Start an upload session for `repository` with an empty temporary object.
    #[tracing::instrument(skip(self))]
    pub async fn init_chunked_upload(&self, repository: &str) -> RegistryResult<Upload> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let temp = self.config.upload_path(&id);

        self.bucket.upload(&temp, &mut &b""[..]).await?;
        let upload = Upload::new(repository, temp, id, now, self.config.upload_expiry(now));
        self.metadata.insert_upload(upload.clone()).await?;

        tracing::debug!(%id, "started upload");
        Ok(upload)
    }

    /// Look up an upload session.
    pub async fn upload(&self, id: &Uuid) -> RegistryResult<Upload> {
        self.metadata
            .upload(id)
            .await?
            .ok_or(RegistryError::UploadNotFound(*id))
    }

    async fn active_upload(&self, id: &Uuid) -> RegistryResult<Upload> {
        let upload = self.upload(id).await?;
        if !upload.is_active(Utc::now()) {
            return Err(RegistryError::UploadInactive {
                id: *id,
                status: upload.status,
            });
        }
        Ok(upload)
    }

    /// Write `content` at bytes `start..=end` of the upload.
    ///
    /// The declared range must match the payload length exactly and stay
    /// below the configured maximum blob size.
    #[tracing::instrument(skip(self, content), fields(size = content.len()))]
    pub async fn append_chunk(
        &self,
        id: &Uuid,
        content: &[u8],
        start: u64,
        end: u64,
    ) -> RegistryResult<Upload> {
        let length = content.len() as u64;
        let invalid = || RegistryError::InvalidRange { start, end, length };
        let declared = end
            .checked_sub(start)
            .and_then(|span| span.checked_add(1))
            .ok_or_else(invalid)?;
        if declared != length || end >= self.config.max_blob_size {
            return Err(invalid());
        }

        let mut upload = self.active_upload(id).await?;
        self.bucket
            .write_at(&upload.temp_path, start, &mut &content[..])
            .await?;

        let now = Utc::now();
        upload.advance(end, now);
        upload.expires_at = self.config.upload_expiry(now);
        let upload = self.metadata.save_upload(upload).await?;

        tracing::trace!(uploaded = upload.uploaded_bytes, "wrote chunk");
        Ok(upload)
    }

    /// Append everything from `reader` after the bytes received so far.
    ///
    /// Returns the number of bytes written. Growing past the maximum blob
    /// size fails the upload.
    #[tracing::instrument(skip(self, reader))]
    pub async fn append_chunk_from_stream<R>(&self, id: &Uuid, reader: &mut R) -> RegistryResult<u64>
    where
        R: AsyncBufRead + Unpin + Send + Sync,
    {
        let mut upload = self.active_upload(id).await?;
        let offset = upload.uploaded_bytes;
        let remaining = self.config.max_blob_size.saturating_sub(offset);

        // One byte past the limit is enough to tell an oversized stream apart.
        let mut limited = AsyncReadExt::take(&mut *reader, remaining.saturating_add(1));
        let written = self
            .bucket
            .write_at(&upload.temp_path, offset, &mut limited)
            .await?;

        if written > remaining {
            tracing::warn!(offset, written, "upload exceeds maximum blob size");
            self.abandon(upload).await;
            return Err(RegistryError::InvalidRange {
                start: offset,
                end: offset.saturating_add(written - 1),
                length: written,
            });
        }

        if written > 0 {
            let now = Utc::now();
            upload.advance(offset + written - 1, now);
            upload.expires_at = self.config.upload_expiry(now);
            self.metadata.save_upload(upload).await?;
        }

        tracing::trace!(written, "appended stream");
        Ok(written)
    }

    /// Finish an upload: verify, store as a blob, and link it to the upload's repository.
    ///
    /// Without an expected digest the computed one is used. Any failure,
    /// including a digest mismatch, leaves the upload `Failed` with its
    /// temporary object removed.
    #[tracing::instrument(skip(self))]
    pub async fn complete_chunked_upload(
        &self,
        id: &Uuid,
        expected: Option<&Digest>,
    ) -> RegistryResult<Blob> {
        let mut upload = self.active_upload(id).await?;

        let blob = match self.finish(&upload, expected).await {
            Ok(blob) => blob,
            Err(err) => {
                tracing::warn!(error = %err, "upload failed to complete");
                self.abandon(upload).await;
                return Err(err);
            }
        };
        self.discard(&upload.temp_path).await;

        upload.expected_digest = Some(blob.digest.clone());
        upload.complete(Utc::now());
        self.metadata.save_upload(upload).await?;

        tracing::info!(digest = %blob.digest, size = blob.size, "completed upload");
        Ok(blob)
    }

    async fn finish(&self, upload: &Upload, expected: Option<&Digest>) -> RegistryResult<Blob> {
        let mut reader = self.bucket.open(&upload.temp_path, None).await?;
        let (actual, size) = Digest::calculate_from_stream(&mut reader).await?;
        drop(reader);

        if let Some(expected) = expected {
            if !expected.matches(&actual) {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let blob = self.promote(&actual, &upload.temp_path, size, None).await?;
        self.metadata.link_blob(&blob.digest, &upload.repository).await?;
        Ok(blob)
    }

    /// Mark an upload `Failed` and drop its temporary object, logging rather than failing.
    async fn abandon(&self, mut upload: Upload) {
        self.discard(&upload.temp_path).await;
        upload.fail(Utc::now());
        if let Err(err) = self.metadata.save_upload(upload).await {
            tracing::warn!(error = %err, "failed to record upload failure");
        }
    }

    /// Cancel an upload, removing its temporary object.
    ///
    /// Works on inactive sessions too. A completed upload keeps its status.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_upload(&self, id: &Uuid) -> RegistryResult<Upload> {
        let mut upload = self.upload(id).await?;
        self.discard(&upload.temp_path).await;

        upload.fail(Utc::now());
        let upload = self.metadata.save_upload(upload).await?;
        tracing::debug!(status = %upload.status, "cancelled upload");
        Ok(upload)
    }

    /// Unfinished uploads that have expired or outlived the stale threshold.
    pub async fn stale_uploads(&self) -> RegistryResult<Vec<Upload>> {
        let now = Utc::now();
        let cutoff = self.config.stale_cutoff(now);
        Ok(self
            .metadata
            .uploads()
            .await?
            .into_iter()
            .filter(|upload| {
                !upload.status.is_terminal()
                    && (upload.is_expired(now) || upload.created_at < cutoff)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Range;
    use std::sync::Arc;

    use camino::Utf8Path;
    use storage::{
        BoxReader, Driver, MemoryStorage, Metadata, Reader, StorageError, StorageErrorKind, Writer,
    };

    use super::*;
    use crate::blob::tests::{fixture, fixture_with};
    use crate::config::RegistryConfig;
    use crate::metadata::MemoryMetadata;
    use crate::model::UploadStatus;
    fn content() -> Vec<u8> {
        (0..300u32).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn in_order_chunks() {
        let (store, _) = fixture();
        let content = content();
        let upload = store.init_chunked_upload("library/alpine").await.unwrap();
        assert_eq!(upload.status, UploadStatus::Pending);

        for (start, chunk) in content.chunks(100).enumerate() {
            let start = (start * 100) as u64;
            store
                .append_chunk(&upload.id, chunk, start, start + chunk.len() as u64 - 1)
                .await
                .unwrap();
        }

        let digest = Digest::calculate(&content);
        let blob = store
            .complete_chunked_upload(&upload.id, Some(&digest))
            .await
            .unwrap();
        assert_eq!(blob.digest, digest);
        assert_eq!(blob.reference_count, 0);
        assert!(store.blob_linked(&digest, "library/alpine").await.unwrap());
        assert_eq!(store.require_blob(&digest).await.unwrap().reference_count, 1);
        assert_eq!(store.upload(&upload.id).await.unwrap().status, UploadStatus::Complete);
        assert!(!store.bucket.exists(&upload.temp_path).await.unwrap());
    }

    #[tokio::test]
    async fn out_of_order_chunks_match_in_order_content() {
        let (store, _) = fixture();
        let content = content();
        let upload = store.init_chunked_upload("repo").await.unwrap();

        for (start, end) in [(0u64, 99u64), (200, 299), (100, 199)] {
            let chunk = &content[start as usize..=end as usize];
            let updated = store.append_chunk(&upload.id, chunk, start, end).await.unwrap();
            assert_eq!(updated.status, UploadStatus::Uploading);
        }
        let upload = store.upload(&upload.id).await.unwrap();
        assert_eq!(upload.uploaded_bytes, 300);
        assert_eq!(upload.range(), "0-299");

        let blob = store.complete_chunked_upload(&upload.id, None).await.unwrap();
        assert_eq!(blob.digest, Digest::calculate(&content));
        assert_eq!(store.blob_content(&blob.digest).await.unwrap(), content);
    }

    #[tokio::test]
    async fn range_must_match_payload() {
        let (store, _) = fixture();
        let upload = store.init_chunked_upload("repo").await.unwrap();

        let err = store.append_chunk(&upload.id, b"abc", 0, 3).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { length: 3, .. }));
        let err = store.append_chunk(&upload.id, b"abc", 5, 2).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { .. }));
        assert_eq!(store.upload(&upload.id).await.unwrap().uploaded_bytes, 0);
    }

    #[tokio::test]
    async fn stream_appends_after_received_bytes() {
        let (store, _) = fixture();
        let upload = store.init_chunked_upload("repo").await.unwrap();

        assert_eq!(
            store
                .append_chunk_from_stream(&upload.id, &mut &b"hello "[..])
                .await
                .unwrap(),
            6
        );
        store
            .append_chunk_from_stream(&upload.id, &mut &b"world"[..])
            .await
            .unwrap();

        let blob = store.complete_chunked_upload(&upload.id, None).await.unwrap();
        assert_eq!(store.blob_content(&blob.digest).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn mismatch_fails_upload() {
        let (store, _) = fixture();
        let upload = store.init_chunked_upload("repo").await.unwrap();
        store.append_chunk(&upload.id, b"data", 0, 3).await.unwrap();

        let wrong = Digest::calculate(b"other");
        let err = store
            .complete_chunked_upload(&upload.id, Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert_eq!(store.upload(&upload.id).await.unwrap().status, UploadStatus::Failed);
        assert!(!store.blob_exists(&wrong).await.unwrap());

        let err = store.append_chunk(&upload.id, b"more", 4, 7).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UploadInactive { status: UploadStatus::Failed, .. }
        ));
    }

    #[tokio::test]
    async fn cancel_and_staleness() {
        let (store, _) = fixture();
        let fresh = store.init_chunked_upload("repo").await.unwrap();
        let expired = store.init_chunked_upload("repo").await.unwrap();
        let old = store.init_chunked_upload("repo").await.unwrap();

        let mut record = store.upload(&expired.id).await.unwrap();
        record.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.metadata.save_upload(record).await.unwrap();

        let mut record = store.upload(&old.id).await.unwrap();
        record.created_at = Utc::now() - chrono::Duration::hours(48);
        store.metadata.save_upload(record).await.unwrap();

        let mut stale: Vec<Uuid> = store
            .stale_uploads()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        stale.sort();
        let mut want = vec![expired.id, old.id];
        want.sort();
        assert_eq!(stale, want);

        let err = store.append_chunk(&expired.id, b"x", 0, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::UploadInactive { .. }));

        let cancelled = store.cancel_upload(&expired.id).await.unwrap();
        assert_eq!(cancelled.status, UploadStatus::Failed);
        assert!(!store.bucket.exists(&expired.temp_path).await.unwrap());
        assert!(store.bucket.exists(&fresh.temp_path).await.unwrap());

        let err = store.cancel_upload(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn unaddressable_ranges_are_rejected() {
        let (store, memory) = fixture();
        let upload = store.init_chunked_upload("repo").await.unwrap();
        let max = store.config.max_blob_size;

        let err = store.append_chunk(&upload.id, b"", 0, u64::MAX).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { length: 0, .. }));
        let err = store
            .append_chunk(&upload.id, b"x", u64::MAX, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { .. }));
        let err = store
            .append_chunk(&upload.id, b"abc", max, max + 2)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { .. }));

        let upload = store.upload(&upload.id).await.unwrap();
        assert_eq!(upload.uploaded_bytes, 0);
        assert_eq!(upload.status, UploadStatus::Pending);
        assert_eq!(memory.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn oversized_stream_fails_upload() {
        let (store, _) = fixture_with(RegistryConfig {
            max_blob_size: 8,
            ..RegistryConfig::default()
        });
        let upload = store.init_chunked_upload("repo").await.unwrap();

        store
            .append_chunk_from_stream(&upload.id, &mut &b"hello"[..])
            .await
            .unwrap();
        let err = store
            .append_chunk_from_stream(&upload.id, &mut &b"world!"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { start: 5, .. }));

        assert_eq!(store.upload(&upload.id).await.unwrap().status, UploadStatus::Failed);
        assert!(!store.bucket.exists(&upload.temp_path).await.unwrap());
    }

    #[tokio::test]
    async fn unbounded_timeouts_never_expire() {
        let (store, _) = fixture_with(RegistryConfig {
            upload_timeout: u64::MAX,
            stale_upload_hours: u64::MAX,
            ..RegistryConfig::default()
        });

        let upload = store.init_chunked_upload("repo").await.unwrap();
        assert_eq!(upload.expires_at, chrono::DateTime::<Utc>::MAX_UTC);

        let upload = store.append_chunk(&upload.id, b"data", 0, 3).await.unwrap();
        assert_eq!(upload.expires_at, chrono::DateTime::<Utc>::MAX_UTC);
        assert!(store.stale_uploads().await.unwrap().is_empty());
    }

    /// Memory storage that refuses to move objects.
    #[derive(Debug)]
    struct RenameRefused(Arc<MemoryStorage>);

    #[async_trait::async_trait]
    impl Driver for RenameRefused {
        fn name(&self) -> &'static str {
            "rename-refused"
        }

        async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
            self.0.delete(bucket, remote).await
        }

        async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
            self.0.metadata(bucket, remote).await
        }

        async fn upload(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            reader: &mut Reader<'_>,
        ) -> Result<(), StorageError> {
            self.0.upload(bucket, remote, reader).await
        }

        async fn download(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            writer: &mut Writer<'_>,
        ) -> Result<(), StorageError> {
            self.0.download(bucket, remote, writer).await
        }

        async fn open(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            range: Option<Range<u64>>,
        ) -> Result<BoxReader, StorageError> {
            self.0.open(bucket, remote, range).await
        }

        async fn write_at(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            offset: u64,
            reader: &mut Reader<'_>,
        ) -> Result<u64, StorageError> {
            self.0.write_at(bucket, remote, offset, reader).await
        }

        async fn list(
            &self,
            bucket: &str,
            prefix: Option<&Utf8Path>,
        ) -> Result<Vec<String>, StorageError> {
            self.0.list(bucket, prefix).await
        }

        async fn rename(
            &self,
            _bucket: &str,
            _from: &Utf8Path,
            _to: &Utf8Path,
        ) -> Result<(), StorageError> {
            Err(StorageError::new(
                self.name(),
                StorageErrorKind::Io,
                std::io::Error::other("rename refused"),
            ))
        }
    }

    #[tokio::test]
    async fn storage_failure_on_completion_fails_upload() {
        let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
        let storage = storage::Storage::new(RenameRefused(memory.clone()));
        let store = BlobStore::new(
            storage.bucket("registry"),
            Arc::new(MemoryMetadata::new()),
            Arc::new(RegistryConfig::default()),
        );

        let upload = store.init_chunked_upload("repo").await.unwrap();
        store.append_chunk(&upload.id, b"data", 0, 3).await.unwrap();

        let digest = Digest::calculate(b"data");
        let err = store
            .complete_chunked_upload(&upload.id, Some(&digest))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));

        assert_eq!(store.upload(&upload.id).await.unwrap().status, UploadStatus::Failed);
        assert!(!store.bucket.exists(&upload.temp_path).await.unwrap());
        assert!(!store.blob_exists(&digest).await.unwrap());

        let err = store
            .complete_chunked_upload(&upload.id, Some(&digest))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UploadInactive { .. }));
    }
}
