//! Garbage collection
//!
//! Finds blobs nothing references and upload sessions nobody finished, and
//! removes them. Deletion re-checks the reference count at the moment of
//! removal; a blob linked after the scan is skipped and reconsidered on the
//! next pass. Stored objects that no record claims, such as content written
//! before a crash lost the metadata, are swept once they outlive the stale
//! threshold.

use std::collections::HashSet;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use storage::StorageErrorKind;
use serde::Serialize;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::MetadataStore;
use crate::model::{Blob, Upload};

/// An orphaned blob found by a collection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobCandidate {
    /// Blob digest.
    pub digest: Digest,
    /// Bytes reclaimed by deleting it.
    pub size: u64,
}

impl From<&Blob> for BlobCandidate {
    fn from(blob: &Blob) -> Self {
        Self {
            digest: blob.digest.clone(),
            size: blob.size,
        }
    }
}

/// A stale upload found by a collection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadCandidate {
    /// Upload id.
    pub id: Uuid,
    /// Repository the upload was for.
    pub repository: String,
    /// When the upload started.
    pub created_at: DateTime<Utc>,
    /// When the upload last changed.
    pub updated_at: DateTime<Utc>,
    /// When the upload expired or will expire.
    pub expires_at: DateTime<Utc>,
}

impl From<&Upload> for UploadCandidate {
    fn from(upload: &Upload) -> Self {
        Self {
            id: upload.id,
            repository: upload.repository.clone(),
            created_at: upload.created_at,
            updated_at: upload.updated_at,
            expires_at: upload.expires_at,
        }
    }
}

/// Outcome of [`GarbageCollector::collect_garbage`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GcReport {
    /// Whether anything was actually removed.
    pub dry_run: bool,
    /// Orphaned blobs found.
    pub blobs: Vec<BlobCandidate>,
    /// Stale uploads found.
    pub uploads: Vec<UploadCandidate>,
    /// Candidates left in place because they were referenced again at deletion time.
    pub skipped: Vec<Digest>,
    /// Finished upload records dropped.
    pub pruned_uploads: usize,
    /// Stored objects no record claims.
    pub untracked: Vec<Utf8PathBuf>,
}

impl GcReport {
    /// Number of orphaned blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Number of stale uploads.
    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    /// Total size of the orphaned blobs.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.blobs.iter().map(|blob| blob.size).sum()
    }
}

/// Point-in-time storage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GcStatistics {
    /// Blob records.
    pub total_blobs: usize,
    /// Bytes across all blobs.
    pub total_size: u64,
    /// Blobs eligible for collection.
    pub orphaned_blobs: usize,
    /// Bytes across orphaned blobs.
    pub orphaned_size: u64,
    /// Unfinished uploads eligible for collection.
    pub stale_uploads: usize,
}

/// Removes orphaned blobs and stale uploads.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    config: Arc<RegistryConfig>,
}

impl GarbageCollector {
    /// Create a collector over `blobs`.
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            metadata: blobs.metadata.clone(),
            config: blobs.config.clone(),
            blobs,
        }
    }

    /// Blobs linked by no repository, or with a zero reference count.
    pub async fn find_orphaned_blobs(&self) -> RegistryResult<Vec<Blob>> {
        self.blobs.orphaned_blobs().await
    }

    /// Unfinished uploads past their expiry or the stale threshold.
    pub async fn find_stale_uploads(&self) -> RegistryResult<Vec<Upload>> {
        self.blobs.stale_uploads().await
    }

    /// Objects under the blob and upload prefixes that no blob or upload
    /// record claims and that are older than the stale threshold.
    pub async fn find_untracked_objects(&self) -> RegistryResult<Vec<Utf8PathBuf>> {
        let mut tracked: HashSet<Utf8PathBuf> = self
            .metadata
            .blobs()
            .await?
            .into_iter()
            .map(|blob| blob.location)
            .collect();
        tracked.extend(
            self.metadata
                .uploads()
                .await?
                .into_iter()
                .map(|upload| upload.temp_path),
        );

        let cutoff = self.config.stale_cutoff(Utc::now());
        let mut untracked = Vec::new();
        for prefix in [&self.config.blob_prefix, &self.config.upload_prefix] {
            for path in self.blobs.bucket.list(Some(prefix.as_path())).await? {
                let path = Utf8PathBuf::from(path);
                if tracked.contains(&path) {
                    continue;
                }
                match self.blobs.bucket.metadata(&path).await {
                    Ok(object) if object.created <= cutoff => untracked.push(path),
                    Ok(_) => {}
                    Err(err) if err.kind() == StorageErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(untracked)
    }

    /// Delete an untracked object unless a blob record claimed it since the scan.
    async fn sweep(&self, path: &Utf8Path) -> RegistryResult<bool> {
        if let Some(digest) = self.config.blob_digest(path) {
            if self.metadata.blob(&digest).await?.is_some() {
                tracing::debug!(%path, "object claimed since scan, keeping");
                return Ok(false);
            }
        }
        match self.blobs.bucket.delete(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Find and, unless `dry_run`, remove orphaned blobs, stale uploads and
    /// untracked objects.
    ///
    /// A dry run reports the same candidates a real run would remove.
    #[tracing::instrument(skip(self))]
    pub async fn collect_garbage(&self, dry_run: bool) -> RegistryResult<GcReport> {
        let orphans = self.find_orphaned_blobs().await?;
        let stale = self.find_stale_uploads().await?;
        let untracked = self.find_untracked_objects().await?;

        let mut report = GcReport {
            dry_run,
            blobs: orphans.iter().map(BlobCandidate::from).collect(),
            uploads: stale.iter().map(UploadCandidate::from).collect(),
            ..GcReport::default()
        };

        for blob in &orphans {
            tracing::debug!(digest = %blob.digest, size = blob.size, dry_run, "orphaned blob");
        }
        for upload in &stale {
            tracing::debug!(id = %upload.id, repository = %upload.repository, dry_run, "stale upload");
        }

        if !dry_run {
            for blob in &orphans {
                match self.blobs.delete_blob(blob).await {
                    Ok(_) => {}
                    Err(RegistryError::BlobReferenced { digest, references }) => {
                        tracing::warn!(%digest, references, "blob referenced again, skipping");
                        report.skipped.push(digest);
                    }
                    Err(RegistryError::BlobNotFound(digest)) => {
                        tracing::debug!(%digest, "blob already removed");
                    }
                    Err(err) => return Err(err),
                }
            }

            for upload in &stale {
                self.blobs.cancel_upload(&upload.id).await?;
            }

            report.pruned_uploads = self.prune_finished_uploads().await?;

            for path in untracked {
                if self.sweep(&path).await? {
                    tracing::warn!(%path, "removed untracked object");
                    report.untracked.push(path);
                }
            }
        } else {
            report.untracked = untracked;
        }

        tracing::info!(
            dry_run,
            blobs = report.blob_count(),
            uploads = report.upload_count(),
            skipped = report.skipped.len(),
            untracked = report.untracked.len(),
            reclaimable = report.reclaimable_bytes(),
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Drop completed and failed upload records older than the stale threshold.
    async fn prune_finished_uploads(&self) -> RegistryResult<usize> {
        let cutoff = self.config.stale_cutoff(Utc::now());
        let mut pruned = 0;
        for upload in self.metadata.uploads().await? {
            if upload.status.is_terminal() && upload.updated_at < cutoff {
                self.blobs.discard(&upload.temp_path).await;
                self.metadata.remove_upload(&upload.id).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Reset every blob's reference count to its number of repository links.
    ///
    /// Returns how many records were corrected.
    #[tracing::instrument(skip(self))]
    pub async fn recalculate_blob_references(&self) -> RegistryResult<usize> {
        let mut corrected = 0;
        for blob in self.metadata.blobs().await? {
            match self.metadata.reconcile_reference_count(&blob.digest).await {
                Ok(Some(previous)) => {
                    tracing::warn!(digest = %blob.digest, previous, "corrected reference count");
                    corrected += 1;
                }
                Ok(None) | Err(RegistryError::BlobNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        tracing::info!(corrected, "recalculated reference counts");
        Ok(corrected)
    }

    /// Current blob, orphan and stale upload figures.
    pub async fn statistics(&self) -> RegistryResult<GcStatistics> {
        let blobs = self.metadata.blobs().await?;
        let orphans = self.find_orphaned_blobs().await?;
        let stale = self.find_stale_uploads().await?;

        Ok(GcStatistics {
            total_blobs: blobs.len(),
            total_size: blobs.iter().map(|blob| blob.size).sum(),
            orphaned_blobs: orphans.len(),
            orphaned_size: orphans.iter().map(|blob| blob.size).sum(),
            stale_uploads: stale.len(),
        })
    }
}
