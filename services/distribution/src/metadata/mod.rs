//! Record layer for blobs, manifests, tags, uploads and repositories.
//!
//! Content lives in the storage bucket; everything the registry knows *about*
//! that content lives behind [`MetadataStore`]. Each method is one unit of work:
//! a link and its reference count change together, and a blob record is only
//! removed after a fresh check that nothing links it.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::model::{Blob, Manifest, Repository, RepositoryStats, Tag, Upload, Visibility};

mod memory;

pub use memory::MemoryMetadata;

/// Outcome of an insert keyed on a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert<T> {
    /// The record was new and has been stored.
    Created(T),
    /// A record with the same key already existed; it is returned unchanged.
    Existing(T),
}

impl<T> Insert<T> {
    /// Whether the insert created a new record.
    pub fn is_created(&self) -> bool {
        matches!(self, Insert::Created(_))
    }

    /// The stored record, new or existing.
    pub fn into_inner(self) -> T {
        match self {
            Insert::Created(value) | Insert::Existing(value) => value,
        }
    }
}

/// A change to a repository record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryUpdate {
    /// Count a manifest push.
    RecordPush(DateTime<Utc>),
    /// Count a manifest pull.
    RecordPull(DateTime<Utc>),
    /// Replace the derived counters. Push and pull counts are kept.
    Statistics(RepositoryStats),
    /// Enable or disable writes.
    Enabled(bool),
    /// Change pull visibility.
    Visibility(Visibility),
}

/// Persistent registry records.
#[async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Look up a blob record.
    async fn blob(&self, digest: &Digest) -> RegistryResult<Option<Blob>>;

    /// Insert a blob record, treating the digest as unique.
    ///
    /// A concurrent insert of the same digest yields [`Insert::Existing`] with
    /// the winner's record.
    async fn insert_blob(&self, blob: Blob) -> RegistryResult<Insert<Blob>>;

    /// Remove a blob record if nothing references it.
    ///
    /// Fails with `BlobReferenced` when the reference count is non-zero or any
    /// repository still links the blob, and `BlobNotFound` when there is no record.
    async fn remove_unreferenced_blob(&self, digest: &Digest) -> RegistryResult<Blob>;

    /// All blob records, ordered by digest.
    async fn blobs(&self) -> RegistryResult<Vec<Blob>>;

    /// Link a blob into a repository, incrementing its reference count.
    ///
    /// Returns `false` if the pair was already linked.
    async fn link_blob(&self, digest: &Digest, repository: &str) -> RegistryResult<bool>;

    /// Unlink a blob from a repository, decrementing its reference count.
    ///
    /// Returns `false` if the pair was not linked.
    async fn unlink_blob(&self, digest: &Digest, repository: &str) -> RegistryResult<bool>;

    /// Repositories linking a blob, sorted.
    async fn blob_repositories(&self, digest: &Digest) -> RegistryResult<Vec<String>>;

    /// Blobs linked into a repository, ordered by digest.
    async fn repository_blobs(&self, repository: &str) -> RegistryResult<Vec<Digest>>;

    /// Overwrite a blob's reference count. Returns whether it changed.
    async fn set_reference_count(&self, digest: &Digest, count: u64) -> RegistryResult<bool>;

    /// Reset a blob's reference count to its number of links.
    ///
    /// Returns the previous count when it was wrong.
    async fn reconcile_reference_count(&self, digest: &Digest) -> RegistryResult<Option<u64>>;

    /// Look up a manifest by digest.
    async fn manifest(&self, digest: &Digest) -> RegistryResult<Option<Manifest>>;

    /// Insert a manifest record, treating the digest as unique.
    async fn insert_manifest(&self, manifest: Manifest) -> RegistryResult<Insert<Manifest>>;

    /// Make a manifest visible in a repository. Returns `false` if it already was.
    async fn link_manifest(&self, digest: &Digest, repository: &str) -> RegistryResult<bool>;

    /// Remove a manifest from a repository. The record itself is dropped once
    /// no repository holds it. Returns `false` if it was not linked.
    async fn unlink_manifest(&self, digest: &Digest, repository: &str) -> RegistryResult<bool>;

    /// Whether a repository holds a manifest.
    async fn manifest_linked(&self, digest: &Digest, repository: &str) -> RegistryResult<bool>;

    /// Manifests held by a repository, ordered by digest.
    async fn repository_manifests(&self, repository: &str) -> RegistryResult<Vec<Digest>>;

    /// Create a tag or repoint an existing one.
    async fn put_tag(
        &self,
        repository: &str,
        name: &str,
        digest: &Digest,
        now: DateTime<Utc>,
    ) -> RegistryResult<Tag>;

    /// Look up a tag.
    async fn tag(&self, repository: &str, name: &str) -> RegistryResult<Option<Tag>>;

    /// Remove a tag, returning it if it existed.
    async fn remove_tag(&self, repository: &str, name: &str) -> RegistryResult<Option<Tag>>;

    /// Tags in a repository, sorted by name.
    async fn tags(&self, repository: &str) -> RegistryResult<Vec<Tag>>;

    /// Record a new upload session.
    async fn insert_upload(&self, upload: Upload) -> RegistryResult<()>;

    /// Look up an upload session.
    async fn upload(&self, id: &Uuid) -> RegistryResult<Option<Upload>>;

    /// Persist changes to an upload session.
    ///
    /// The stored `uploaded_bytes` never decreases. Returns the stored record.
    async fn save_upload(&self, upload: Upload) -> RegistryResult<Upload>;

    /// Forget an upload session.
    async fn remove_upload(&self, id: &Uuid) -> RegistryResult<Option<Upload>>;

    /// All upload sessions, oldest first.
    async fn uploads(&self) -> RegistryResult<Vec<Upload>>;

    /// Look up a repository.
    async fn repository(&self, name: &str) -> RegistryResult<Option<Repository>>;

    /// Fetch a repository, creating it if needed.
    async fn ensure_repository(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<Insert<Repository>>;

    /// Apply a change to a repository record.
    async fn update_repository(
        &self,
        name: &str,
        update: RepositoryUpdate,
    ) -> RegistryResult<Repository>;

    /// Remove a repository record. Tags, links and manifests are not touched.
    async fn remove_repository(&self, name: &str) -> RegistryResult<Option<Repository>>;

    /// All repositories, sorted by name.
    async fn repositories(&self) -> RegistryResult<Vec<Repository>>;
}
