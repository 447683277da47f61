//! Registry records: blobs, manifests, tags, upload sessions and repositories.

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;
use crate::manifest::media_types;

/// An immutable, content-addressed object (a layer or an image config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Content digest, unique across the registry.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Media type declared when the blob was stored.
    pub media_type: Option<String>,
    /// Path of the content within the storage bucket.
    pub location: Utf8PathBuf,
    /// Number of repositories linking this blob.
    pub reference_count: u64,
    /// When the blob was first stored.
    pub created_at: DateTime<Utc>,
}

/// Platform an image was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
}

/// A stored manifest or index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Digest of `body`.
    pub digest: Digest,
    /// Media type the manifest was stored with.
    pub media_type: String,
    /// The exact bytes pushed by the client.
    pub body: String,
    /// Length of `body` in bytes.
    pub size: u64,
    /// Layer digests for image manifests, child manifest digests for indexes.
    pub layer_digests: Vec<Digest>,
    /// Config blob digest, for image manifests.
    pub config_digest: Option<Digest>,
    /// Platform, taken from the first entry of an index.
    pub platform: Option<Platform>,
    /// Repository the manifest was first pushed to.
    pub repository: String,
    /// When the manifest was first stored.
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Whether this is a multi-platform index.
    pub fn is_index(&self) -> bool {
        media_types::is_index(&self.media_type)
    }

    /// Blobs this manifest pins in its repository: the config and the layers.
    ///
    /// Indexes reference other manifests, not blobs, and pin nothing.
    pub fn blob_references(&self) -> Vec<Digest> {
        if self.is_index() {
            return Vec::new();
        }

        let mut digests: Vec<Digest> = self.config_digest.iter().cloned().collect();
        for layer in &self.layer_digests {
            if !digests.contains(layer) {
                digests.push(layer.clone());
            }
        }
        digests
    }
}

/// A mutable name pointing at a manifest within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Repository name.
    pub repository: String,
    /// Tag name.
    pub name: String,
    /// The manifest this tag points at.
    pub manifest_digest: Digest,
    /// When the tag was first created.
    pub created_at: DateTime<Utc>,
    /// When the tag was last repointed.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of an upload session.
///
/// `Pending -> Uploading -> Complete`, or `Failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadStatus {
    /// Created, no bytes received yet.
    Pending,
    /// At least one chunk received.
    Uploading,
    /// Stored as a blob.
    Complete,
    /// Cancelled, expired, or failed verification.
    Failed,
}

impl UploadStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A resumable blob upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    /// Opaque session id.
    pub id: Uuid,
    /// Repository the blob will be linked into.
    pub repository: String,
    /// Current state.
    pub status: UploadStatus,
    /// Path of the temporary object accumulating the chunks.
    pub temp_path: Utf8PathBuf,
    /// One past the highest byte offset written so far. Never decreases.
    pub uploaded_bytes: u64,
    /// Digest supplied when the upload was completed.
    pub expected_digest: Option<Digest>,
    /// When the session started.
    pub created_at: DateTime<Utc>,
    /// When the session last changed.
    pub updated_at: DateTime<Utc>,
    /// After this instant the session is no longer active.
    pub expires_at: DateTime<Utc>,
}

impl Upload {
    /// A new pending session.
    pub fn new(
        repository: impl Into<String>,
        temp_path: Utf8PathBuf,
        id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            repository: repository.into(),
            status: UploadStatus::Pending,
            temp_path,
            uploaded_bytes: 0,
            expected_digest: None,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }

    /// Whether the session has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Pending or uploading, and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && !self.is_expired(now)
    }

    /// Record that bytes up to and including `end` have been written.
    pub fn advance(&mut self, end: u64, now: DateTime<Utc>) {
        self.uploaded_bytes = self.uploaded_bytes.max(end.saturating_add(1));
        self.status = UploadStatus::Uploading;
        self.updated_at = now;
    }

    /// Move to `Failed`, unless the upload already completed.
    pub fn fail(&mut self, now: DateTime<Utc>) {
        if self.status != UploadStatus::Complete {
            self.status = UploadStatus::Failed;
            self.updated_at = now;
        }
    }

    /// Move to `Complete`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = UploadStatus::Complete;
        self.updated_at = now;
    }

    /// The `Range` header value describing received bytes, e.g. `0-1023`.
    pub fn range(&self) -> String {
        format!("0-{}", self.uploaded_bytes.saturating_sub(1))
    }
}

/// Who can pull from a repository. Enforcement belongs to the authorization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// Anyone may pull.
    Public,
    /// Only authorized clients may pull.
    #[default]
    Private,
}

/// Aggregate counters for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepositoryStats {
    /// Manifest pulls served.
    pub pull_count: u64,
    /// Manifest pushes accepted.
    pub push_count: u64,
    /// Tags currently in the repository.
    pub tag_count: u64,
    /// Manifests currently in the repository.
    pub manifest_count: u64,
    /// Total size of blobs linked to the repository.
    pub total_size: u64,
}

/// A docker namespace, e.g. `library/alpine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Validated repository name.
    pub name: String,
    /// Pull visibility.
    pub visibility: Visibility,
    /// Disabled repositories refuse pushes and new uploads.
    pub enabled: bool,
    /// Aggregate counters.
    pub stats: RepositoryStats,
    /// When the repository was created.
    pub created_at: DateTime<Utc>,
    /// Last accepted manifest push.
    pub last_push_at: Option<DateTime<Utc>>,
    /// Last manifest pull.
    pub last_pull_at: Option<DateTime<Utc>>,
}

impl Repository {
    /// A new, enabled, private repository with zeroed counters.
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::default(),
            enabled: true,
            stats: RepositoryStats::default(),
            created_at: now,
            last_push_at: None,
            last_pull_at: None,
        }
    }
}
