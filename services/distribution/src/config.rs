//! Registry configuration
//!
//! Passed explicitly into each service; nothing is read from the environment.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;

/// Settings for the storage engine and garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Storage bucket holding blobs, uploads and metadata snapshots.
    pub bucket: String,
    /// Path prefix for blob content.
    pub blob_prefix: Utf8PathBuf,
    /// Path prefix for in-progress uploads.
    pub upload_prefix: Utf8PathBuf,
    /// Number of leading hex characters used as a shard directory.
    pub shard_width: usize,
    /// Seconds an upload session stays active after its last write.
    pub upload_timeout: u64,
    /// Uploads older than this many hours are stale regardless of their expiry.
    pub stale_upload_hours: u64,
    /// Run garbage collection periodically in the server.
    pub gc_enabled: bool,
    /// Seconds between periodic garbage collection runs.
    pub gc_interval: u64,
    /// Bytes per frame when streaming blob content.
    pub stream_chunk_size: usize,
    /// Largest blob an upload session may grow to, in bytes.
    pub max_blob_size: u64,
    /// Where the metadata snapshot is kept in the bucket, if anywhere.
    pub snapshot_path: Option<Utf8PathBuf>,
    /// Seconds between periodic metadata snapshots in the server.
    pub snapshot_interval: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bucket: "registry".to_string(),
            blob_prefix: Utf8PathBuf::from("blobs"),
            upload_prefix: Utf8PathBuf::from("uploads"),
            shard_width: 2,
            upload_timeout: 3600,
            stale_upload_hours: 24,
            gc_enabled: false,
            gc_interval: 3600,
            stream_chunk_size: 64 * 1024,
            max_blob_size: 10 * 1024 * 1024 * 1024,
            snapshot_path: Some(Utf8PathBuf::from("metadata.json")),
            snapshot_interval: 300,
        }
    }
}

impl RegistryConfig {
    /// Upload session lifetime. Out-of-range values saturate.
    pub fn upload_timeout(&self) -> TimeDelta {
        i64::try_from(self.upload_timeout)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Age at which an unfinished upload is stale. Out-of-range values saturate.
    pub fn stale_after(&self) -> TimeDelta {
        i64::try_from(self.stale_upload_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX)
    }

    /// When a session touched at `now` expires.
    pub fn upload_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.upload_timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Uploads created before this instant are stale.
    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.stale_after())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Content path for a blob, e.g. `blobs/sha256/ab/abcdef...`.
    pub fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        let hex = digest.hex();
        let shard = &hex[..self.shard_width.min(hex.len())];

        let mut path = self.blob_prefix.join(digest.algorithm().as_str());
        if !shard.is_empty() {
            path.push(shard);
        }
        path.push(hex);
        path
    }

    /// Temporary object for an upload session.
    pub fn upload_path(&self, id: &Uuid) -> Utf8PathBuf {
        self.upload_prefix.join(id.to_string()).join("data")
    }

    /// Whether `path` lies under the upload prefix.
    pub fn is_upload_path(&self, path: &Utf8Path) -> bool {
        path.starts_with(&self.upload_prefix)
    }

    /// The digest whose content path is exactly `path`, if any.
    pub fn blob_digest(&self, path: &Utf8Path) -> Option<Digest> {
        let relative = path.strip_prefix(&self.blob_prefix).ok()?;
        let algorithm = relative.components().next()?.as_str();
        let digest: Digest = format!("{algorithm}:{}", relative.file_name()?).parse().ok()?;
        (self.blob_path(&digest).as_path() == path).then_some(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths_are_sharded() {
        let config = RegistryConfig::default();
        let digest = Digest::calculate(b"");
        assert_eq!(
            config.blob_path(&digest).as_str(),
            "blobs/sha256/e3/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let flat = RegistryConfig {
            shard_width: 0,
            ..RegistryConfig::default()
        };
        assert_eq!(
            flat.blob_path(&digest).as_str(),
            "blobs/sha256/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn upload_paths() {
        let config = RegistryConfig::default();
        let id = Uuid::nil();
        let path = config.upload_path(&id);
        assert_eq!(
            path.as_str(),
            "uploads/00000000-0000-0000-0000-000000000000/data"
        );
        assert!(config.is_upload_path(&path));
        assert!(!config.is_upload_path(Utf8Path::new("blobs/sha256/ab/abc")));
        assert!(!config.is_upload_path(Utf8Path::new("uploadsx/data")));
    }

    #[test]
    fn blob_paths_map_back_to_digests() {
        let config = RegistryConfig::default();
        let digest = Digest::calculate(b"content");
        assert_eq!(config.blob_digest(&config.blob_path(&digest)), Some(digest.clone()));

        let hex = digest.hex();
        let misplaced = Utf8PathBuf::from(format!("blobs/sha256/zz/{hex}"));
        assert_eq!(config.blob_digest(&misplaced), None);
        assert_eq!(config.blob_digest(Utf8Path::new("blobs/sha256/ab/not-a-digest")), None);
        assert_eq!(config.blob_digest(Utf8Path::new("uploads/x/data")), None);
    }

    #[test]
    fn deserializes_kebab_case_with_defaults() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"upload-timeout": 60, "gc-enabled": true}"#).unwrap();
        assert_eq!(config.upload_timeout, 60);
        assert!(config.gc_enabled);
        assert_eq!(config.shard_width, 2);
        assert_eq!(config.upload_timeout(), chrono::Duration::seconds(60));
    }

    #[test]
    fn huge_durations_saturate() {
        let config = RegistryConfig {
            upload_timeout: u64::MAX,
            stale_upload_hours: u64::MAX,
            ..RegistryConfig::default()
        };
        let now = Utc::now();
        assert_eq!(config.upload_timeout(), TimeDelta::MAX);
        assert_eq!(config.upload_expiry(now), DateTime::<Utc>::MAX_UTC);
        assert_eq!(config.stale_cutoff(now), DateTime::<Utc>::MIN_UTC);

        let config = RegistryConfig::default();
        assert_eq!(config.upload_expiry(now), now + TimeDelta::seconds(3600));
        assert_eq!(config.stale_cutoff(now), now - TimeDelta::hours(24));
    }
}
