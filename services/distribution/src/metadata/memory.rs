use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use storage::StorageBucket;
use uuid::Uuid;

use super::{Insert, MetadataStore, RepositoryUpdate};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::model::{Blob, Manifest, Repository, Tag, Upload};

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    blobs: BTreeMap<Digest, Blob>,
    blob_links: BTreeMap<Digest, BTreeSet<String>>,
    manifests: BTreeMap<Digest, Manifest>,
    manifest_links: BTreeMap<Digest, BTreeSet<String>>,
    tags: BTreeMap<String, BTreeMap<String, Tag>>,
    uploads: BTreeMap<Uuid, Upload>,
    repositories: BTreeMap<String, Repository>,
}

impl State {
    fn link_count(&self, digest: &Digest) -> u64 {
        self.blob_links.get(digest).map_or(0, |links| links.len() as u64)
    }
}

/// Metadata held in memory behind a single lock.
///
/// Every operation takes the lock once, so a link and its count change are
/// never observed apart. State can be written to and restored from a JSON
/// snapshot in a storage bucket.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    state: RwLock<State>,
}

impl MemoryMetadata {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the current state to `path` in `bucket`.
    #[tracing::instrument(skip(self, bucket), fields(bucket = bucket.name()))]
    pub async fn save_snapshot(&self, bucket: &StorageBucket, path: &Utf8Path) -> RegistryResult<()> {
        let encoded = {
            let state = self.state.read();
            serde_json::to_vec(&*state)?
        };
        bucket.upload(path, &mut encoded.as_slice()).await?;
        tracing::debug!(bytes = encoded.len(), "saved metadata snapshot");
        Ok(())
    }

    /// Replace the current state with the snapshot at `path`.
    ///
    /// Returns `false`, leaving the store untouched, when there is no snapshot.
    #[tracing::instrument(skip(self, bucket), fields(bucket = bucket.name()))]
    pub async fn load_snapshot(&self, bucket: &StorageBucket, path: &Utf8Path) -> RegistryResult<bool> {
        let encoded = match bucket.read_to_vec(path).await {
            Ok(encoded) => encoded,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let restored: State = serde_json::from_slice(&encoded)?;
        tracing::info!(
            blobs = restored.blobs.len(),
            manifests = restored.manifests.len(),
            repositories = restored.repositories.len(),
            "restored metadata snapshot"
        );
        *self.state.write() = restored;
        Ok(true)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn blob(&self, digest: &Digest) -> RegistryResult<Option<Blob>> {
        Ok(self.state.read().blobs.get(digest).cloned())
    }

    async fn insert_blob(&self, blob: Blob) -> RegistryResult<Insert<Blob>> {
        let mut state = self.state.write();
        if let Some(existing) = state.blobs.get(&blob.digest) {
            return Ok(Insert::Existing(existing.clone()));
        }
        state.blobs.insert(blob.digest.clone(), blob.clone());
        Ok(Insert::Created(blob))
    }

    async fn remove_unreferenced_blob(&self, digest: &Digest) -> RegistryResult<Blob> {
        let mut state = self.state.write();
        let blob = state
            .blobs
            .get(digest)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))?;

        let links = state.link_count(digest);
        if blob.reference_count != 0 || links != 0 {
            return Err(RegistryError::BlobReferenced {
                digest: digest.clone(),
                references: blob.reference_count.max(links),
            });
        }

        state.blob_links.remove(digest);
        state
            .blobs
            .remove(digest)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))
    }

    async fn blobs(&self) -> RegistryResult<Vec<Blob>> {
        Ok(self.state.read().blobs.values().cloned().collect())
    }

    async fn link_blob(&self, digest: &Digest, repository: &str) -> RegistryResult<bool> {
        let mut state = self.state.write();
        if !state.blobs.contains_key(digest) {
            return Err(RegistryError::BlobNotFound(digest.clone()));
        }

        let linked = state
            .blob_links
            .entry(digest.clone())
            .or_default()
            .insert(repository.to_string());
        if linked {
            if let Some(blob) = state.blobs.get_mut(digest) {
                blob.reference_count += 1;
            }
        }
        Ok(linked)
    }

    async fn unlink_blob(&self, digest: &Digest, repository: &str) -> RegistryResult<bool> {
        let mut state = self.state.write();
        let unlinked = match state.blob_links.get_mut(digest) {
            Some(links) => {
                let removed = links.remove(repository);
                if links.is_empty() {
                    state.blob_links.remove(digest);
                }
                removed
            }
            None => false,
        };

        if unlinked {
            if let Some(blob) = state.blobs.get_mut(digest) {
                blob.reference_count = blob.reference_count.saturating_sub(1);
            }
        }
        Ok(unlinked)
    }

    async fn blob_repositories(&self, digest: &Digest) -> RegistryResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .blob_links
            .get(digest)
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn repository_blobs(&self, repository: &str) -> RegistryResult<Vec<Digest>> {
        Ok(self
            .state
            .read()
            .blob_links
            .iter()
            .filter(|(_, links)| links.contains(repository))
            .map(|(digest, _)| digest.clone())
            .collect())
    }

    async fn set_reference_count(&self, digest: &Digest, count: u64) -> RegistryResult<bool> {
        let mut state = self.state.write();
        let blob = state
            .blobs
            .get_mut(digest)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))?;
        let changed = blob.reference_count != count;
        blob.reference_count = count;
        Ok(changed)
    }

    async fn reconcile_reference_count(&self, digest: &Digest) -> RegistryResult<Option<u64>> {
        let mut state = self.state.write();
        let actual = state.link_count(digest);
        let blob = state
            .blobs
            .get_mut(digest)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))?;

        if blob.reference_count == actual {
            return Ok(None);
        }
        let previous = blob.reference_count;
        blob.reference_count = actual;
        Ok(Some(previous))
    }

    async fn manifest(&self, digest: &Digest) -> RegistryResult<Option<Manifest>> {
        Ok(self.state.read().manifests.get(digest).cloned())
    }

    async fn insert_manifest(&self, manifest: Manifest) -> RegistryResult<Insert<Manifest>> {
        let mut state = self.state.write();
        if let Some(existing) = state.manifests.get(&manifest.digest) {
            return Ok(Insert::Existing(existing.clone()));
        }
        state.manifests.insert(manifest.digest.clone(), manifest.clone());
        Ok(Insert::Created(manifest))
    }

    async fn link_manifest(&self, digest: &Digest, repository: &str) -> RegistryResult<bool> {
        let mut state = self.state.write();
        if !state.manifests.contains_key(digest) {
            return Err(RegistryError::manifest_not_found(repository, &digest.to_string()));
        }
        Ok(state
            .manifest_links
            .entry(digest.clone())
            .or_default()
            .insert(repository.to_string()))
    }

    async fn unlink_manifest(&self, digest: &Digest, repository: &str) -> RegistryResult<bool> {
        let mut state = self.state.write();
        let Some(links) = state.manifest_links.get_mut(digest) else {
            return Ok(false);
        };

        let removed = links.remove(repository);
        if links.is_empty() {
            state.manifest_links.remove(digest);
            state.manifests.remove(digest);
        }
        Ok(removed)
    }

    async fn manifest_linked(&self, digest: &Digest, repository: &str) -> RegistryResult<bool> {
        Ok(self
            .state
            .read()
            .manifest_links
            .get(digest)
            .is_some_and(|links| links.contains(repository)))
    }

    async fn repository_manifests(&self, repository: &str) -> RegistryResult<Vec<Digest>> {
        Ok(self
            .state
            .read()
            .manifest_links
            .iter()
            .filter(|(_, links)| links.contains(repository))
            .map(|(digest, _)| digest.clone())
            .collect())
    }

    async fn put_tag(
        &self,
        repository: &str,
        name: &str,
        digest: &Digest,
        now: DateTime<Utc>,
    ) -> RegistryResult<Tag> {
        let mut state = self.state.write();
        let tags = state.tags.entry(repository.to_string()).or_default();
        let tag = tags
            .entry(name.to_string())
            .and_modify(|tag| {
                if tag.manifest_digest != *digest {
                    tag.manifest_digest = digest.clone();
                    tag.updated_at = now;
                }
            })
            .or_insert_with(|| Tag {
                repository: repository.to_string(),
                name: name.to_string(),
                manifest_digest: digest.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(tag.clone())
    }

    async fn tag(&self, repository: &str, name: &str) -> RegistryResult<Option<Tag>> {
        Ok(self
            .state
            .read()
            .tags
            .get(repository)
            .and_then(|tags| tags.get(name))
            .cloned())
    }

    async fn remove_tag(&self, repository: &str, name: &str) -> RegistryResult<Option<Tag>> {
        let mut state = self.state.write();
        let Some(tags) = state.tags.get_mut(repository) else {
            return Ok(None);
        };
        let removed = tags.remove(name);
        if tags.is_empty() {
            state.tags.remove(repository);
        }
        Ok(removed)
    }

    async fn tags(&self, repository: &str) -> RegistryResult<Vec<Tag>> {
        Ok(self
            .state
            .read()
            .tags
            .get(repository)
            .map(|tags| tags.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_upload(&self, upload: Upload) -> RegistryResult<()> {
        self.state.write().uploads.insert(upload.id, upload);
        Ok(())
    }

    async fn upload(&self, id: &Uuid) -> RegistryResult<Option<Upload>> {
        Ok(self.state.read().uploads.get(id).cloned())
    }

    async fn save_upload(&self, mut upload: Upload) -> RegistryResult<Upload> {
        let mut state = self.state.write();
        let stored = state
            .uploads
            .get_mut(&upload.id)
            .ok_or(RegistryError::UploadNotFound(upload.id))?;
        upload.uploaded_bytes = upload.uploaded_bytes.max(stored.uploaded_bytes);
        *stored = upload.clone();
        Ok(upload)
    }

    async fn remove_upload(&self, id: &Uuid) -> RegistryResult<Option<Upload>> {
        Ok(self.state.write().uploads.remove(id))
    }

    async fn uploads(&self) -> RegistryResult<Vec<Upload>> {
        let mut uploads: Vec<Upload> = self.state.read().uploads.values().cloned().collect();
        uploads.sort_by_key(|upload| upload.created_at);
        Ok(uploads)
    }

    async fn repository(&self, name: &str) -> RegistryResult<Option<Repository>> {
        Ok(self.state.read().repositories.get(name).cloned())
    }

    async fn ensure_repository(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<Insert<Repository>> {
        let mut state = self.state.write();
        if let Some(existing) = state.repositories.get(name) {
            return Ok(Insert::Existing(existing.clone()));
        }
        let repository = Repository::new(name, now);
        state
            .repositories
            .insert(name.to_string(), repository.clone());
        Ok(Insert::Created(repository))
    }

    async fn update_repository(
        &self,
        name: &str,
        update: RepositoryUpdate,
    ) -> RegistryResult<Repository> {
        let mut state = self.state.write();
        let repository = state
            .repositories
            .get_mut(name)
            .ok_or_else(|| RegistryError::RepositoryNotFound(name.to_string()))?;

        match update {
            RepositoryUpdate::RecordPush(now) => {
                repository.stats.push_count += 1;
                repository.last_push_at = Some(now);
            }
            RepositoryUpdate::RecordPull(now) => {
                repository.stats.pull_count += 1;
                repository.last_pull_at = Some(now);
            }
            RepositoryUpdate::Statistics(stats) => {
                repository.stats.tag_count = stats.tag_count;
                repository.stats.manifest_count = stats.manifest_count;
                repository.stats.total_size = stats.total_size;
            }
            RepositoryUpdate::Enabled(enabled) => repository.enabled = enabled,
            RepositoryUpdate::Visibility(visibility) => repository.visibility = visibility,
        }
        Ok(repository.clone())
    }

    async fn remove_repository(&self, name: &str) -> RegistryResult<Option<Repository>> {
        Ok(self.state.write().repositories.remove(name))
    }

    async fn repositories(&self) -> RegistryResult<Vec<Repository>> {
        Ok(self.state.read().repositories.values().cloned().collect())
    }
}
