//! Repository records, statistics and the catalog

use std::sync::Arc;

use chrono::Utc;

use crate::blob::BlobStore;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{MetadataStore, RepositoryUpdate};
use crate::model::{Repository, RepositoryStats, Visibility};
use crate::pagination::{Page, paginate};

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// Check a repository name against `^[a-z0-9]+([._/-][a-z0-9]+)*$`.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    let invalid = || RegistryError::InvalidRepository(name.to_string());
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid());
    }

    // Separators may not lead, trail, or repeat.
    let mut after_separator = true;
    for c in name.chars() {
        match c {
            'a'..='z' | '0'..='9' => after_separator = false,
            '.' | '_' | '-' | '/' if !after_separator => after_separator = true,
            _ => return Err(invalid()),
        }
    }

    if after_separator {
        return Err(invalid());
    }
    Ok(())
}

/// Check a tag name against `^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$`.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    let invalid = || RegistryError::InvalidTag(tag.to_string());
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return Err(invalid()),
    }

    if tag.len() > MAX_TAG_LEN
        || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid());
    }
    Ok(())
}

/// Repository lifecycle and aggregate counters.
#[derive(Debug, Clone)]
pub struct RepositoryService {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
}

impl RepositoryService {
    /// Create a repository service sharing `blobs`' metadata store.
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            metadata: blobs.metadata.clone(),
            blobs,
        }
    }

    /// Fetch a repository, creating it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn ensure(&self, name: &str) -> RegistryResult<Repository> {
        validate_name(name)?;
        let inserted = self.metadata.ensure_repository(name, Utc::now()).await?;
        if inserted.is_created() {
            tracing::info!("created repository");
        }
        Ok(inserted.into_inner())
    }

    /// Look up a repository.
    pub async fn get(&self, name: &str) -> RegistryResult<Repository> {
        self.metadata
            .repository(name)
            .await?
            .ok_or_else(|| RegistryError::RepositoryNotFound(name.to_string()))
    }

    /// Fail if the repository exists and is disabled.
    ///
    /// Unknown repositories pass; they are created on first push.
    pub async fn require_enabled(&self, name: &str) -> RegistryResult<()> {
        validate_name(name)?;
        match self.metadata.repository(name).await? {
            Some(repository) if !repository.enabled => {
                Err(RegistryError::RepositoryDisabled(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Enable or disable writes to a repository.
    #[tracing::instrument(skip(self))]
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> RegistryResult<Repository> {
        self.metadata
            .update_repository(name, RepositoryUpdate::Enabled(enabled))
            .await
    }

    /// Change a repository's pull visibility.
    #[tracing::instrument(skip(self))]
    pub async fn set_visibility(
        &self,
        name: &str,
        visibility: Visibility,
    ) -> RegistryResult<Repository> {
        self.metadata
            .update_repository(name, RepositoryUpdate::Visibility(visibility))
            .await
    }

    /// Count a manifest pull. Unknown repositories are ignored.
    pub async fn record_pull(&self, name: &str) -> RegistryResult<()> {
        match self
            .metadata
            .update_repository(name, RepositoryUpdate::RecordPull(Utc::now()))
            .await
        {
            Ok(_) | Err(RegistryError::RepositoryNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Count a manifest push.
    pub async fn record_push(&self, name: &str) -> RegistryResult<Repository> {
        self.metadata
            .update_repository(name, RepositoryUpdate::RecordPush(Utc::now()))
            .await
    }

    /// Recompute tag, manifest and size counters from the current records.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_statistics(&self, name: &str) -> RegistryResult<RepositoryStats> {
        let tag_count = self.metadata.tags(name).await?.len() as u64;
        let manifest_count = self.metadata.repository_manifests(name).await?.len() as u64;

        let mut total_size = 0;
        for digest in self.metadata.repository_blobs(name).await? {
            if let Some(blob) = self.metadata.blob(&digest).await? {
                total_size += blob.size;
            }
        }

        let stats = RepositoryStats {
            tag_count,
            manifest_count,
            total_size,
            ..RepositoryStats::default()
        };
        let repository = self
            .metadata
            .update_repository(name, RepositoryUpdate::Statistics(stats))
            .await?;
        tracing::trace!(?repository.stats, "refreshed statistics");
        Ok(repository.stats)
    }

    /// A page of repository names.
    pub async fn catalog(&self, n: Option<usize>, last: Option<&str>) -> RegistryResult<Page> {
        let names = self
            .metadata
            .repositories()
            .await?
            .into_iter()
            .map(|repository| repository.name);
        Ok(paginate(names, n, last))
    }

    /// Delete a repository with its tags, manifests, blob links and open uploads.
    ///
    /// Blob content is left for garbage collection. Returns `false` if the
    /// repository did not exist.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> RegistryResult<bool> {
        if self.metadata.repository(name).await?.is_none() {
            return Ok(false);
        }

        for tag in self.metadata.tags(name).await? {
            self.metadata.remove_tag(name, &tag.name).await?;
        }
        for digest in self.metadata.repository_manifests(name).await? {
            self.metadata.unlink_manifest(&digest, name).await?;
        }
        for digest in self.metadata.repository_blobs(name).await? {
            self.blobs.unlink_blob_from_repository(&digest, name).await?;
        }
        for upload in self.metadata.uploads().await? {
            if upload.repository == name && !upload.status.is_terminal() {
                self.blobs.cancel_upload(&upload.id).await?;
            }
        }

        self.metadata.remove_repository(name).await?;
        tracing::info!("deleted repository");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::tests::fixture;
    use crate::digest::Digest;

    #[test]
    fn repository_names() {
        for valid in ["alpine", "library/alpine", "a.b_c-d/e0", "0"] {
            assert!(validate_name(valid).is_ok(), "{valid}");
        }
        for invalid in ["", "Alpine", "/alpine", "alpine/", "a//b", "a..b", "a b", "a:b"] {
            assert!(validate_name(invalid).is_err(), "{invalid}");
        }
        assert!(validate_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn tag_names() {
        for valid in ["latest", "v1.2.3", "_private", "A-b_c.d"] {
            assert!(validate_tag(valid).is_ok(), "{valid}");
        }
        for invalid in ["", ".hidden", "-dash", "a/b", "sha256:abc"] {
            assert!(validate_tag(invalid).is_err(), "{invalid}");
        }
        assert!(validate_tag(&"a".repeat(128)).is_ok());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn disabled_repositories_refuse_writes() {
        let (blobs, _) = fixture();
        let service = RepositoryService::new(blobs);

        service.require_enabled("fresh").await.unwrap();
        service.ensure("team/app").await.unwrap();
        service.set_enabled("team/app", false).await.unwrap();
        let err = service.require_enabled("team/app").await.unwrap_err();
        assert!(matches!(err, RegistryError::RepositoryDisabled(_)));

        let repo = service.set_visibility("team/app", Visibility::Public).await.unwrap();
        assert_eq!(repo.visibility, Visibility::Public);
        assert!(matches!(
            service.get("missing").await.unwrap_err(),
            RegistryError::RepositoryNotFound(_)
        ));
    }

    #[tokio::test]
    async fn catalog_pagination() {
        let (blobs, _) = fixture();
        let service = RepositoryService::new(blobs);
        for name in ["e", "c", "a", "d", "b"] {
            service.ensure(name).await.unwrap();
        }

        let page = service.catalog(Some(2), None).await.unwrap();
        assert_eq!(page.items, vec!["a", "b"]);
        assert_eq!(page.next.as_deref(), Some("b"));

        let page = service.catalog(Some(2), page.next.as_deref()).await.unwrap();
        assert_eq!(page.items, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn statistics_and_delete_cascade() {
        let (blobs, _) = fixture();
        let service = RepositoryService::new(blobs.clone());
        service.ensure("repo").await.unwrap();

        let digest = Digest::calculate(b"twelve bytes");
        blobs.store_blob(&digest, b"twelve bytes", None).await.unwrap();
        blobs.link_blob_to_repository(&digest, "repo").await.unwrap();
        let upload = blobs.init_chunked_upload("repo").await.unwrap();

        let stats = service.refresh_statistics("repo").await.unwrap();
        assert_eq!(stats.total_size, 12);
        assert_eq!(stats.tag_count, 0);

        assert!(service.delete("repo").await.unwrap());
        assert!(!service.delete("repo").await.unwrap());
        assert_eq!(blobs.require_blob(&digest).await.unwrap().reference_count, 0);
        assert!(blobs.upload(&upload.id).await.unwrap().status.is_terminal());
    }
}
