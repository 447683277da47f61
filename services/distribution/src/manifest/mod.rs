//! Manifests and tags
//!
//! Manifests are stored once per digest and made visible per repository.
//! Their blob references are derived from the body when it is pushed, and a
//! manifest pins those blobs in its repository until it is deleted.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::blob::BlobStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::MetadataStore;
use crate::model::Manifest;
use crate::pagination::{Page, paginate};
use crate::repository::{RepositoryService, validate_name, validate_tag};

mod parse;

pub use parse::{ParsedManifest, detect_media_type, media_types};

/// A manifest reference: either a tag name or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A tag within the repository.
    Tag(String),
    /// A content digest.
    Digest(Digest),
}

impl Reference {
    /// Parse a reference. Anything containing `:` must be a valid digest;
    /// anything else must be a valid tag.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            Ok(Reference::Digest(reference.parse()?))
        } else {
            validate_tag(reference)?;
            Ok(Reference::Tag(reference.to_string()))
        }
    }
}

/// Stores, resolves and deletes manifests and tags.
#[derive(Debug, Clone)]
pub struct ManifestService {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    repositories: RepositoryService,
}

impl ManifestService {
    /// Create a manifest service over `blobs`, updating `repositories`' counters.
    pub fn new(blobs: BlobStore, repositories: RepositoryService) -> Self {
        Self {
            metadata: blobs.metadata.clone(),
            blobs,
            repositories,
        }
    }

    /// Store a manifest and, when `reference` is a tag, point the tag at it.
    ///
    /// The body must be JSON of the declared (or detected) media type. A
    /// digest reference must match the body. Referenced blobs already in the
    /// registry are linked into the repository; missing ones may be uploaded
    /// later.
    #[tracing::instrument(skip(self, content, media_type), fields(size = content.len()))]
    pub async fn store_manifest(
        &self,
        repository: &str,
        reference: &str,
        content: &[u8],
        media_type: Option<&str>,
    ) -> RegistryResult<Manifest> {
        validate_name(repository)?;
        let reference = Reference::parse(reference)?;
        self.repositories.require_enabled(repository).await?;

        let media_type = detect_media_type(media_type, content)?;
        let parsed = ParsedManifest::parse(&media_type, content)?;
        let digest = Digest::calculate(content);

        if let Reference::Digest(expected) = &reference {
            if !expected.matches(&digest) {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let body = std::str::from_utf8(content)
            .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?
            .to_string();

        self.repositories.ensure(repository).await?;

        let now = Utc::now();
        let manifest = Manifest {
            digest: digest.clone(),
            media_type,
            body,
            size: content.len() as u64,
            layer_digests: parsed.layer_digests().to_vec(),
            config_digest: parsed.config_digest().cloned(),
            platform: parsed.platform().cloned(),
            repository: repository.to_string(),
            created_at: now,
        };
        let manifest = self.metadata.insert_manifest(manifest).await?.into_inner();
        self.metadata.link_manifest(&digest, repository).await?;

        for blob in manifest.blob_references() {
            match self.metadata.link_blob(&blob, repository).await {
                Ok(_) => {}
                Err(RegistryError::BlobNotFound(_)) => {
                    tracing::debug!(%blob, "manifest references a blob not yet uploaded");
                }
                Err(err) => return Err(err),
            }
        }

        if let Reference::Tag(tag) = &reference {
            self.metadata.put_tag(repository, tag, &digest, now).await?;
        }

        self.repositories.record_push(repository).await?;
        self.repositories.refresh_statistics(repository).await?;

        tracing::info!(%digest, media_type = %manifest.media_type, "stored manifest");
        Ok(manifest)
    }

    /// Resolve a tag or digest to a manifest digest held by the repository.
    pub async fn resolve(&self, repository: &str, reference: &str) -> RegistryResult<Option<Digest>> {
        match Reference::parse(reference)? {
            Reference::Digest(digest) => {
                if self.metadata.manifest_linked(&digest, repository).await? {
                    Ok(Some(digest))
                } else {
                    Ok(None)
                }
            }
            Reference::Tag(tag) => Ok(self
                .metadata
                .tag(repository, &tag)
                .await?
                .map(|tag| tag.manifest_digest)),
        }
    }

    /// Fetch a manifest by tag or digest. `None` if the tag or manifest is absent.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> RegistryResult<Option<Manifest>> {
        validate_name(repository)?;
        match self.resolve(repository, reference).await? {
            Some(digest) => self.metadata.manifest(&digest).await,
            None => Ok(None),
        }
    }

    /// Fetch a manifest, failing with `ManifestNotFound` if it is absent.
    pub async fn require_manifest(&self, repository: &str, reference: &str) -> RegistryResult<Manifest> {
        self.get_manifest(repository, reference)
            .await?
            .ok_or_else(|| RegistryError::manifest_not_found(repository, reference))
    }

    /// Whether the repository holds a manifest for `reference`.
    pub async fn manifest_exists(&self, repository: &str, reference: &str) -> RegistryResult<bool> {
        Ok(self.get_manifest(repository, reference).await?.is_some())
    }

    /// Delete a manifest from a repository along with every tag pointing at it.
    ///
    /// Returns `false` if nothing matched.
    #[tracing::instrument(skip(self))]
    pub async fn delete_manifest(&self, repository: &str, reference: &str) -> RegistryResult<bool> {
        validate_name(repository)?;
        let Some(digest) = self.resolve(repository, reference).await? else {
            return Ok(false);
        };

        for tag in self.metadata.tags(repository).await? {
            if tag.manifest_digest == digest {
                self.metadata.remove_tag(repository, &tag.name).await?;
            }
        }

        let removed = self.remove_from_repository(repository, &digest).await?;
        self.repositories.refresh_statistics(repository).await?;
        Ok(removed)
    }

    /// Delete a tag. If its manifest is left untagged and no index in the
    /// repository lists it, the manifest is removed too. Removing an index
    /// this way releases its children under the same rule.
    ///
    /// Returns `false` if the tag did not exist.
    #[tracing::instrument(skip(self))]
    pub async fn delete_tag(&self, repository: &str, name: &str) -> RegistryResult<bool> {
        validate_name(repository)?;
        let Some(tag) = self.metadata.remove_tag(repository, name).await? else {
            return Ok(false);
        };

        let tags = self.metadata.tags(repository).await?;
        let mut pending = vec![tag.manifest_digest];
        while let Some(digest) = pending.pop() {
            if tags.iter().any(|other| other.manifest_digest == digest)
                || self.listed_by_index(repository, &digest).await?
            {
                continue;
            }
            let Some(manifest) = self.metadata.manifest(&digest).await? else {
                continue;
            };
            if self.remove_from_repository(repository, &digest).await? && manifest.is_index() {
                pending.extend(manifest.layer_digests);
            }
        }

        self.repositories.refresh_statistics(repository).await?;
        Ok(true)
    }

    async fn listed_by_index(&self, repository: &str, digest: &Digest) -> RegistryResult<bool> {
        for other in self.metadata.repository_manifests(repository).await? {
            if other == *digest {
                continue;
            }
            if let Some(manifest) = self.metadata.manifest(&other).await? {
                if manifest.is_index() && manifest.layer_digests.contains(digest) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Unlink a manifest from a repository and release the blobs it pinned.
    ///
    /// A blob stays linked while another manifest in the repository still
    /// references it.
    async fn remove_from_repository(&self, repository: &str, digest: &Digest) -> RegistryResult<bool> {
        let Some(manifest) = self.metadata.manifest(digest).await? else {
            return Ok(false);
        };
        if !self.metadata.unlink_manifest(digest, repository).await? {
            return Ok(false);
        }

        let mut retained = BTreeSet::new();
        for other in self.metadata.repository_manifests(repository).await? {
            if let Some(other) = self.metadata.manifest(&other).await? {
                retained.extend(other.blob_references());
            }
        }

        for blob in manifest.blob_references() {
            if !retained.contains(&blob) {
                self.blobs.unlink_blob_from_repository(&blob, repository).await?;
            }
        }

        tracing::info!(%digest, "removed manifest from repository");
        Ok(true)
    }

    /// A page of tag names in a repository.
    pub async fn list_tags(
        &self,
        repository: &str,
        n: Option<usize>,
        last: Option<&str>,
    ) -> RegistryResult<Page> {
        validate_name(repository)?;
        self.repositories.get(repository).await?;
        let names = self
            .metadata
            .tags(repository)
            .await?
            .into_iter()
            .map(|tag| tag.name);
        Ok(paginate(names, n, last))
    }

    /// Whether a tag exists in a repository.
    pub async fn tag_exists(&self, repository: &str, name: &str) -> RegistryResult<bool> {
        Ok(self.metadata.tag(repository, name).await?.is_some())
    }
}
