//! Registry assembly
//!
//! [`RegistryBuilder`] wires the services over one storage bucket and one
//! metadata store; [`Registry`] hands them out and serves them over HTTP.

use std::sync::Arc;

use storage::{Storage, StorageBucket};

use crate::api::{AllowAll, Authorizer};
use crate::blob::BlobStore;
use crate::config::RegistryConfig;
use crate::gc::GarbageCollector;
use crate::manifest::ManifestService;
use crate::metadata::{MemoryMetadata, MetadataStore};
use crate::repository::RepositoryService;

/// Registry builder for configuring and creating the registry services
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Storage,
    config: RegistryConfig,
    metadata: Option<Arc<dyn MetadataStore>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl RegistryBuilder {
    /// Create a new registry builder over a storage backend
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            config: RegistryConfig::default(),
            metadata: None,
            authorizer: None,
        }
    }

    /// Set the registry configuration
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    /// Set the metadata store. Defaults to an empty [`MemoryMetadata`].
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the authorization check. Defaults to allowing everything.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Build the registry services
    pub fn build(self) -> Registry {
        let config = Arc::new(self.config);
        let bucket = self.storage.bucket(config.bucket.clone());
        let metadata: Arc<dyn MetadataStore> = match self.metadata {
            Some(metadata) => metadata,
            None => Arc::new(MemoryMetadata::new()),
        };
        let authorizer: Arc<dyn Authorizer> = match self.authorizer {
            Some(authorizer) => authorizer,
            None => Arc::new(AllowAll),
        };

        let blobs = BlobStore::new(bucket.clone(), metadata, config.clone());
        let repositories = RepositoryService::new(blobs.clone());
        let manifests = ManifestService::new(blobs.clone(), repositories.clone());
        let gc = GarbageCollector::new(blobs.clone());

        Registry {
            config,
            bucket,
            blobs,
            repositories,
            manifests,
            gc,
            authorizer,
        }
    }
}

/// The assembled registry services. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Registry {
    config: Arc<RegistryConfig>,
    bucket: StorageBucket,
    blobs: BlobStore,
    repositories: RepositoryService,
    manifests: ManifestService,
    gc: GarbageCollector,
    authorizer: Arc<dyn Authorizer>,
}

impl Registry {
    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The storage bucket holding blobs and uploads.
    pub fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    /// Blob storage and uploads.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Repository records.
    pub fn repositories(&self) -> &RepositoryService {
        &self.repositories
    }

    /// Manifests and tags.
    pub fn manifests(&self) -> &ManifestService {
        &self.manifests
    }

    /// Garbage collection.
    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    /// The authorization check consulted by the HTTP adapter.
    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }
}
