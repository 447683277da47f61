//! # Container registry storage engine
//!
//! A private container registry backend following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec):
//! content-addressable blob storage, manifests and tags, resumable chunked
//! uploads, and reference-counted garbage collection.
//!
//! ## Features
//!
//! - Deduplicated blob storage with per-repository links and reference counts
//! - Chunked uploads with out-of-order chunk delivery and cross-repository mounts
//! - Manifest parsing for OCI and Docker images and indexes
//! - Garbage collection with dry runs and reference count repair
//! - Pluggable storage backend via the `storage` crate
//! - An axum router for the HTTP API
//!
//! ## Example
//!
//! ```no_run
//! use distribution::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! // Serve the registry with axum or any tower-compatible server
//! let app = registry.router();
//!
//! // Or drive the services directly
//! let report = registry.gc().collect_garbage(true).await?;
//! println!("{} bytes reclaimable", report.reclaimable_bytes());
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod config;
pub mod digest;
mod error;
mod gc;
mod manifest;
pub mod metadata;
pub mod model;
mod pagination;
mod registry;
mod repository;
mod upload;

pub use api::{Action, AllowAll, Authorizer};
pub use blob::BlobStore;
pub use config::RegistryConfig;
pub use digest::Digest;
pub use error::{ErrorClass, RegistryError, RegistryResult};
pub use gc::{BlobCandidate, GarbageCollector, GcReport, GcStatistics, UploadCandidate};
pub use manifest::{ManifestService, ParsedManifest, Reference, media_types};
pub use pagination::Page;
pub use registry::{Registry, RegistryBuilder};
pub use repository::{RepositoryService, validate_name, validate_tag};
