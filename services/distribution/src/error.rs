//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::digest::Digest;
use crate::model::UploadStatus;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Broad failure classes, used to decide how an error surfaces to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Content did not match its declared digest or size.
    Integrity,
    /// The blob, manifest, tag, upload or repository does not exist.
    NotFound,
    /// The operation is not allowed in the current state.
    Precondition,
    /// The storage backend failed.
    Storage,
    /// The request itself was malformed.
    Malformed,
    /// The authorization check rejected the request.
    Denied,
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Content does not hash to the digest it was declared with
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// The blob record exists but its content is missing from storage
    #[error("blob {digest} has a record but no stored content")]
    BlobContentMissing {
        /// Digest of the blob
        digest: Digest,
        /// The storage error reporting the missing object
        #[source]
        source: storage::StorageError,
    },

    /// Manifest not found
    #[error("manifest not found: {repository}@{reference}")]
    ManifestNotFound {
        /// Repository name
        repository: String,
        /// Tag or digest
        reference: String,
    },

    /// Upload session not found
    #[error("upload not found: {0}")]
    UploadNotFound(Uuid),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The blob is still linked and cannot be deleted
    #[error("blob {digest} is still referenced ({references} references)")]
    BlobReferenced {
        /// Digest of the blob
        digest: Digest,
        /// Reference count at the time of the check
        references: u64,
    },

    /// The upload session is finished or expired
    #[error("upload {id} is not active ({status})")]
    UploadInactive {
        /// Upload id
        id: Uuid,
        /// Status at the time of the check
        status: UploadStatus,
    },

    /// The upload cannot be completed without a digest
    #[error("upload {0} requires a digest to complete")]
    DigestRequired(Uuid),

    /// The repository does not accept writes
    #[error("repository {0} is disabled")]
    RepositoryDisabled(String),

    /// Declared chunk range does not match the payload
    #[error("range {start}-{end} does not match a payload of {length} bytes")]
    InvalidRange {
        /// First byte offset
        start: u64,
        /// Last byte offset (inclusive)
        end: u64,
        /// Payload length
        length: u64,
    },

    /// Requested read range is outside the blob
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Access was refused by the authorization check
    #[error("access denied to repository {0}")]
    Denied(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata snapshot could not be encoded or decoded
    #[error("metadata snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn manifest_not_found(repository: &str, reference: &str) -> Self {
        RegistryError::ManifestNotFound {
            repository: repository.to_string(),
            reference: reference.to_string(),
        }
    }

    /// The failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistryError::DigestMismatch { .. } => ErrorClass::Integrity,
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound { .. }
            | RegistryError::UploadNotFound(_)
            | RegistryError::RepositoryNotFound(_) => ErrorClass::NotFound,
            RegistryError::BlobReferenced { .. }
            | RegistryError::UploadInactive { .. }
            | RegistryError::DigestRequired(_)
            | RegistryError::RepositoryDisabled(_) => ErrorClass::Precondition,
            RegistryError::BlobContentMissing { .. }
            | RegistryError::Storage(_)
            | RegistryError::Io(_)
            | RegistryError::Snapshot(_) => ErrorClass::Storage,
            RegistryError::InvalidRange { .. }
            | RegistryError::RangeNotSatisfiable
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidDigest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_) => ErrorClass::Malformed,
            RegistryError::Denied(_) => ErrorClass::Denied,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::RangeNotSatisfiable | RegistryError::InvalidRange { .. } => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            RegistryError::BlobReferenced { .. } | RegistryError::RepositoryDisabled(_) => {
                StatusCode::CONFLICT
            }
            _ => match self.class() {
                ErrorClass::NotFound => StatusCode::NOT_FOUND,
                ErrorClass::Integrity | ErrorClass::Precondition | ErrorClass::Malformed => {
                    StatusCode::BAD_REQUEST
                }
                ErrorClass::Denied => StatusCode::FORBIDDEN,
                ErrorClass::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) | RegistryError::BlobContentMissing { .. } => {
                "BLOB_UNKNOWN"
            }
            RegistryError::ManifestNotFound { .. } => "MANIFEST_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidDigest(_)
            | RegistryError::DigestRequired(_) => "DIGEST_INVALID",
            RegistryError::UploadInactive { .. } => "BLOB_UPLOAD_INVALID",
            RegistryError::InvalidRange { .. } | RegistryError::RangeNotSatisfiable => {
                "RANGE_INVALID"
            }
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::BlobReferenced { .. } | RegistryError::RepositoryDisabled(_) => {
                "DENIED"
            }
            RegistryError::Denied(_) => "DENIED",
            RegistryError::Storage(_) | RegistryError::Io(_) | RegistryError::Snapshot(_) => {
                "UNKNOWN"
            }
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "registry request failed");
        } else {
            tracing::debug!(error = %self, "registry request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
