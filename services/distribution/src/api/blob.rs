//! Blob endpoints

use std::ops::Range;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use super::{Action, DOCKER_CONTENT_DIGEST};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;
use crate::repository::validate_name;

/// Parse a `Range: bytes=start-end` header against a blob of `size` bytes.
///
/// Open-ended ranges run to the end of the blob.
pub(crate) fn parse_range(value: &str, size: u64) -> RegistryResult<Range<u64>> {
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RegistryError::RangeNotSatisfiable)?;
    let (start, end) = spec
        .split_once('-')
        .ok_or(RegistryError::RangeNotSatisfiable)?;

    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| RegistryError::RangeNotSatisfiable)?;
    let end = match end.trim() {
        "" => size,
        end => end
            .parse::<u64>()
            .map_err(|_| RegistryError::RangeNotSatisfiable)?
            .saturating_add(1)
            .min(size),
    };

    Ok(start..end)
}

/// Get a blob, honouring a single byte range
pub(super) async fn get_blob(
    registry: &Registry,
    name: &str,
    digest: &str,
    headers: &HeaderMap,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Pull).await?;
    let digest: Digest = digest.parse()?;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => {
            let blob = registry.blobs().require_blob(&digest).await?;
            Some(parse_range(value, blob.size)?)
        }
        None => None,
    };

    let (blob, reader) = registry.blobs().stream_blob(&digest, range.clone()).await?;
    let stream = ReaderStream::with_capacity(reader, registry.config().stream_chunk_size);
    let body = Body::from_stream(stream);

    let response = match range {
        Some(range) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, (range.end - range.start).to_string()),
                (
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end - 1, blob.size),
                ),
                (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
            ],
            body,
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, blob.size.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
            ],
            body,
        )
            .into_response(),
    };
    Ok(response)
}

/// Check if a blob exists
pub(super) async fn head_blob(registry: &Registry, name: &str, digest: &str) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Pull).await?;
    let digest: Digest = digest.parse()?;

    let blob = registry.blobs().require_blob(&digest).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, blob.size.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
        ],
    )
        .into_response())
}

/// Remove a blob from a repository.
///
/// The content stays until garbage collection finds it unreferenced.
pub(super) async fn delete_blob(registry: &Registry, name: &str, digest: &str) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Delete).await?;
    let digest: Digest = digest.parse()?;

    if !registry
        .blobs()
        .unlink_blob_from_repository(&digest, name)
        .await?
    {
        return Err(RegistryError::BlobNotFound(digest));
    }
    registry.repositories().refresh_statistics(name).await?;

    Ok((StatusCode::ACCEPTED, [(DOCKER_CONTENT_DIGEST, digest.to_string())]).into_response())
}
