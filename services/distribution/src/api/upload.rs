//! Blob upload endpoints

use std::collections::HashMap;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use super::{Action, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::model::Upload;
use crate::registry::Registry;
use crate::repository::validate_name;

/// Parse a `Content-Range` chunk header, `start-end` with an optional `bytes ` prefix.
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let value = value.trim();
    let value = value
        .strip_prefix("bytes ")
        .or_else(|| value.strip_prefix("bytes="))
        .unwrap_or(value);
    let value = value.split_once('/').map_or(value, |(range, _)| range);
    let (start, end) = value.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Look up an upload and check that it belongs to `name`.
async fn session(registry: &Registry, name: &str, id: &str) -> RegistryResult<Upload> {
    let id = Uuid::parse_str(id).map_err(|_| RegistryError::UploadNotFound(Uuid::nil()))?;
    let upload = registry.blobs().upload(&id).await?;
    if upload.repository != name {
        return Err(RegistryError::UploadNotFound(id));
    }
    Ok(upload)
}

fn accepted(name: &str, upload: &Upload, status: StatusCode) -> Response {
    (
        status,
        [
            (
                header::LOCATION,
                format!("/v2/{name}/blobs/uploads/{}", upload.id),
            ),
            (header::RANGE, upload.range()),
            (DOCKER_UPLOAD_UUID, upload.id.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn created(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

/// Start an upload: cross-repository mount, monolithic upload, or a new session.
pub(super) async fn start_upload(
    registry: &Registry,
    name: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Push).await?;
    registry.repositories().require_enabled(name).await?;
    registry.repositories().ensure(name).await?;

    if let (Some(mount), Some(from)) = (params.get("mount"), params.get("from")) {
        let digest: Digest = mount.parse()?;
        validate_name(from)?;
        registry.authorize(from, Action::Pull).await?;
        if registry.blobs().mount_blob(&digest, from, name).await? {
            tracing::debug!(%digest, %from, "mounted blob");
            registry.repositories().refresh_statistics(name).await?;
            return Ok(created(name, &digest));
        }
    }

    if let Some(digest) = params.get("digest") {
        let digest: Digest = digest.parse()?;
        let blob = registry.blobs().store_blob(&digest, &body, None).await?;
        registry
            .blobs()
            .link_blob_to_repository(&blob.digest, name)
            .await?;
        registry.repositories().refresh_statistics(name).await?;
        return Ok(created(name, &blob.digest));
    }

    let upload = registry.blobs().init_chunked_upload(name).await?;
    Ok(accepted(name, &upload, StatusCode::ACCEPTED))
}

/// Report how much of an upload has been received
pub(super) async fn upload_status(registry: &Registry, name: &str, id: &str) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Push).await?;
    let upload = session(registry, name, id).await?;
    Ok(accepted(name, &upload, StatusCode::NO_CONTENT))
}

/// Upload a chunk
pub(super) async fn patch_upload(
    registry: &Registry,
    name: &str,
    id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Push).await?;
    let upload = session(registry, name, id).await?;

    let content_range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok());
    let upload = match content_range {
        Some(value) => {
            let (start, end) = parse_content_range(value).ok_or(RegistryError::InvalidRange {
                start: 0,
                end: 0,
                length: body.len() as u64,
            })?;
            registry
                .blobs()
                .append_chunk(&upload.id, &body, start, end)
                .await?
        }
        None => {
            registry
                .blobs()
                .append_chunk_from_stream(&upload.id, &mut &body[..])
                .await?;
            registry.blobs().upload(&upload.id).await?
        }
    };

    Ok(accepted(name, &upload, StatusCode::ACCEPTED))
}

/// Complete an upload, with an optional final chunk
pub(super) async fn complete_upload(
    registry: &Registry,
    name: &str,
    id: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Push).await?;
    let upload = session(registry, name, id).await?;

    let digest: Digest = params
        .get("digest")
        .ok_or(RegistryError::DigestRequired(upload.id))?
        .parse()?;

    if !body.is_empty() {
        registry
            .blobs()
            .append_chunk_from_stream(&upload.id, &mut &body[..])
            .await?;
    }

    let blob = registry
        .blobs()
        .complete_chunked_upload(&upload.id, Some(&digest))
        .await?;
    registry.repositories().refresh_statistics(name).await?;
    Ok(created(name, &blob.digest))
}

/// Cancel an upload
pub(super) async fn cancel_upload(registry: &Registry, name: &str, id: &str) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Push).await?;
    let upload = session(registry, name, id).await?;
    registry.blobs().cancel_upload(&upload.id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
