//! Manifest and tag endpoints

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::{Action, DOCKER_CONTENT_DIGEST, next_link, page_size};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::Reference;
use crate::model::Manifest;
use crate::registry::Registry;
use crate::repository::validate_name;

fn manifest_headers(manifest: &Manifest) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, manifest.media_type.clone()),
        (header::CONTENT_LENGTH, manifest.size.to_string()),
        (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
    ]
}

/// Get a manifest
pub(super) async fn get_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Pull).await?;

    let manifest = registry.manifests().require_manifest(name, reference).await?;
    registry.repositories().record_pull(name).await?;

    Ok((
        StatusCode::OK,
        manifest_headers(&manifest),
        manifest.body.clone(),
    )
        .into_response())
}

/// Check if a manifest exists
pub(super) async fn head_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Pull).await?;

    let manifest = registry.manifests().require_manifest(name, reference).await?;
    Ok((StatusCode::OK, manifest_headers(&manifest)).into_response())
}

/// Put a manifest
pub(super) async fn put_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Push).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let manifest = registry
        .manifests()
        .store_manifest(name, reference, &body, content_type)
        .await?;

    let location = format!("/v2/{}/manifests/{}", name, manifest.digest);
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

/// Delete a manifest by digest, or a tag by name
pub(super) async fn delete_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Delete).await?;

    let deleted = match Reference::parse(reference)? {
        Reference::Digest(_) => registry.manifests().delete_manifest(name, reference).await?,
        Reference::Tag(tag) => registry.manifests().delete_tag(name, &tag).await?,
    };
    if !deleted {
        return Err(RegistryError::manifest_not_found(name, reference));
    }
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList<'n> {
    name: &'n str,
    tags: Vec<String>,
}

/// List tags for a repository
pub(super) async fn list_tags(
    registry: &Registry,
    name: &str,
    params: &HashMap<String, String>,
) -> RegistryResult<Response> {
    validate_name(name)?;
    registry.authorize(name, Action::Pull).await?;

    let n = page_size(params);
    let page = registry
        .manifests()
        .list_tags(name, n, params.get("last").map(String::as_str))
        .await?;

    let link = next_link(&format!("/v2/{name}/tags/list"), n, &page);
    let mut response = Json(TagList {
        name,
        tags: page.items,
    })
    .into_response();
    if let Some(link) = link {
        response.headers_mut().insert(header::LINK, link);
    }
    Ok(response)
}
