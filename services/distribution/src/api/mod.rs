//! OCI Distribution v2 HTTP adapter
//!
//! Every repository-scoped route lives under `/v2/<name>/...`, where `<name>`
//! may itself contain slashes, so those requests go through a single wildcard
//! route and are dispatched on the path suffix.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::error::{RegistryError, RegistryResult};
use crate::pagination::Page;
use crate::registry::Registry;

mod blob;
mod manifest;
mod upload;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// What a request wants to do to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read blobs, manifests or tags.
    Pull,
    /// Upload blobs or push manifests.
    Push,
    /// Delete blobs, manifests or tags.
    Delete,
    /// List repositories. The repository name is empty.
    Catalog,
}

/// Authorization check consulted before any registry operation.
///
/// Credential handling happens outside the registry; implementations only
/// decide whether the already-identified caller may proceed.
#[async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Whether `action` on `repository` is permitted.
    async fn authorize(&self, repository: &str, action: Action) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _repository: &str, _action: Action) -> bool {
        true
    }
}

impl Registry {
    /// Fail with `Denied` unless `action` on `repository` is permitted.
    pub(crate) async fn authorize(&self, repository: &str, action: Action) -> RegistryResult<()> {
        if self.authorizer().authorize(repository, action).await {
            Ok(())
        } else {
            tracing::debug!(%repository, ?action, "request denied");
            Err(RegistryError::Denied(repository.to_string()))
        }
    }

    /// The HTTP router serving this registry.
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2", get(api_version_check))
            .route("/v2/", get(api_version_check))
            .route("/v2/_catalog", get(catalog))
            .route("/v2/{*path}", any(dispatch))
            .layer(SetResponseHeaderLayer::overriding(
                API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ))
            .with_state(self.clone())
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

/// Repository catalog
async fn catalog(
    State(registry): State<Registry>,
    Query(params): Query<HashMap<String, String>>,
) -> RegistryResult<Response> {
    registry.authorize("", Action::Catalog).await?;
    let n = page_size(&params);
    let page = registry
        .repositories()
        .catalog(n, params.get("last").map(String::as_str))
        .await?;

    let link = next_link("/v2/_catalog", n, &page);
    let mut response = Json(json!({ "repositories": page.items })).into_response();
    if let Some(link) = link {
        response.headers_mut().insert(header::LINK, link);
    }
    Ok(response)
}

/// A repository-scoped request, split into repository name and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route<'p> {
    Blob { name: &'p str, digest: &'p str },
    UploadStart { name: &'p str },
    Upload { name: &'p str, id: &'p str },
    Manifest { name: &'p str, reference: &'p str },
    TagList { name: &'p str },
}

impl<'p> Route<'p> {
    /// Split the path after `/v2/`.
    ///
    /// Only the trailing segments select the route, so repository names may
    /// themselves contain `blobs` or `manifests` components.
    pub(crate) fn parse(path: &'p str) -> Option<Self> {
        let (head, last) = path.rsplit_once('/')?;
        if last.is_empty() {
            let name = head.strip_suffix("/blobs/uploads")?;
            return Some(Route::UploadStart { name });
        }
        if last == "list" {
            if let Some(name) = head.strip_suffix("/tags") {
                return Some(Route::TagList { name });
            }
        }
        if last == "uploads" {
            if let Some(name) = head.strip_suffix("/blobs") {
                return Some(Route::UploadStart { name });
            }
        }
        if let Some(name) = head.strip_suffix("/blobs/uploads") {
            return Some(Route::Upload { name, id: last });
        }
        if let Some(name) = head.strip_suffix("/blobs") {
            return Some(Route::Blob { name, digest: last });
        }
        if let Some(name) = head.strip_suffix("/manifests") {
            return Some(Route::Manifest { name, reference: last });
        }
        None
    }
}

async fn dispatch(
    State(registry): State<Registry>,
    method: Method,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let Some(route) = Route::parse(&path) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    tracing::trace!(%method, ?route, "registry request");

    match (route, method) {
        (Route::Blob { name, digest }, Method::GET) => {
            blob::get_blob(&registry, name, digest, &headers).await
        }
        (Route::Blob { name, digest }, Method::HEAD) => blob::head_blob(&registry, name, digest).await,
        (Route::Blob { name, digest }, Method::DELETE) => {
            blob::delete_blob(&registry, name, digest).await
        }
        (Route::UploadStart { name }, Method::POST) => {
            upload::start_upload(&registry, name, &params, body).await
        }
        (Route::Upload { name, id }, Method::GET) => upload::upload_status(&registry, name, id).await,
        (Route::Upload { name, id }, Method::PATCH) => {
            upload::patch_upload(&registry, name, id, &headers, body).await
        }
        (Route::Upload { name, id }, Method::PUT) => {
            upload::complete_upload(&registry, name, id, &params, body).await
        }
        (Route::Upload { name, id }, Method::DELETE) => {
            upload::cancel_upload(&registry, name, id).await
        }
        (Route::Manifest { name, reference }, Method::GET) => {
            manifest::get_manifest(&registry, name, reference).await
        }
        (Route::Manifest { name, reference }, Method::HEAD) => {
            manifest::head_manifest(&registry, name, reference).await
        }
        (Route::Manifest { name, reference }, Method::PUT) => {
            manifest::put_manifest(&registry, name, reference, &headers, body).await
        }
        (Route::Manifest { name, reference }, Method::DELETE) => {
            manifest::delete_manifest(&registry, name, reference).await
        }
        (Route::TagList { name }, Method::GET) => manifest::list_tags(&registry, name, &params).await,
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

pub(crate) fn page_size(params: &HashMap<String, String>) -> Option<usize> {
    params.get("n").and_then(|n| n.parse().ok())
}

/// The `Link` header pointing at the page after `page`, if there is one.
pub(crate) fn next_link(path: &str, n: Option<usize>, page: &Page) -> Option<HeaderValue> {
    let (Some(n), Some(next)) = (n, page.next.as_deref()) else {
        return None;
    };
    HeaderValue::from_str(&format!("<{path}?n={n}&last={next}>; rel=\"next\"")).ok()
}
