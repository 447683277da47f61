//! Integration tests for the registry HTTP API

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use distribution::{Action, Authorizer, Digest, Registry, RegistryBuilder};
use storage::MemoryStorage;
use tower::ServiceExt;

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Helper to create a test registry
fn test_registry() -> Registry {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new(storage.into())
        .bucket("test-registry")
        .build()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn error_code(response: Response<Body>) -> String {
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    body["errors"][0]["code"].as_str().unwrap().to_string()
}

fn manifest_for(layer: &Digest) -> String {
    let config = Digest::calculate(b"{}");
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.to_string(),
            "size": 2
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer.to_string(),
            "size": 300
        }]
    })
    .to_string()
}

async fn put_manifest(app: &Router, repository: &str, reference: &str, body: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{repository}/manifests/{reference}"))
            .header(header::CONTENT_TYPE, OCI_MANIFEST)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn push_blob(app: &Router, repository: &str, data: &[u8]) -> Digest {
    let digest = Digest::calculate(data);
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{repository}/blobs/uploads/?digest={digest}"))
            .body(Body::from(data.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry().router();

    let response = send(&app, get("/v2/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );

    let response = send(&app, get("/v2/app/manifests/missing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_push_pull_delete_collect() {
    let registry = test_registry();
    let app = registry.router();

    let layer: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    let layer_digest = Digest::calculate(&layer);
    let manifest = manifest_for(&layer_digest);
    let manifest_digest = Digest::calculate(manifest.as_bytes());

    let response = put_manifest(&app, "library/app", "v1", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers()["docker-content-digest"],
        manifest_digest.to_string().as_str()
    );

    // Chunked upload in three pieces
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/library/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();

    for (start, end) in [(0usize, 99usize), (100, 199), (200, 299)] {
        let response = send(
            &app,
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .header(header::CONTENT_RANGE, format!("{start}-{end}"))
                .body(Body::from(layer[start..=end].to_vec()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[header::RANGE], format!("0-{end}").as_str());
    }

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={layer_digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, get("/v2/library/app/manifests/v1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], OCI_MANIFEST);
    assert_eq!(
        response.headers()["docker-content-digest"],
        manifest_digest.to_string().as_str()
    );
    assert_eq!(body_bytes(response).await, manifest.as_bytes());

    let response = send(&app, get(&format!("/v2/library/app/blobs/{layer_digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, layer);

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/library/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Content stays readable until a collection pass removes it.
    let response = send(&app, get(&format!("/v2/library/app/blobs/{layer_digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, layer);

    let report = registry.gc().collect_garbage(false).await.unwrap();
    assert_eq!(report.blob_count(), 1);
    assert_eq!(report.reclaimable_bytes(), 300);

    let response = send(&app, get(&format!("/v2/library/app/blobs/{layer_digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_repository_named_like_routes() {
    let app = test_registry().router();
    let layer = push_blob(&app, "org/blobs/app", b"nested layer").await;
    let manifest = manifest_for(&layer);

    let response = put_manifest(&app, "org/blobs/app", "latest", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, get("/v2/org/blobs/app/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, manifest.as_bytes());

    let response = send(&app, get("/v2/org/blobs/app/tags/list")).await;
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["name"], "org/blobs/app");
    assert_eq!(body["tags"], serde_json::json!(["latest"]));
}

#[tokio::test]
async fn test_blob_range_request() {
    let app = test_registry().router();
    let digest = push_blob(&app, "app", b"0123456789").await;

    let response = send(
        &app,
        Request::builder()
            .uri(format!("/v2/app/blobs/{digest}"))
            .header(header::RANGE, "bytes=2-5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
    assert_eq!(body_bytes(response).await, b"2345");
}

#[tokio::test]
async fn test_tag_pagination() {
    let app = test_registry().router();
    let layer = push_blob(&app, "app", b"layer").await;
    let manifest = manifest_for(&layer);

    for tag in ["a", "b", "c", "d", "e"] {
        let response = put_manifest(&app, "app", tag, &manifest).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = send(&app, get("/v2/app/tags/list?n=2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::LINK],
        "</v2/app/tags/list?n=2&last=b>; rel=\"next\""
    );
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["name"], "app");
    assert_eq!(body["tags"], serde_json::json!(["a", "b"]));

    let response = send(&app, get("/v2/app/tags/list?n=2&last=d")).await;
    assert!(response.headers().get(header::LINK).is_none());
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["tags"], serde_json::json!(["e"]));
}

#[tokio::test]
async fn test_cross_repository_mount() {
    let registry = test_registry();
    let app = registry.router();
    let digest = push_blob(&app, "source", b"shared layer").await;

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/target/blobs/uploads/?mount={digest}&from=source"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("/v2/target/blobs/{digest}").as_str()
    );
    assert!(registry.blobs().blob_linked(&digest, "target").await.unwrap());

    // Unknown blobs fall back to a new upload session
    let missing = Digest::calculate(b"missing");
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/target/blobs/uploads/?mount={missing}&from=source"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("docker-upload-uuid"));
}

#[tokio::test]
async fn test_error_codes() {
    let app = test_registry().router();

    let response = send(&app, get("/v2/Bad_Name/tags/list")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");

    let response = send(&app, get("/v2/app/blobs/sha256:not-hex")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, get("/v2/app/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    let response = send(&app, get("/v2/app/blobs/uploads/not-a-uuid")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let response = put_manifest(&app, "app", "v1", "not json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_INVALID");
}

#[tokio::test]
async fn test_upload_without_digest() {
    let app = test_registry().router();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(&location)
            .body(Body::from("data"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_catalog() {
    let app = test_registry().router();
    for repository in ["zeta", "alpha", "library/mid"] {
        push_blob(&app, repository, repository.as_bytes()).await;
    }

    let response = send(&app, get("/v2/_catalog")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body["repositories"],
        serde_json::json!(["alpha", "library/mid", "zeta"])
    );
}

#[derive(Debug)]
struct ReadOnly;

#[async_trait]
impl Authorizer for ReadOnly {
    async fn authorize(&self, _repository: &str, action: Action) -> bool {
        action == Action::Pull
    }
}

#[tokio::test]
async fn test_denied_push() {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    let app = RegistryBuilder::new(storage.into())
        .bucket("test-registry")
        .authorizer(Arc::new(ReadOnly))
        .build()
        .router();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "DENIED");

    let response = send(&app, get("/v2/_catalog")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
