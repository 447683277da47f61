//! Registry on a throwaway directory, pre-seeded with one tagged image.
//!
//! Run with: cargo run -p distribution --example basic_server
//! Then: docker pull 127.0.0.1:5000/demo/hello:latest

use distribution::{Digest, RegistryBuilder, RegistryConfig, media_types};
use storage::{Storage, TempDriver};

async fn seed(registry: &distribution::Registry) -> Result<Digest, Box<dyn std::error::Error>> {
    let repository = "demo/hello";
    let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
    let config_digest = Digest::calculate(config);
    registry.blobs().store_blob(&config_digest, config, None).await?;
    registry
        .blobs()
        .link_blob_to_repository(&config_digest, repository)
        .await?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest.to_string(),
            "size": config.len(),
        },
        "layers": [],
    });
    let manifest = registry
        .manifests()
        .store_manifest(
            repository,
            "latest",
            &serde_json::to_vec(&manifest)?,
            Some(media_types::OCI_MANIFEST),
        )
        .await?;
    Ok(manifest.digest)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,distribution=debug")
        .init();

    let config = RegistryConfig {
        bucket: "example".into(),
        upload_timeout: 600,
        ..RegistryConfig::default()
    };
    let registry = RegistryBuilder::new(Storage::new(TempDriver::new()?))
        .config(config)
        .build();

    let digest = seed(&registry).await?;
    tracing::info!(%digest, "Seeded demo/hello:latest");

    let stats = registry.gc().statistics().await?;
    tracing::info!(
        blobs = stats.total_blobs,
        bytes = stats.total_size,
        orphaned = stats.orphaned_blobs,
        "Storage before serving"
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
    tracing::info!(addr = %listener.local_addr()?, "Serving registry");
    axum::serve(listener, registry.router()).await?;

    Ok(())
}
