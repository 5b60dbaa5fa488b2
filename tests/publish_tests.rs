//! Publication and export tests: multi-platform index assembly, registry
//! credential selection, and OCI-layout tarball output.

use std::sync::Arc;

use pipeforge::{Container, Engine, Error, ImageConfig, MemNode, MemoryBackend, Platform};
use tempfile::TempDir;

fn setup() -> (Arc<MemoryBackend>, Engine) {
    let backend = Arc::new(MemoryBackend::new());
    for platform in [Platform::new("linux", "amd64"), Platform::new("linux", "arm64")] {
        backend
            .register_image(
                "alpine:3.18",
                &platform,
                ImageConfig::default(),
                MemNode::dir().with_file("/etc/arch", platform.arch.clone().into_bytes()),
            )
            .unwrap();
    }
    (backend.clone(), Engine::new(backend))
}

async fn base(engine: &Engine, platform: Platform) -> Container {
    engine
        .container(Some(platform))
        .from(engine, "alpine:3.18")
        .await
        .unwrap()
}

// =============================================================================
// Publish
// =============================================================================

#[tokio::test]
async fn publish_single_platform() {
    let (backend, engine) = setup();
    let container = base(&engine, Platform::new("linux", "amd64")).await;

    let reference = container
        .publish(&engine, "registry.example.com/team/app:1.0", &[])
        .await
        .unwrap();

    let published = backend.published("registry.example.com/team/app:1.0").unwrap();
    assert_eq!(
        reference,
        format!("registry.example.com/team/app@{}", published.digest)
    );
    assert_eq!(published.manifests.len(), 1);
    assert_eq!(published.manifests[0].platform, "linux/amd64");
}

#[tokio::test]
async fn publish_multi_platform_index() {
    let (backend, engine) = setup();
    let amd64 = base(&engine, Platform::new("linux", "amd64")).await;
    let arm64 = base(&engine, Platform::new("linux", "arm64")).await;

    let reference = amd64
        .publish(&engine, "registry.example.com/team/app:multi", &[arm64])
        .await
        .unwrap();
    assert!(reference.contains("@sha256:"));

    let published = backend
        .published("registry.example.com/team/app:multi")
        .unwrap();
    let platforms: Vec<&str> = published
        .manifests
        .iter()
        .map(|m| m.platform.as_str())
        .collect();
    assert_eq!(platforms, vec!["linux/amd64", "linux/arm64"]);
    assert!(reference.ends_with(&published.digest));
}

#[tokio::test]
async fn publish_rejects_duplicate_platforms() {
    let (_, engine) = setup();
    let amd64 = base(&engine, Platform::new("linux", "amd64")).await;
    let duplicate = amd64.with_env_variable("COPY", "yes");

    let err = amd64
        .publish(&engine, "registry.example.com/team/app:dup", &[duplicate])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PublishFailed { .. }));
}

#[tokio::test]
async fn publish_uses_registry_auth() {
    let (backend, engine) = setup();
    backend.require_auth("registry.example.com");

    let container = base(&engine, Platform::new("linux", "amd64")).await;
    let err = container
        .publish(&engine, "registry.example.com/team/app:auth", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PublishFailed { .. }));

    let token = engine.secret("registry-token", b"s3cret").await.unwrap();
    let authed = container.with_registry_auth("registry.example.com", "ci", &token);
    let reference = authed
        .publish(&engine, "registry.example.com/team/app:auth", &[])
        .await
        .unwrap();
    assert!(reference.starts_with("registry.example.com/team/app@sha256:"));
}

// =============================================================================
// Export
// =============================================================================

#[tokio::test]
async fn export_writes_an_oci_layout_tarball() {
    let (_, engine) = setup();
    let amd64 = base(&engine, Platform::new("linux", "amd64")).await;
    let arm64 = base(&engine, Platform::new("linux", "arm64")).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.tar");
    let ok = amd64.export(&engine, &path, &[arm64]).await.unwrap();
    assert!(ok);

    let mut archive = tar::Archive::new(std::fs::File::open(&path).unwrap());
    let mut index_json = None;
    let mut saw_layout = false;
    let mut blob_count = 0usize;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        match name.as_str() {
            "index.json" => {
                let mut data = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
                index_json = Some(data);
            }
            "oci-layout" => saw_layout = true,
            name if name.starts_with("blobs/sha256/") => blob_count += 1,
            _ => {}
        }
    }

    assert!(saw_layout);
    // Two images, each contributing a layer, config, and manifest blob.
    assert_eq!(blob_count, 6);

    let index: serde_json::Value = serde_json::from_slice(&index_json.unwrap()).unwrap();
    let manifests = index["manifests"].as_array().unwrap();
    assert_eq!(manifests.len(), 2);
    let archs: Vec<&str> = manifests
        .iter()
        .map(|m| m["platform"]["architecture"].as_str().unwrap())
        .collect();
    assert_eq!(archs, vec!["amd64", "arm64"]);
}

#[tokio::test]
async fn export_to_unwritable_path_fails() {
    let (_, engine) = setup();
    let container = base(&engine, Platform::new("linux", "amd64")).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing-subdir").join("app.tar");
    let err = container.export(&engine, &path, &[]).await.unwrap_err();
    assert!(matches!(err, Error::ExportFailed { .. }));
}

#[tokio::test]
async fn export_rejects_duplicate_platforms() {
    let (_, engine) = setup();
    let amd64 = base(&engine, Platform::new("linux", "amd64")).await;
    let copy = amd64.with_label("copy", "yes");

    let dir = TempDir::new().unwrap();
    let err = amd64
        .export(&engine, dir.path().join("dup.tar"), &[copy])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExportFailed { .. }));
}
