//! # Publication & Export
//!
//! Terminal operations that assemble one or more container values into OCI
//! images: `publish` pushes to a registry and returns the digest-pinned
//! reference, `export` writes an OCI-layout tarball to a host path. With
//! platform variants, the backend builds a multi-platform image index whose
//! manifests are the receiver plus each variant.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{DirectoryHandle, RegistryCredential};
use crate::container::{Container, RegistryAuthEntry};
use crate::engine::Engine;
use crate::error::{Error, Result};

// =============================================================================
// Assembled Images
// =============================================================================

/// OCI image config document, synthesized from a container's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciImageConfig {
    pub created: DateTime<Utc>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,
    pub config: OciProcessConfig,
}

/// The `config` object of an OCI image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OciProcessConfig {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
}

/// One materialized image: a solved rootfs plus its config, tagged with the
/// platform it was built for.
#[derive(Debug, Clone)]
pub struct ImageAssembly {
    pub platform: crate::platform::Platform,
    pub rootfs: DirectoryHandle,
    pub config: OciImageConfig,
}

fn oci_config_of(container: &Container) -> OciImageConfig {
    let config = &container.config;
    OciImageConfig {
        created: Utc::now(),
        architecture: container.platform.arch.clone(),
        os: container.platform.os.clone(),
        variant: container.platform.variant.clone(),
        config: OciProcessConfig {
            user: config.user.clone(),
            env: config
                .env
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect(),
            entrypoint: config.entrypoint.clone(),
            cmd: config.default_args.clone(),
            working_dir: config.workdir.clone(),
            labels: config
                .labels
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            exposed_ports: config
                .exposed_ports
                .iter()
                .map(|p| {
                    (
                        format!("{}/{}", p.port, p.protocol),
                        serde_json::Value::Object(serde_json::Map::new()),
                    )
                })
                .collect(),
        },
    }
}

// =============================================================================
// Credential Selection
// =============================================================================

/// Selects the auth entry with the longest registry/repo prefix matching
/// `address`.
fn select_credential(
    auths: &[RegistryAuthEntry],
    address: &str,
) -> Result<Option<RegistryCredential>> {
    let reference: oci_distribution::Reference =
        address.parse().map_err(|e| Error::PublishFailed {
            address: address.to_string(),
            reason: format!("{e}"),
        })?;
    let name = format!("{}/{}", reference.registry(), reference.repository());

    let best = auths
        .iter()
        .filter(|entry| {
            let prefix = entry.address.trim_end_matches('/');
            name == prefix
                || name
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|entry| entry.address.len());

    Ok(best.map(|entry| RegistryCredential {
        username: entry.username.clone(),
        secret: entry.secret.clone(),
    }))
}

// =============================================================================
// Terminal Operations
// =============================================================================

impl Container {
    /// Materializes the receiver and each variant into [`ImageAssembly`]s,
    /// validating that platforms are pairwise distinct.
    async fn assemble(
        &self,
        engine: &Engine,
        variants: &[Container],
        mut distinct_err: impl FnMut(String) -> Error,
    ) -> Result<Vec<ImageAssembly>> {
        let mut images = Vec::with_capacity(1 + variants.len());
        let mut seen = std::collections::HashSet::new();
        for container in std::iter::once(self).chain(variants.iter()) {
            let platform = container.platform.to_string();
            if !seen.insert(platform.clone()) {
                return Err(distinct_err(format!(
                    "duplicate platform {platform} among variants"
                )));
            }
            let rootfs = engine.solve(&container.rootfs, &container.platform).await?;
            images.push(ImageAssembly {
                platform: container.platform.clone(),
                rootfs,
                config: oci_config_of(container),
            });
        }
        Ok(images)
    }

    /// Publishes this container (plus `platform_variants`, if any, as a
    /// multi-platform index) to a registry address.
    ///
    /// Forces evaluation of every variant's rootfs. Returns the canonical
    /// fully-qualified reference (address plus digest). Credentials come
    /// from `with_registry_auth`, selected by longest matching prefix.
    pub async fn publish(
        &self,
        engine: &Engine,
        address: &str,
        platform_variants: &[Container],
    ) -> Result<String> {
        let credential = select_credential(&self.registry_auths, address)?;
        let images = self
            .assemble(engine, platform_variants, |reason| Error::PublishFailed {
                address: address.to_string(),
                reason,
            })
            .await?;

        let pushed = engine
            .with_cancel(engine.backend.push(&images, address, credential.as_ref()))
            .await?;
        info!(reference = %pushed, images = images.len(), "published image");
        Ok(pushed)
    }

    /// Writes this container (plus variants) as an OCI-layout tarball at a
    /// host path. Returns `true` on success; IO failures surface as
    /// `ExportFailed`.
    pub async fn export(
        &self,
        engine: &Engine,
        path: impl AsRef<Path>,
        platform_variants: &[Container],
    ) -> Result<bool> {
        let path = path.as_ref();
        let images = self
            .assemble(engine, platform_variants, |reason| Error::ExportFailed {
                path: path.to_path_buf(),
                reason,
            })
            .await?;

        engine
            .with_cancel(engine.backend.export_oci(&images, path))
            .await?;
        info!(path = %path.display(), images = images.len(), "exported OCI tarball");
        Ok(true)
    }
}
