//! # Container Value Model
//!
//! A [`Container`] is a pure value: an OCI container configuration, a lazy
//! rootfs derivation, and the results of the most recent execution. Every
//! "mutating" operation returns a new value and leaves the receiver
//! untouched, so containers are thread-safe to share and derive from
//! concurrently.
//!
//! Derivations fall into two families:
//!
//! - **configuration operations** (user, workdir, env, labels, entrypoint,
//!   default args, ports, mounts, service bindings, registry auth, pipeline
//!   labels) adjust fields and never touch the rootfs graph;
//! - **rootfs operations** (`from`, `build`, `with_rootfs`, the file writes,
//!   `with_exec`) advance the rootfs to a fresh graph node.
//!
//! Terminal operations (reading files or streams, publishing, exporting)
//! take an [`Engine`] and force evaluation through its backend.
//!
//! A container's ID is the canonical serialization of the whole record;
//! structurally equal derivation histories therefore produce equal IDs.

pub mod config;
pub(crate) mod exec;
pub mod mount;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::{Directory, File, Secret};
use crate::constants::{DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS, DEFAULT_DOCKERFILE, MAX_SERVICE_ALIAS_LEN};
use crate::container::config::{ExposedPort, ImageConfig, LastExec, NetworkProtocol};
use crate::container::mount::{Mount, MountKind};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::ident::{ContainerId, SecretId};
use crate::opgraph::{OpNode, OpRef};
use crate::pathutil;
use crate::pipeline::PipelineLabel;
use crate::platform::Platform;
use crate::service::service_hostname;

/// An alias under which another container is reachable during exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub alias: String,
    pub service: ContainerId,
}

/// Registry credentials for addresses matching a registry/repo prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuthEntry {
    pub address: String,
    pub username: String,
    pub secret: SecretId,
}

/// An immutable description of an OCI container.
///
/// See the [module docs](self) for the derivation model. Constructed via
/// [`Engine::container`](crate::engine::Engine::container) or decoded from
/// an ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub(crate) platform: Platform,
    pub(crate) rootfs: OpRef,
    pub(crate) config: ImageConfig,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) secret_envs: Vec<(String, SecretId)>,
    pub(crate) services: Vec<ServiceBinding>,
    pub(crate) registry_auths: Vec<RegistryAuthEntry>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) last_exec: Option<LastExec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) image_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) pipeline: Option<PipelineLabel>,
}

impl Container {
    /// The scratch container: empty rootfs, empty configuration.
    pub fn scratch(platform: Platform) -> Self {
        Self {
            platform,
            rootfs: OpRef::scratch(),
            config: ImageConfig::default(),
            mounts: Vec::new(),
            secret_envs: Vec::new(),
            services: Vec::new(),
            registry_auths: Vec::new(),
            last_exec: None,
            image_ref: None,
            pipeline: None,
        }
    }

    /// Content-addressed ID of this value.
    pub fn id(&self) -> Result<ContainerId> {
        ContainerId::encode(self)
    }

    /// Decodes a container from its opaque ID.
    pub fn from_id(id: &ContainerId) -> Result<Self> {
        id.decode()
    }

    /// The platform this container builds for.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Clones the receiver with `image_ref` cleared; every derivation goes
    /// through here so the ref only survives directly after `from`.
    pub(crate) fn derive(&self) -> Container {
        let mut next = self.clone();
        next.image_ref = None;
        next
    }

    // =========================================================================
    // Base Images
    // =========================================================================

    /// Initializes the rootfs from a registry image.
    ///
    /// Pins the reference to a digest through the backend, so the resulting
    /// graph node is stable, and imports the image's config (env,
    /// entrypoint, default args, workdir, user, labels, exposed ports)
    /// underneath any locally-set fields. Mounts and config survive;
    /// `last_exec` is cleared. The fully-qualified pinned reference is
    /// available from [`Container::image_ref`] until the next derivation.
    pub async fn from(&self, engine: &Engine, address: &str) -> Result<Container> {
        let pulled = engine.pull_image(address, &self.platform).await?;

        debug!(reference = %pulled.resolved_ref, platform = %self.platform, "pulled base image");

        let mut next = self.derive();
        next.rootfs = OpRef::new(OpNode::Pull {
            reference: pulled.resolved_ref.clone(),
            platform: self.platform.clone(),
        });
        next.config = self.config.merge_image_defaults(&pulled.config);
        next.last_exec = None;
        next.image_ref = Some(pulled.resolved_ref);
        Ok(next)
    }

    /// The fully-qualified, digest-pinned reference this container was
    /// initialized from. Present only on the value returned directly by
    /// [`Container::from`]; any derivation clears it.
    pub fn image_ref(&self) -> Option<&str> {
        self.image_ref.as_deref()
    }

    /// Initializes the rootfs by building a Dockerfile.
    ///
    /// `dockerfile` defaults to `./Dockerfile` relative to the context;
    /// `target` selects a build stage, defaulting to the final one. Lazy:
    /// the build runs when the rootfs is first forced, and build failures
    /// surface there as `BuildFailed`.
    pub fn build(
        &self,
        context: &Directory,
        dockerfile: Option<&str>,
        build_args: &[(&str, &str)],
        target: Option<&str>,
    ) -> Container {
        let mut next = self.derive();
        next.rootfs = OpRef::new(OpNode::DockerfileBuild {
            context: context.origin.clone(),
            context_path: context.path.clone(),
            dockerfile: dockerfile.unwrap_or(DEFAULT_DOCKERFILE).to_string(),
            build_args: build_args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            target: target.map(str::to_string),
            platform: self.platform.clone(),
        });
        next.last_exec = None;
        next
    }

    // =========================================================================
    // Rootfs
    // =========================================================================

    /// Returns the rootfs as a directory value, without mounts overlaid.
    pub fn rootfs(&self, engine: &Engine) -> Result<Directory> {
        let dir = Directory::from_op(self.rootfs.clone(), "/".to_string(), self.platform.clone());
        engine.bind_artifact_services(dir.id()?.as_str(), &self.services);
        Ok(dir)
    }

    /// Legacy alias for [`Container::rootfs`].
    #[deprecated(note = "use `rootfs` instead")]
    pub fn fs(&self, engine: &Engine) -> Result<Directory> {
        self.rootfs(engine)
    }

    /// Replaces the rootfs with a directory value.
    ///
    /// Mounts and configuration are preserved; `last_exec` is cleared.
    pub fn with_rootfs(&self, dir: &Directory) -> Container {
        let mut next = self.derive();
        next.rootfs = if dir.path == "/" {
            dir.origin.clone()
        } else {
            // Re-root the subdirectory so the container sees it at /.
            OpRef::new(OpNode::Copy {
                base: OpRef::scratch(),
                source: dir.origin.clone(),
                source_path: dir.path.clone(),
                dest_path: "/".to_string(),
                include: Vec::new(),
                exclude: Vec::new(),
                permissions: None,
            })
        };
        next.last_exec = None;
        next
    }

    /// Legacy alias for [`Container::with_rootfs`].
    #[deprecated(note = "use `with_rootfs` instead")]
    pub fn with_fs(&self, dir: &Directory) -> Container {
        self.with_rootfs(dir)
    }

    // =========================================================================
    // Rootfs Writes
    // =========================================================================

    /// Returns a container whose rootfs has `contents` written at `path`.
    ///
    /// Relative paths resolve against the workdir. Parents are created as
    /// needed with 0755; `permissions` defaults to 0644.
    pub fn with_new_file(
        &self,
        path: &str,
        contents: impl Into<Vec<u8>>,
        permissions: Option<u32>,
    ) -> Result<Container> {
        let target = pathutil::resolve(self.config.workdir.as_deref(), path)?;
        let mut next = self.derive();
        next.rootfs = OpRef::new(OpNode::Mkfile {
            base: self.rootfs.clone(),
            path: target,
            contents: contents.into(),
            permissions: permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS),
        });
        next.last_exec = None;
        Ok(next)
    }

    /// Returns a container whose rootfs has the file value copied to `path`.
    pub fn with_file(
        &self,
        path: &str,
        source: &File,
        permissions: Option<u32>,
    ) -> Result<Container> {
        let target = pathutil::resolve(self.config.workdir.as_deref(), path)?;
        let mut next = self.derive();
        next.rootfs = OpRef::new(OpNode::Copy {
            base: self.rootfs.clone(),
            source: source.origin.clone(),
            source_path: source.path.clone(),
            dest_path: target,
            include: Vec::new(),
            exclude: Vec::new(),
            permissions,
        });
        next.last_exec = None;
        Ok(next)
    }

    /// Returns a container whose rootfs has the directory value copied in
    /// at `path`, filtered by the optional `include`/`exclude` globs
    /// (exclude applies after include; absent filters copy everything).
    pub fn with_directory(
        &self,
        path: &str,
        source: &Directory,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<Container> {
        let target = pathutil::resolve(self.config.workdir.as_deref(), path)?;
        let mut next = self.derive();
        next.rootfs = OpRef::new(OpNode::Copy {
            base: self.rootfs.clone(),
            source: source.origin.clone(),
            source_path: source.path.clone(),
            dest_path: target,
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            permissions: None,
        });
        next.last_exec = None;
        Ok(next)
    }

    /// Returns a container whose rootfs has a directory created at `path`.
    ///
    /// `permissions` defaults to 0755.
    pub fn with_new_directory(&self, path: &str, permissions: Option<u32>) -> Result<Container> {
        let target = pathutil::resolve(self.config.workdir.as_deref(), path)?;
        let mut next = self.derive();
        next.rootfs = OpRef::new(OpNode::Mkdir {
            base: self.rootfs.clone(),
            path: target,
            permissions: permissions.unwrap_or(DEFAULT_DIR_PERMISSIONS),
        });
        next.last_exec = None;
        Ok(next)
    }

    // =========================================================================
    // Path Readers
    // =========================================================================

    /// Returns the directory at `path`, with current mounts overlaid.
    ///
    /// Reads through directory and file mounts; paths under tempfs, cache,
    /// secret, or socket mounts fail with `MountNotReadable`. The returned
    /// value inherits this container's service bindings.
    pub fn directory(&self, engine: &Engine, path: &str) -> Result<Directory> {
        let target = pathutil::resolve(self.config.workdir.as_deref(), path)?;
        let origin = self.read_origin(&target)?;
        let dir = Directory::from_op(origin.0, origin.1, self.platform.clone());
        engine.bind_artifact_services(dir.id()?.as_str(), &self.services);
        Ok(dir)
    }

    /// Returns the file at `path`, with current mounts overlaid.
    pub fn file(&self, engine: &Engine, path: &str) -> Result<File> {
        let target = pathutil::resolve(self.config.workdir.as_deref(), path)?;
        let (origin, origin_path) = self.read_origin(&target)?;
        let file = File {
            origin,
            path: origin_path,
            platform: self.platform.clone(),
        };
        engine.bind_artifact_services(file.id()?.as_str(), &self.services);
        Ok(file)
    }

    /// Resolves a read at `target` to an origin graph node and a path
    /// inside it, honoring the mount overlay semantics.
    fn read_origin(&self, target: &str) -> Result<(OpRef, String)> {
        if let Some(mount) = self.mount_covering(target) {
            let rest = target
                .strip_prefix(mount.path.as_str())
                .unwrap_or("")
                .trim_start_matches('/');
            return match &mount.kind {
                MountKind::Directory { source } => {
                    let path = if rest.is_empty() {
                        source.path.clone()
                    } else {
                        pathutil::resolve(Some(&source.path), rest)?
                    };
                    Ok((source.origin.clone(), path))
                }
                MountKind::File { source } if rest.is_empty() => {
                    Ok((source.origin.clone(), source.path.clone()))
                }
                MountKind::File { .. } => Err(Error::invalid_path(
                    target,
                    "path descends into a file mount",
                )),
                other => Err(Error::MountNotReadable {
                    path: target.to_string(),
                    kind: other.label(),
                }),
            };
        }

        // No mount covers the path; overlay readable mounts below it so the
        // materialization matches what an exec would see.
        let layers: Vec<crate::opgraph::OverlayLayer> = self
            .mounts
            .iter()
            .filter(|m| pathutil::is_under(target, &m.path))
            .filter_map(|m| match &m.kind {
                MountKind::Directory { source } => Some(crate::opgraph::OverlayLayer {
                    at: m.path.clone(),
                    source: source.origin.clone(),
                    source_path: source.path.clone(),
                }),
                MountKind::File { source } => Some(crate::opgraph::OverlayLayer {
                    at: m.path.clone(),
                    source: source.origin.clone(),
                    source_path: source.path.clone(),
                }),
                _ => None,
            })
            .collect();

        let origin = if layers.is_empty() {
            self.rootfs.clone()
        } else {
            OpRef::new(OpNode::Overlay {
                base: self.rootfs.clone(),
                layers,
            })
        };
        Ok((origin, target.to_string()))
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Sets the user the process runs as.
    pub fn with_user(&self, user: &str) -> Container {
        let mut next = self.derive();
        next.config.user = Some(user.to_string());
        next
    }

    /// The configured user, if any.
    pub fn user(&self) -> Option<&str> {
        self.config.user.as_deref()
    }

    /// Sets the working directory.
    pub fn with_workdir(&self, workdir: &str) -> Result<Container> {
        let workdir = pathutil::resolve(self.config.workdir.as_deref(), workdir)?;
        let mut next = self.derive();
        next.config.workdir = Some(workdir);
        Ok(next)
    }

    /// The configured working directory, if any.
    pub fn workdir(&self) -> Option<&str> {
        self.config.workdir.as_deref()
    }

    /// Sets an environment variable, replacing any prior plain or secret
    /// entry of the same name.
    pub fn with_env_variable(&self, name: &str, value: &str) -> Container {
        let mut next = self.derive();
        next.secret_envs.retain(|(n, _)| n != name);
        next.config.set_env(name, value);
        next
    }

    /// Binds an environment variable to a secret, replacing any prior plain
    /// or secret entry of the same name. The value is materialized only
    /// inside execs, through the backend's secret channel.
    pub fn with_secret_variable(&self, name: &str, secret: &Secret) -> Container {
        let mut next = self.derive();
        next.config.remove_env(name);
        match next.secret_envs.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = secret.id().clone(),
            None => next.secret_envs.push((name.to_string(), secret.id().clone())),
        }
        next
    }

    /// Removes an environment variable, plain or secret.
    pub fn without_env_variable(&self, name: &str) -> Container {
        let mut next = self.derive();
        next.config.remove_env(name);
        next.secret_envs.retain(|(n, _)| n != name);
        next
    }

    /// Looks up a plain environment variable.
    pub fn env_variable(&self, name: &str) -> Option<&str> {
        self.config.get_env(name)
    }

    /// All plain environment variables, in insertion order.
    pub fn env_variables(&self) -> &[(String, String)] {
        &self.config.env
    }

    /// Sets a label, replacing any prior value.
    pub fn with_label(&self, name: &str, value: &str) -> Container {
        let mut next = self.derive();
        next.config.set_label(name, value);
        next
    }

    /// Removes a label.
    pub fn without_label(&self, name: &str) -> Container {
        let mut next = self.derive();
        next.config.remove_label(name);
        next
    }

    /// Looks up a label.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.config
            .labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All labels, in insertion order.
    pub fn labels(&self) -> &[(String, String)] {
        &self.config.labels
    }

    /// Sets the entrypoint.
    pub fn with_entrypoint(&self, entrypoint: &[&str]) -> Container {
        let mut next = self.derive();
        next.config.entrypoint = Some(entrypoint.iter().map(|s| s.to_string()).collect());
        next
    }

    /// The configured entrypoint, if any.
    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config.entrypoint.as_deref()
    }

    /// Sets the default arguments used when `exec` is called without args.
    pub fn with_default_args(&self, args: &[&str]) -> Container {
        let mut next = self.derive();
        next.config.default_args = Some(args.iter().map(|s| s.to_string()).collect());
        next
    }

    /// The configured default arguments, if any.
    pub fn default_args(&self) -> Option<&[String]> {
        self.config.default_args.as_deref()
    }

    /// Exposes a port, replacing any prior entry with the same
    /// (port, protocol) key.
    pub fn with_exposed_port(
        &self,
        port: u16,
        protocol: NetworkProtocol,
        description: Option<&str>,
    ) -> Container {
        let mut next = self.derive();
        next.config.add_port(ExposedPort {
            port,
            protocol,
            description: description.map(str::to_string),
        });
        next
    }

    /// Removes an exposed port by (port, protocol) key.
    pub fn without_exposed_port(&self, port: u16, protocol: NetworkProtocol) -> Container {
        let mut next = self.derive();
        next.config.remove_port(port, protocol);
        next
    }

    /// Exposed ports, in insertion order.
    pub fn exposed_ports(&self) -> &[ExposedPort] {
        &self.config.exposed_ports
    }

    /// Records registry credentials for addresses under `address`,
    /// replacing any prior entry for the same address. At publish time the
    /// entry with the longest matching registry/repo prefix is used.
    pub fn with_registry_auth(
        &self,
        address: &str,
        username: &str,
        secret: &Secret,
    ) -> Container {
        let mut next = self.derive();
        let entry = RegistryAuthEntry {
            address: address.to_string(),
            username: username.to_string(),
            secret: secret.id().clone(),
        };
        match next
            .registry_auths
            .iter_mut()
            .find(|e| e.address == address)
        {
            Some(existing) => *existing = entry,
            None => next.registry_auths.push(entry),
        }
        next
    }

    /// Removes registry credentials for exactly `address`.
    pub fn without_registry_auth(&self, address: &str) -> Container {
        let mut next = self.derive();
        next.registry_auths.retain(|e| e.address != address);
        next
    }

    /// Tags derived values with a named sub-pipeline; nested calls join
    /// names with `/`.
    pub fn pipeline(&self, name: &str, description: Option<&str>) -> Container {
        let mut next = self.derive();
        next.pipeline = Some(match &self.pipeline {
            Some(parent) => parent.child(name, description.map(str::to_string)),
            None => PipelineLabel::new(name, description.map(str::to_string)),
        });
        next
    }

    /// The current sub-pipeline label, if any.
    pub fn pipeline_label(&self) -> Option<&PipelineLabel> {
        self.pipeline.as_ref()
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Binds another container as a service reachable at `alias` during
    /// execs. The service is not started until a consumer forces
    /// evaluation. Rebinding an alias replaces it.
    pub fn with_service_binding(&self, alias: &str, service: &Container) -> Result<Container> {
        if alias.is_empty() || alias.len() > MAX_SERVICE_ALIAS_LEN {
            return Err(Error::invalid_id(
                "service binding",
                format!("alias must be 1..={MAX_SERVICE_ALIAS_LEN} characters"),
            ));
        }
        let binding = ServiceBinding {
            alias: alias.to_string(),
            service: service.id()?,
        };
        let mut next = self.derive();
        match next.services.iter_mut().find(|b| b.alias == alias) {
            Some(existing) => *existing = binding,
            None => next.services.push(binding),
        }
        Ok(next)
    }

    /// The hostname other containers can reach this container at when it is
    /// bound as a service. Stable for a given container ID.
    pub fn hostname(&self) -> Result<String> {
        Ok(service_hostname(&self.id()?))
    }

    /// An `[scheme://]host:port` endpoint for this container as a service.
    ///
    /// `port` defaults to the first exposed port in insertion order; with
    /// no exposed ports, fails with `NoExposedPort`.
    pub fn endpoint(&self, port: Option<u16>, scheme: Option<&str>) -> Result<String> {
        let port = match port {
            Some(port) => port,
            None => self
                .config
                .exposed_ports
                .first()
                .map(|p| p.port)
                .ok_or(Error::NoExposedPort)?,
        };
        let host = self.hostname()?;
        Ok(match scheme {
            Some(scheme) => format!("{scheme}://{host}:{port}"),
            None => format!("{host}:{port}"),
        })
    }
}
