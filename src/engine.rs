//! # Engine
//!
//! The process-level evaluator. The engine owns the backend capability, the
//! service coordinator, the single-flight solve table, and the cancellation
//! scope; container and artifact values stay pure and borrow the engine
//! only for terminal operations.
//!
//! ## Single-flight
//!
//! Solves are keyed by the root digest of the lowered op graph. Two
//! concurrent evaluations of the same graph share one in-flight backend
//! solve; completed solves are cached for the life of the engine, and an
//! exec run primes the cache for its own node so the post-exec rootfs is
//! never re-materialized.
//!
//! ## Cancellation
//!
//! Every backend await races the engine's [`CancellationToken`]; callers
//! that need a narrower scope construct the engine with a child token.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::artifact::{CacheVolume, Directory, File, Secret, Socket};
use crate::backend::{
    BuildBackend, DirectoryHandle, ExecMount, ExecOutcome, ExecSpec, PulledImage, ServiceAddr,
    ServiceStartSpec, StreamHandle,
};
use crate::constants::{IMAGE_PULL_TIMEOUT, IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN, SERVICE_START_TIMEOUT};
use crate::container::mount::MountKind;
use crate::container::{Container, ServiceBinding};
use crate::error::{Error, Result};
use crate::ident::ContainerId;
use crate::opgraph::{LoweredDag, LoweredOp, OpNode, OpRef};
use crate::platform::Platform;
use crate::service::{ServiceCoordinator, ServiceLease, service_hostname};

/// The evaluator for container and artifact values.
pub struct Engine {
    pub(crate) backend: Arc<dyn BuildBackend>,
    pub(crate) services: ServiceCoordinator,
    solves: StdMutex<HashMap<String, Arc<OnceCell<DirectoryHandle>>>>,
    artifact_services: StdMutex<HashMap<String, Vec<ServiceBinding>>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Creates an engine over a backend with a fresh cancellation scope.
    pub fn new(backend: Arc<dyn BuildBackend>) -> Self {
        Self::with_token(backend, CancellationToken::new())
    }

    /// Creates an engine whose terminal operations abort when `cancel`
    /// fires.
    pub fn with_token(backend: Arc<dyn BuildBackend>, cancel: CancellationToken) -> Self {
        Self {
            services: ServiceCoordinator::new(backend.clone()),
            backend,
            solves: StdMutex::new(HashMap::new()),
            artifact_services: StdMutex::new(HashMap::new()),
            cancel,
        }
    }

    /// The engine's cancellation token; cancelling it aborts in-flight
    /// terminal operations with [`Error::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Value Constructors
    // =========================================================================

    /// A scratch container, at the host platform unless one is given.
    pub fn container(&self, platform: Option<Platform>) -> Container {
        Container::scratch(platform.unwrap_or_default())
    }

    /// Decodes a container from its opaque ID.
    pub fn container_from_id(&self, id: &ContainerId) -> Result<Container> {
        Container::from_id(id)
    }

    /// A scratch directory, at the host platform unless one is given.
    pub fn directory(&self, platform: Option<Platform>) -> Directory {
        Directory::scratch(platform.unwrap_or_default())
    }

    /// The cache volume named `key`. Equal keys address the same volume.
    pub fn cache_volume(&self, key: &str) -> Result<CacheVolume> {
        CacheVolume::new(key)
    }

    /// Registers a named secret with the backend and returns its reference.
    pub async fn secret(&self, name: &str, plaintext: &[u8]) -> Result<Secret> {
        self.backend.add_secret(name, plaintext).await
    }

    /// Registers a host socket endpoint with the backend.
    pub async fn socket(&self, host_path: &str) -> Result<Socket> {
        self.backend.add_socket(host_path).await
    }

    /// True while at least one live consumer holds the container running
    /// as a service.
    pub async fn service_is_running(&self, container: &Container) -> Result<bool> {
        Ok(self.services.is_running(&container.id()?).await)
    }

    // =========================================================================
    // Cancellation Plumbing
    // =========================================================================

    pub(crate) async fn with_cancel<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Validates and pulls an image reference through the backend.
    pub(crate) async fn pull_image(&self, address: &str, platform: &Platform) -> Result<PulledImage> {
        if address.is_empty() || address.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::PullFailed {
                reference: address.chars().take(64).collect(),
                reason: format!("reference must be 1..={MAX_IMAGE_REF_LEN} bytes"),
            });
        }
        if !address.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(Error::PullFailed {
                reference: address.to_string(),
                reason: "reference contains invalid characters".to_string(),
            });
        }
        let _: oci_distribution::Reference =
            address.parse().map_err(|e| Error::PullFailed {
                reference: address.to_string(),
                reason: format!("{e}"),
            })?;

        self.with_cancel(async {
            tokio::time::timeout(IMAGE_PULL_TIMEOUT, self.backend.pull(address, platform))
                .await
                .map_err(|_| Error::PullFailed {
                    reference: address.to_string(),
                    reason: format!("timed out after {IMAGE_PULL_TIMEOUT:?}"),
                })?
        })
        .await
    }

    // =========================================================================
    // Solving
    // =========================================================================

    /// Solves an op graph at a platform, holding leases on every service
    /// bound inside the graph's exec nodes for the duration.
    pub(crate) async fn solve(&self, op: &OpRef, platform: &Platform) -> Result<DirectoryHandle> {
        let dag = op.lower(platform);
        let root_digest = dag.nodes[dag.root].digest.clone();

        let mut service_ids = Vec::new();
        let mut seen = HashSet::new();
        for node in &dag.nodes {
            if let LoweredOp::Exec { exec, .. } = &node.op {
                for service in &exec.services {
                    if seen.insert(service.service.digest()) {
                        service_ids.push(service.service.clone());
                    }
                }
            }
        }

        let mut leases = Vec::new();
        let mut failure = None;
        for id in &service_ids {
            match self.lease_service(id).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let result = match failure {
            Some(e) => Err(e),
            None => self.solve_cached(&root_digest, &dag).await,
        };
        self.release_leases(leases).await;
        result
    }

    async fn solve_cached(&self, digest: &str, dag: &LoweredDag) -> Result<DirectoryHandle> {
        let cell = {
            let mut solves = self.solves.lock().unwrap_or_else(|e| e.into_inner());
            solves
                .entry(digest.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let handle = cell
            .get_or_try_init(|| async {
                debug!(digest, nodes = dag.nodes.len(), "solving op graph");
                self.with_cancel(self.backend.solve(dag, &self.cancel)).await
            })
            .await?;
        Ok(handle.clone())
    }

    /// Records a known solve result, so subsequent solves of the node are
    /// served from cache.
    fn prime_solve(&self, digest: String, handle: DirectoryHandle) {
        let mut solves = self.solves.lock().unwrap_or_else(|e| e.into_inner());
        solves
            .entry(digest)
            .or_insert_with(|| Arc::new(OnceCell::new_with(Some(handle))));
    }

    // =========================================================================
    // Exec
    // =========================================================================

    /// Runs the exec node `node` (freshly derived from `container`),
    /// returning the captured outcome.
    pub(crate) async fn run_exec(&self, container: &Container, node: &OpRef) -> Result<ExecOutcome> {
        let OpNode::Exec { base, exec } = node.node() else {
            return Err(Error::Internal("run_exec called on a non-exec node".to_string()));
        };
        let platform = &container.platform;

        let rootfs = self.solve(base, platform).await?;

        let mut mounts = Vec::with_capacity(exec.mounts.len());
        for mount in &exec.mounts {
            let materialized = match &mount.kind {
                MountKind::Directory { source } => ExecMount::Directory {
                    path: mount.path.clone(),
                    source: self.solve(&source.origin, &source.platform).await?,
                    source_path: source.path.clone(),
                },
                MountKind::File { source } => ExecMount::File {
                    path: mount.path.clone(),
                    source: self.solve(&source.origin, &source.platform).await?,
                    source_path: source.path.clone(),
                },
                MountKind::Temp => ExecMount::Temp {
                    path: mount.path.clone(),
                },
                MountKind::Cache { id, base, sharing } => ExecMount::Cache {
                    path: mount.path.clone(),
                    volume: id.digest(),
                    base: match base {
                        Some(dir) => Some((
                            self.solve(&dir.origin, &dir.platform).await?,
                            dir.path.clone(),
                        )),
                        None => None,
                    },
                    sharing: *sharing,
                },
                MountKind::Secret { id } => ExecMount::Secret {
                    path: mount.path.clone(),
                    id: id.clone(),
                },
                MountKind::Socket { id } => ExecMount::Socket {
                    path: mount.path.clone(),
                    id: id.clone(),
                },
            };
            mounts.push(materialized);
        }

        let mut leases = Vec::new();
        let mut addrs = Vec::new();
        let mut failure = None;
        for binding in &exec.services {
            let ports = match Container::from_id(&binding.service) {
                Ok(service) => service.config.exposed_ports.clone(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            match self.lease_service(&binding.service).await {
                Ok(lease) => {
                    addrs.push(ServiceAddr {
                        alias: binding.alias.clone(),
                        hostname: lease.hostname.clone(),
                        ports,
                    });
                    leases.push(lease);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let node_digest = node.digest(platform);
        let result = match failure {
            Some(e) => Err(e),
            None => {
                let spec = ExecSpec {
                    rootfs,
                    args: exec.args.clone(),
                    env: exec.env.clone(),
                    secret_env: exec.secret_env.clone(),
                    mounts,
                    workdir: exec.workdir.clone(),
                    user: exec.user.clone(),
                    platform: platform.clone(),
                    stdin: exec.stdin.clone(),
                    redirect_stdout: exec.redirect_stdout.clone(),
                    redirect_stderr: exec.redirect_stderr.clone(),
                    privileged: exec.privileged,
                    services: addrs,
                    node_digest: node_digest.clone(),
                };
                self.with_cancel(self.backend.run(spec, &self.cancel)).await
            }
        };
        self.release_leases(leases).await;

        let outcome = result?;
        self.prime_solve(node_digest, outcome.post_rootfs.clone());
        Ok(outcome)
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Leases a service container by ID, starting it (and its transitive
    /// dependency services) when no instance is live.
    fn lease_service<'a>(
        &'a self,
        id: &'a ContainerId,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceLease>> + Send + 'a>> {
        Box::pin(async move {
            let container = Container::from_id(id)?;
            self.services
                .acquire(id, || async {
                    let mut deps = Vec::new();
                    for binding in &container.services {
                        match self.lease_service(&binding.service).await {
                            Ok(lease) => deps.push(lease),
                            Err(e) => {
                                self.release_leases(deps).await;
                                return Err(e);
                            }
                        }
                    }

                    let rootfs = match self.solve(&container.rootfs, &container.platform).await {
                        Ok(handle) => handle,
                        Err(e) => {
                            self.release_leases(deps).await;
                            return Err(e);
                        }
                    };

                    let mut args = container.config.entrypoint.clone().unwrap_or_default();
                    args.extend(container.config.default_args.clone().unwrap_or_default());
                    let hostname = service_hostname(id);
                    let spec = ServiceStartSpec {
                        container: id.clone(),
                        hostname: hostname.clone(),
                        ports: container.config.exposed_ports.clone(),
                        rootfs,
                        args,
                        env: container.config.env.clone(),
                        platform: container.platform.clone(),
                    };

                    let started = self
                        .with_cancel(async {
                            tokio::time::timeout(
                                SERVICE_START_TIMEOUT,
                                self.backend.start_service(spec),
                            )
                            .await
                            .map_err(|_| Error::ServiceStartFailed {
                                hostname: hostname.clone(),
                                reason: format!("timed out after {SERVICE_START_TIMEOUT:?}"),
                            })?
                        })
                        .await;

                    match started {
                        Ok(running) => Ok((running, deps)),
                        Err(e) => {
                            self.release_leases(deps).await;
                            Err(e)
                        }
                    }
                })
                .await
        })
    }

    async fn lease_all(&self, bindings: &[ServiceBinding]) -> Result<Vec<ServiceLease>> {
        let mut leases = Vec::new();
        for binding in bindings {
            match self.lease_service(&binding.service).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    self.release_leases(leases).await;
                    return Err(e);
                }
            }
        }
        Ok(leases)
    }

    async fn release_leases(&self, leases: Vec<ServiceLease>) {
        for lease in leases {
            if let Err(e) = self.services.release(lease).await {
                warn!(error = %e, "failed to release service lease");
            }
        }
    }

    // =========================================================================
    // Artifact Reads
    // =========================================================================

    /// Associates service bindings with an artifact ID, so reads of the
    /// artifact hold the services live (the side-table from the design
    /// notes; bindings never live on artifact values themselves).
    pub(crate) fn bind_artifact_services(&self, key: &str, services: &[ServiceBinding]) {
        if services.is_empty() {
            return;
        }
        let mut table = self
            .artifact_services
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        table.insert(key.to_string(), services.to_vec());
    }

    fn artifact_bindings(&self, key: &str) -> Vec<ServiceBinding> {
        let table = self
            .artifact_services
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        table.get(key).cloned().unwrap_or_default()
    }

    /// Lists the entries of a directory value, sorted ascending.
    pub(crate) async fn read_directory(&self, dir: &Directory) -> Result<Vec<String>> {
        let bindings = self.artifact_bindings(dir.id()?.as_str());
        let leases = self.lease_all(&bindings).await?;
        let result = async {
            let handle = self.solve(&dir.origin, &dir.platform).await?;
            self.with_cancel(self.backend.read_dir(&handle, &dir.path)).await
        }
        .await;
        self.release_leases(leases).await;
        result
    }

    /// Reads the bytes of a file value.
    pub(crate) async fn read_file(&self, file: &File) -> Result<Vec<u8>> {
        let bindings = self.artifact_bindings(file.id()?.as_str());
        let leases = self.lease_all(&bindings).await?;
        let result = async {
            let handle = self.solve(&file.origin, &file.platform).await?;
            self.with_cancel(self.backend.read_file(&handle, &file.path)).await
        }
        .await;
        self.release_leases(leases).await;
        result
    }

    /// Reads a captured output stream.
    pub(crate) async fn read_stream(&self, stream: &StreamHandle) -> Result<Vec<u8>> {
        self.with_cancel(self.backend.read_stream(stream)).await
    }
}
