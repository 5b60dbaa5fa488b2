//! # BuildBackend Capability
//!
//! The core delegates all materialization to a backend: solving op DAGs into
//! filesystem trees, running processes, pulling images, pushing and exporting
//! assembled images, and hosting service instances. The backend owns the
//! content-addressed store; the core only ever holds opaque handles.
//!
//! The contract is deliberately narrow so the core stays testable against
//! the in-process [`MemoryBackend`](memory::MemoryBackend), which implements
//! the full capability over in-memory trees and scripted commands.

pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::container::config::{ExposedPort, ImageConfig};
use crate::container::mount::CacheSharingMode;
use crate::error::Result;
use crate::ident::{ContainerId, SecretId, SocketId};
use crate::opgraph::LoweredDag;
use crate::platform::Platform;
use crate::publish::ImageAssembly;

// =============================================================================
// Handles
// =============================================================================

/// Opaque backend handle to a materialized filesystem tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryHandle(pub(crate) String);

impl DirectoryHandle {
    /// The backend-issued key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque backend handle to a captured byte stream (stdout/stderr).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamHandle(pub(crate) String);

impl StreamHandle {
    /// The backend-issued key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Exec Specification
// =============================================================================

/// A fully-materialized process execution request.
///
/// Everything lazy has been resolved by the engine before this is built:
/// the rootfs and directory-mount sources are solved handles, service
/// bindings carry live hostnames, and secret envs are still IDs (plaintext
/// crosses only the backend's own secret channel).
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub rootfs: DirectoryHandle,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub secret_env: Vec<(String, SecretId)>,
    pub mounts: Vec<ExecMount>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub platform: Platform,
    pub stdin: Option<Vec<u8>>,
    pub redirect_stdout: Option<String>,
    pub redirect_stderr: Option<String>,
    pub privileged: bool,
    pub services: Vec<ServiceAddr>,
    /// Digest of the exec graph node this run materializes. The backend
    /// records the post-exec rootfs under this key so later solves of the
    /// same node hit its cache instead of re-running.
    pub node_digest: String,
}

/// A mount in materialized form, ordered by mount path.
#[derive(Debug, Clone)]
pub enum ExecMount {
    Directory {
        path: String,
        source: DirectoryHandle,
        source_path: String,
    },
    File {
        path: String,
        source: DirectoryHandle,
        source_path: String,
    },
    Temp {
        path: String,
    },
    Cache {
        path: String,
        /// Backend volume key (digest of the cache volume ID).
        volume: String,
        base: Option<(DirectoryHandle, String)>,
        sharing: CacheSharingMode,
    },
    Secret {
        path: String,
        id: SecretId,
    },
    Socket {
        path: String,
        id: SocketId,
    },
}

impl ExecMount {
    /// The mount's target path.
    pub fn path(&self) -> &str {
        match self {
            ExecMount::Directory { path, .. }
            | ExecMount::File { path, .. }
            | ExecMount::Temp { path }
            | ExecMount::Cache { path, .. }
            | ExecMount::Secret { path, .. }
            | ExecMount::Socket { path, .. } => path,
        }
    }
}

/// A live service binding visible to an exec: the alias the process uses
/// and the address it resolves to.
#[derive(Debug, Clone)]
pub struct ServiceAddr {
    pub alias: String,
    pub hostname: String,
    pub ports: Vec<ExposedPort>,
}

/// The result of a completed process run.
///
/// A non-zero exit code is data, not an error; only a failure to *start*
/// the process surfaces as [`Error::ExecStartFailed`](crate::Error).
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: StreamHandle,
    pub stderr: StreamHandle,
    pub post_rootfs: DirectoryHandle,
}

// =============================================================================
// Pull / Publish / Services
// =============================================================================

/// A successfully pulled base image.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub rootfs: DirectoryHandle,
    /// Fully-qualified, digest-pinned reference.
    pub resolved_ref: String,
    /// Image config carried by the manifest (env, entrypoint, ports, …).
    pub config: ImageConfig,
}

/// Registry credential selected for a publish, resolved by the backend.
#[derive(Debug, Clone)]
pub struct RegistryCredential {
    pub username: String,
    pub secret: SecretId,
}

/// Request to host a service container instance.
#[derive(Debug, Clone)]
pub struct ServiceStartSpec {
    pub container: ContainerId,
    pub hostname: String,
    pub ports: Vec<ExposedPort>,
    pub rootfs: DirectoryHandle,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub platform: Platform,
}

/// A running service instance, as issued by the backend.
#[derive(Debug, Clone)]
pub struct RunningService {
    /// Backend token identifying the instance, passed back on stop.
    pub instance: String,
    pub hostname: String,
}

// =============================================================================
// The Capability
// =============================================================================

/// The build backend capability consumed by the engine.
///
/// All methods are concurrency-safe; `solve` and `run` observe the provided
/// cancellation token and abort with [`Error::Cancelled`](crate::Error) when
/// it fires. `solve` handles every node kind, including `DockerfileBuild`
/// and cached `Exec` re-runs; `pull` exists separately so `from` can pin a
/// digest (and import the image config) at derivation time.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Solves a lowered DAG to the tree produced by its root node.
    async fn solve(&self, dag: &LoweredDag, cancel: &CancellationToken)
    -> Result<DirectoryHandle>;

    /// Runs a process and captures its outcome.
    async fn run(&self, spec: ExecSpec, cancel: &CancellationToken) -> Result<ExecOutcome>;

    /// Pulls (or resolves) an image, returning its rootfs, the digest-pinned
    /// reference, and the image config.
    async fn pull(&self, reference: &str, platform: &Platform) -> Result<PulledImage>;

    /// Reads a file out of a solved tree.
    async fn read_file(&self, dir: &DirectoryHandle, path: &str) -> Result<Vec<u8>>;

    /// Lists entry names at a path in a solved tree, sorted ascending.
    async fn read_dir(&self, dir: &DirectoryHandle, path: &str) -> Result<Vec<String>>;

    /// Reads a captured byte stream.
    async fn read_stream(&self, stream: &StreamHandle) -> Result<Vec<u8>>;

    /// Pushes assembled images (an image or a multi-platform index) to a
    /// registry address, returning the digest-pinned reference.
    async fn push(
        &self,
        images: &[ImageAssembly],
        address: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<String>;

    /// Writes assembled images as an OCI-layout tarball at a host path.
    async fn export_oci(&self, images: &[ImageAssembly], path: &Path) -> Result<()>;

    /// Starts a service container instance.
    async fn start_service(&self, spec: ServiceStartSpec) -> Result<RunningService>;

    /// Tears down a service instance previously started.
    async fn stop_service(&self, service: &RunningService) -> Result<()>;

    /// Registers a named secret, returning its opaque reference.
    async fn add_secret(&self, name: &str, plaintext: &[u8]) -> Result<crate::artifact::Secret>;

    /// Registers a host socket endpoint, returning its opaque reference.
    async fn add_socket(&self, host_path: &str) -> Result<crate::artifact::Socket>;
}
