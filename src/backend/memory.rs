//! # In-Process Build Backend
//!
//! A complete [`BuildBackend`] over in-memory filesystem trees. Images are
//! registered up front, processes run as scripted command handlers, cache
//! volumes honor their sharing modes, and exports write real OCI-layout
//! tarballs. The engine's whole contract (solve, exec, services, publish,
//! export) is observable against this backend without touching a daemon.
//!
//! ## Scripted commands
//!
//! A handler is a sync closure keyed by program name. It receives an
//! [`ExecContext`] with the working rootfs, materialized mounts, env (secret
//! envs already resolved), and live service addresses, and returns the
//! process outcome. `echo` and `true` are built in; anything else must be
//! registered. An unknown program fails with `ExecStartFailed`, which is
//! exactly the backend-cannot-start-process contract.
//!
//! ## Cache volume semantics
//!
//! - `SHARED`: the volume tree is copied in at exec start and written back
//!   at the end; sequential consumers observe each other's writes.
//! - `PRIVATE`: a fresh instance per exec, discarded afterwards.
//! - `LOCKED`: the volume's lock is held for the whole exec, serializing
//!   consumers. Locks are acquired in volume-key order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::{Secret, Socket};
use crate::backend::{
    BuildBackend, DirectoryHandle, ExecMount, ExecOutcome, ExecSpec, PulledImage,
    RegistryCredential, RunningService, ServiceAddr, ServiceStartSpec, StreamHandle,
};
use crate::constants::{
    OCI_IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_LAYER_MEDIA_TYPE_GZIP, OCI_LAYOUT_VERSION,
};
use crate::container::config::{ExposedPort, ImageConfig};
use crate::container::mount::CacheSharingMode;
use crate::error::{Error, Result};
use crate::ident::SecretId;
use crate::opgraph::{LoweredDag, LoweredExec, LoweredMount, LoweredOp};
use crate::platform::Platform;
use crate::publish::ImageAssembly;

// =============================================================================
// In-Memory Trees
// =============================================================================

/// A node of an in-memory filesystem tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemNode {
    File { data: Vec<u8>, mode: u32 },
    Dir { entries: BTreeMap<String, MemNode>, mode: u32 },
}

impl MemNode {
    /// An empty directory with mode 0755.
    pub fn dir() -> Self {
        MemNode::Dir {
            entries: BTreeMap::new(),
            mode: 0o755,
        }
    }

    /// A file node.
    pub fn file(data: impl Into<Vec<u8>>, mode: u32) -> Self {
        MemNode::File {
            data: data.into(),
            mode,
        }
    }

    /// Builder-style file insertion, for test image trees.
    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        let _ = self.insert(path, MemNode::file(data, 0o644));
        self
    }

    fn segments(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Looks up the node at a slash path ("/" returns self).
    pub fn get(&self, path: &str) -> Option<&MemNode> {
        let mut node = self;
        for segment in Self::segments(path) {
            match node {
                MemNode::Dir { entries, .. } => node = entries.get(segment)?,
                MemNode::File { .. } => return None,
            }
        }
        Some(node)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut MemNode> {
        let mut node = self;
        for segment in Self::segments(path) {
            match node {
                MemNode::Dir { entries, .. } => node = entries.get_mut(segment)?,
                MemNode::File { .. } => return None,
            }
        }
        Some(node)
    }

    /// Inserts `node` at `path`, creating parent directories with 0755.
    /// Replaces whatever was there. Fails if a parent component is a file.
    pub fn insert(&mut self, path: &str, node: MemNode) -> Result<()> {
        let segments = Self::segments(path);
        if segments.is_empty() {
            *self = node;
            return Ok(());
        }
        let mut current = self;
        for segment in &segments[..segments.len() - 1] {
            let entries = match current {
                MemNode::Dir { entries, .. } => entries,
                MemNode::File { .. } => {
                    return Err(Error::Internal(format!(
                        "path component '{segment}' is a file"
                    )));
                }
            };
            current = entries
                .entry(segment.to_string())
                .or_insert_with(MemNode::dir);
        }
        match current {
            MemNode::Dir { entries, .. } => {
                entries.insert(segments[segments.len() - 1].to_string(), node);
                Ok(())
            }
            MemNode::File { .. } => Err(Error::Internal(
                "parent path component is a file".to_string(),
            )),
        }
    }

    /// Merges `src` into this node: files replace, directories merge.
    fn merge_from(&mut self, src: &MemNode) {
        match (&mut *self, src) {
            (
                MemNode::Dir { entries, .. },
                MemNode::Dir {
                    entries: src_entries,
                    ..
                },
            ) => {
                for (name, child) in src_entries {
                    match entries.get_mut(name) {
                        Some(existing) if matches!(existing, MemNode::Dir { .. }) => {
                            existing.merge_from(child)
                        }
                        _ => {
                            entries.insert(name.clone(), child.clone());
                        }
                    }
                }
            }
            (slot, src) => *slot = src.clone(),
        }
    }

    /// Content digest of the tree (names, modes, data).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        hex::encode(hasher.finalize())
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            MemNode::File { data, mode } => {
                hasher.update(b"file");
                hasher.update(mode.to_be_bytes());
                hasher.update((data.len() as u64).to_be_bytes());
                hasher.update(data);
            }
            MemNode::Dir { entries, mode } => {
                hasher.update(b"dir");
                hasher.update(mode.to_be_bytes());
                for (name, child) in entries {
                    hasher.update((name.len() as u64).to_be_bytes());
                    hasher.update(name.as_bytes());
                    child.hash_into(hasher);
                }
            }
        }
    }
}

/// Minimal glob match: `*` matches any run (including `/`), `?` one char.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

fn matches_filters(rel: &str, include: &[String], exclude: &[String]) -> bool {
    let included = include.is_empty() || include.iter().any(|p| glob_match(p, rel));
    included && !exclude.iter().any(|p| glob_match(p, rel))
}

/// Applies include/exclude filters to a tree, relative-path based.
/// Exclude wins over include; directories are kept when any descendant is.
fn filter_tree(node: &MemNode, rel: &str, include: &[String], exclude: &[String]) -> Option<MemNode> {
    if !rel.is_empty() && exclude.iter().any(|p| glob_match(p, rel)) {
        return None;
    }
    match node {
        MemNode::File { .. } => {
            matches_filters(rel, include, exclude).then(|| node.clone())
        }
        MemNode::Dir { entries, mode } => {
            // A directory matching an include pattern brings its subtree.
            if !rel.is_empty() && !include.is_empty() && include.iter().any(|p| glob_match(p, rel))
            {
                return filter_tree(node, rel, &[], exclude);
            }
            let kept: BTreeMap<String, MemNode> = entries
                .iter()
                .filter_map(|(name, child)| {
                    let child_rel = if rel.is_empty() {
                        name.clone()
                    } else {
                        format!("{rel}/{name}")
                    };
                    filter_tree(child, &child_rel, include, exclude)
                        .map(|filtered| (name.clone(), filtered))
                })
                .collect();
            if rel.is_empty() || !kept.is_empty() || include.is_empty() {
                Some(MemNode::Dir {
                    entries: kept,
                    mode: *mode,
                })
            } else {
                None
            }
        }
    }
}

// =============================================================================
// Scripted Commands
// =============================================================================

/// Outcome returned by a command handler.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// A zero-exit outcome with the given stdout.
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// A non-zero outcome with the given stderr.
    pub fn failure(exit_code: i64, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }
}

/// A scripted command implementation.
pub type CommandHandler = Arc<dyn Fn(&mut ExecContext) -> CommandOutput + Send + Sync>;

/// A scripted Dockerfile frontend.
pub type BuildHandler = Arc<dyn Fn(&BuildRequest) -> Result<MemNode> + Send + Sync>;

/// Inputs handed to a [`BuildHandler`].
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context: MemNode,
    pub dockerfile: String,
    pub build_args: Vec<(String, String)>,
    pub target: Option<String>,
    pub platform: Platform,
}

enum MountView {
    /// Directory-like mount: dir mounts, tmpfs, cache instances. Writes
    /// land here and are excised from the committed rootfs.
    Tree(MemNode),
    /// Single-file read-only views: file mounts and secrets.
    FileView { data: Vec<u8> },
    Socket,
}

struct MaterializedMount {
    path: String,
    view: MountView,
}

/// The world a scripted command runs in.
///
/// Reads and writes resolve through the mount table first (deepest mount
/// wins), then fall through to the working rootfs, mirroring the overlay
/// the real runtime would assemble.
pub struct ExecContext {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub workdir: String,
    services: Vec<ServiceAddr>,
    running_hostnames: HashSet<String>,
    rootfs: MemNode,
    mounts: Vec<MaterializedMount>,
}

impl ExecContext {
    /// Environment lookup.
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn mount_index(&self, path: &str) -> Option<usize> {
        self.mounts
            .iter()
            .enumerate()
            .filter(|(_, m)| crate::pathutil::is_under(&m.path, path))
            .max_by_key(|(_, m)| m.path.len())
            .map(|(idx, _)| idx)
    }

    /// Reads a file through mounts, then the rootfs.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        if let Some(idx) = self.mount_index(path) {
            let mount = &self.mounts[idx];
            let rest = path.strip_prefix(mount.path.as_str()).unwrap_or("");
            return match &mount.view {
                MountView::Tree(tree) => match tree.get(rest) {
                    Some(MemNode::File { data, .. }) => Some(data.clone()),
                    _ => None,
                },
                MountView::FileView { data } if rest.is_empty() => Some(data.clone()),
                _ => None,
            };
        }
        match self.rootfs.get(path) {
            Some(MemNode::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Writes a file through mounts, then the rootfs. Returns false for
    /// unwritable targets (secrets, sockets, file mounts).
    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> bool {
        let node = MemNode::file(data, 0o644);
        if let Some(idx) = self.mount_index(path) {
            let mount = &mut self.mounts[idx];
            let rest = path
                .strip_prefix(mount.path.as_str())
                .unwrap_or("")
                .to_string();
            return match &mut mount.view {
                MountView::Tree(tree) => tree.insert(&rest, node).is_ok(),
                MountView::FileView { .. } | MountView::Socket => false,
            };
        }
        self.rootfs.insert(path, node).is_ok()
    }

    /// The service bound at `alias`, if any.
    pub fn service(&self, alias: &str) -> Option<&ServiceAddr> {
        self.services.iter().find(|s| s.alias == alias)
    }

    /// True when the alias resolves to a running service exposing `port`.
    pub fn service_reachable(&self, alias: &str, port: u16) -> bool {
        self.service(alias).is_some_and(|addr| {
            self.running_hostnames.contains(&addr.hostname)
                && addr.ports.iter().any(|p| p.port == port)
        })
    }
}

// =============================================================================
// Backend State
// =============================================================================

struct RegisteredImage {
    tree: MemNode,
    config: ImageConfig,
    resolved_ref: String,
}

struct ServiceState {
    hostname: String,
    ports: Vec<ExposedPort>,
}

/// One manifest of a published index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedManifest {
    pub platform: String,
    pub digest: String,
}

/// A published image index, as recorded by [`MemoryBackend::push`].
#[derive(Debug, Clone)]
pub struct PublishedIndex {
    pub digest: String,
    pub manifests: Vec<PublishedManifest>,
}

/// The in-process reference backend.
pub struct MemoryBackend {
    trees: StdMutex<HashMap<String, MemNode>>,
    streams: StdMutex<HashMap<String, Vec<u8>>>,
    /// Registered images, keyed by `reference|platform`.
    images: StdMutex<HashMap<String, Arc<RegisteredImage>>>,
    /// Solve results by node digest.
    node_cache: StdMutex<HashMap<String, DirectoryHandle>>,
    volumes: StdMutex<HashMap<String, Arc<TokioMutex<MemNode>>>>,
    secrets: StdMutex<HashMap<String, Vec<u8>>>,
    sockets: StdMutex<HashSet<String>>,
    handlers: StdMutex<HashMap<String, CommandHandler>>,
    build_handler: StdMutex<Option<BuildHandler>>,
    services: StdMutex<HashMap<String, ServiceState>>,
    running_hostnames: StdMutex<HashSet<String>>,
    published: StdMutex<HashMap<String, PublishedIndex>>,
    auth_required: StdMutex<HashSet<String>>,
    started_log: StdMutex<Vec<String>>,
    solve_calls: AtomicU64,
    next_handle: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            trees: StdMutex::new(HashMap::new()),
            streams: StdMutex::new(HashMap::new()),
            images: StdMutex::new(HashMap::new()),
            node_cache: StdMutex::new(HashMap::new()),
            volumes: StdMutex::new(HashMap::new()),
            secrets: StdMutex::new(HashMap::new()),
            sockets: StdMutex::new(HashSet::new()),
            handlers: StdMutex::new(HashMap::new()),
            build_handler: StdMutex::new(None),
            services: StdMutex::new(HashMap::new()),
            running_hostnames: StdMutex::new(HashSet::new()),
            published: StdMutex::new(HashMap::new()),
            auth_required: StdMutex::new(HashSet::new()),
            started_log: StdMutex::new(Vec::new()),
            solve_calls: AtomicU64::new(0),
            next_handle: AtomicU64::new(0),
        }
    }

    fn lock<'a, T>(mutex: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alloc_handle(&self, prefix: &str) -> String {
        let n = self.next_handle.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}-{}", uuid::Uuid::now_v7().simple())
    }

    fn store_tree(&self, tree: MemNode) -> DirectoryHandle {
        let handle = self.alloc_handle("tree");
        Self::lock(&self.trees).insert(handle.clone(), tree);
        DirectoryHandle(handle)
    }

    fn tree(&self, handle: &DirectoryHandle) -> Result<MemNode> {
        Self::lock(&self.trees)
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown tree handle {}", handle.0)))
    }

    /// Snapshot of a solved tree, for test assertions.
    pub fn tree_of(&self, handle: &DirectoryHandle) -> Option<MemNode> {
        Self::lock(&self.trees).get(&handle.0).cloned()
    }

    // -------------------------------------------------------------------------
    // Registration Surface
    // -------------------------------------------------------------------------

    /// Registers an image the backend will serve for `reference` at
    /// `platform`. Returns the digest-pinned reference it will resolve to.
    pub fn register_image(
        &self,
        reference: &str,
        platform: &Platform,
        config: ImageConfig,
        tree: MemNode,
    ) -> Result<String> {
        let parsed: oci_distribution::Reference =
            reference.parse().map_err(|e| Error::PullFailed {
                reference: reference.to_string(),
                reason: format!("{e}"),
            })?;
        let digest = tree.digest();
        let resolved_ref = format!(
            "{}/{}@sha256:{digest}",
            parsed.registry(),
            parsed.repository()
        );

        let image = Arc::new(RegisteredImage {
            tree,
            config,
            resolved_ref: resolved_ref.clone(),
        });
        let mut images = Self::lock(&self.images);
        images.insert(format!("{reference}|{platform}"), image.clone());
        images.insert(format!("{resolved_ref}|{platform}"), image);
        Ok(resolved_ref)
    }

    /// Registers a scripted command under a program name.
    pub fn register_command<F>(&self, program: &str, handler: F)
    where
        F: Fn(&mut ExecContext) -> CommandOutput + Send + Sync + 'static,
    {
        Self::lock(&self.handlers).insert(program.to_string(), Arc::new(handler));
    }

    /// Installs the scripted Dockerfile frontend.
    pub fn set_build_handler<F>(&self, handler: F)
    where
        F: Fn(&BuildRequest) -> Result<MemNode> + Send + Sync + 'static,
    {
        *Self::lock(&self.build_handler) = Some(Arc::new(handler));
    }

    /// Makes pushes to `registry` fail unless a credential is supplied.
    pub fn require_auth(&self, registry: &str) {
        Self::lock(&self.auth_required).insert(registry.to_string());
    }

    /// The index recorded by the most recent push to `address`.
    pub fn published(&self, address: &str) -> Option<PublishedIndex> {
        Self::lock(&self.published).get(address).cloned()
    }

    /// True while a service instance with this hostname is running.
    pub fn service_running(&self, hostname: &str) -> bool {
        Self::lock(&self.running_hostnames).contains(hostname)
    }

    /// How many instances were ever started for this hostname.
    pub fn service_start_count(&self, hostname: &str) -> usize {
        Self::lock(&self.started_log)
            .iter()
            .filter(|h| h.as_str() == hostname)
            .count()
    }

    /// Total number of backend solve submissions (the engine's single-flight
    /// table makes repeats of an already-solved graph invisible here).
    pub fn solve_calls(&self) -> u64 {
        self.solve_calls.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Exec Core
    // -------------------------------------------------------------------------

    fn secret_plaintext(&self, id: &SecretId) -> Result<Vec<u8>> {
        Self::lock(&self.secrets)
            .get(&id.digest())
            .cloned()
            .ok_or_else(|| Error::invalid_id("secret", "secret not registered with backend"))
    }

    fn volume(&self, key: &str, seed: Option<&MemNode>) -> Arc<TokioMutex<MemNode>> {
        let mut volumes = Self::lock(&self.volumes);
        volumes
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(TokioMutex::new(seed.cloned().unwrap_or_else(MemNode::dir)))
            })
            .clone()
    }

    /// Runs a scripted command against a rootfs and resolved mounts.
    ///
    /// Returns the post-exec rootfs (mount writes excised) and the output.
    async fn exec_inner(
        &self,
        rootfs: MemNode,
        args: &[String],
        env: &[(String, String)],
        secret_env: &[(String, SecretId)],
        mounts: Vec<ResolvedMount>,
        workdir: Option<&str>,
        stdin: Option<&[u8]>,
        redirect_stdout: Option<&str>,
        redirect_stderr: Option<&str>,
        services: Vec<ServiceAddr>,
    ) -> Result<(MemNode, CommandOutput)> {
        let program = args.first().ok_or(Error::NoCommand)?.clone();

        // Overlay secret envs onto plain env, preserving order.
        let mut env: Vec<(String, String)> = env.to_vec();
        for (name, id) in secret_env {
            let plaintext = self.secret_plaintext(id)?;
            let value = String::from_utf8_lossy(&plaintext).into_owned();
            match env.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1 = value,
                None => env.push((name.clone(), value)),
            }
        }

        // Acquire cache volumes in volume-key order so concurrent LOCKED
        // consumers cannot deadlock.
        let mut cache_order: Vec<usize> = mounts
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m.kind, ResolvedKind::Cache { .. }))
            .map(|(idx, _)| idx)
            .collect();
        cache_order.sort_by(|&a, &b| {
            let key = |idx: usize| match &mounts[idx].kind {
                ResolvedKind::Cache { volume, .. } => volume.clone(),
                _ => String::new(),
            };
            key(a).cmp(&key(b))
        });

        let mut cache_trees: HashMap<usize, MemNode> = HashMap::new();
        let mut writebacks: Vec<(usize, CacheWriteback)> = Vec::new();
        for idx in cache_order {
            let ResolvedKind::Cache {
                volume,
                seed,
                sharing,
            } = &mounts[idx].kind
            else {
                continue;
            };
            match sharing {
                CacheSharingMode::Private => {
                    cache_trees.insert(idx, seed.clone().unwrap_or_else(MemNode::dir));
                }
                CacheSharingMode::Shared => {
                    let vol = self.volume(volume, seed.as_ref());
                    let tree = vol.lock().await.clone();
                    cache_trees.insert(idx, tree);
                    writebacks.push((idx, CacheWriteback::Shared(vol)));
                }
                CacheSharingMode::Locked => {
                    let vol = self.volume(volume, seed.as_ref());
                    let guard = vol.lock_owned().await;
                    cache_trees.insert(idx, guard.clone());
                    writebacks.push((idx, CacheWriteback::Locked(guard)));
                }
            }
        }

        let materialized: Vec<MaterializedMount> = mounts
            .into_iter()
            .enumerate()
            .map(|(idx, mount)| {
                let view = match mount.kind {
                    ResolvedKind::Tree(tree) => MountView::Tree(tree),
                    ResolvedKind::Temp => MountView::Tree(MemNode::dir()),
                    ResolvedKind::Cache { .. } => MountView::Tree(
                        cache_trees.remove(&idx).unwrap_or_else(MemNode::dir),
                    ),
                    ResolvedKind::FileView { data } => MountView::FileView { data },
                    ResolvedKind::Socket => MountView::Socket,
                };
                MaterializedMount {
                    path: mount.path,
                    view,
                }
            })
            .collect();

        let mut ctx = ExecContext {
            args: args.to_vec(),
            env,
            stdin: stdin.map(|b| b.to_vec()),
            workdir: workdir.unwrap_or("/").to_string(),
            services,
            running_hostnames: Self::lock(&self.running_hostnames).clone(),
            rootfs,
            mounts: materialized,
        };

        // Take an Arc to the handler so the registry lock is not held while
        // the (possibly slow) handler runs.
        let handler = {
            let handlers = Self::lock(&self.handlers);
            handlers
                .get(&program)
                .or_else(|| {
                    program
                        .rsplit('/')
                        .next()
                        .and_then(|base| handlers.get(base))
                })
                .cloned()
        };
        let output = match handler {
            Some(handler) => handler(&mut ctx),
            None => match program.rsplit('/').next().unwrap_or(&program) {
                "echo" => CommandOutput::success(format!("{}\n", ctx.args[1..].join(" "))),
                "true" => CommandOutput::success(Vec::new()),
                _ => {
                    return Err(Error::ExecStartFailed {
                        command: program,
                        reason: "no such command registered with backend".to_string(),
                    });
                }
            },
        };

        // Persist cache volume state.
        for (idx, writeback) in writebacks {
            let tree = match &ctx.mounts[idx].view {
                MountView::Tree(tree) => tree.clone(),
                _ => continue,
            };
            match writeback {
                CacheWriteback::Shared(vol) => *vol.lock().await = tree,
                CacheWriteback::Locked(mut guard) => *guard = tree,
            }
        }

        // Redirects land in the committed rootfs.
        let mut rootfs = ctx.rootfs;
        if let Some(path) = redirect_stdout {
            rootfs.insert(path, MemNode::file(output.stdout.clone(), 0o644))?;
        }
        if let Some(path) = redirect_stderr {
            rootfs.insert(path, MemNode::file(output.stderr.clone(), 0o644))?;
        }

        Ok((rootfs, output))
    }
}

enum CacheWriteback {
    Shared(Arc<TokioMutex<MemNode>>),
    Locked(OwnedMutexGuard<MemNode>),
}

struct ResolvedMount {
    path: String,
    kind: ResolvedKind,
}

enum ResolvedKind {
    Tree(MemNode),
    Temp,
    Cache {
        volume: String,
        seed: Option<MemNode>,
        sharing: CacheSharingMode,
    },
    FileView {
        data: Vec<u8>,
    },
    Socket,
}

impl MemoryBackend {
    fn resolve_exec_mount(&self, mount: &ExecMount) -> Result<ResolvedMount> {
        let resolved = match mount {
            ExecMount::Directory {
                path,
                source,
                source_path,
            } => {
                let tree = self.tree(source)?;
                let node = tree.get(source_path).cloned().unwrap_or_else(MemNode::dir);
                ResolvedMount {
                    path: path.clone(),
                    kind: ResolvedKind::Tree(node),
                }
            }
            ExecMount::File {
                path,
                source,
                source_path,
            } => {
                let tree = self.tree(source)?;
                let data = match tree.get(source_path) {
                    Some(MemNode::File { data, .. }) => data.clone(),
                    _ => {
                        return Err(Error::ExecStartFailed {
                            command: String::new(),
                            reason: format!("file mount source {source_path} not found"),
                        });
                    }
                };
                ResolvedMount {
                    path: path.clone(),
                    kind: ResolvedKind::FileView { data },
                }
            }
            ExecMount::Temp { path } => ResolvedMount {
                path: path.clone(),
                kind: ResolvedKind::Temp,
            },
            ExecMount::Cache {
                path,
                volume,
                base,
                sharing,
            } => {
                let seed = match base {
                    Some((handle, base_path)) => {
                        let tree = self.tree(handle)?;
                        Some(tree.get(base_path).cloned().unwrap_or_else(MemNode::dir))
                    }
                    None => None,
                };
                ResolvedMount {
                    path: path.clone(),
                    kind: ResolvedKind::Cache {
                        volume: volume.clone(),
                        seed,
                        sharing: *sharing,
                    },
                }
            }
            ExecMount::Secret { path, id } => ResolvedMount {
                path: path.clone(),
                kind: ResolvedKind::FileView {
                    data: self.secret_plaintext(id)?,
                },
            },
            ExecMount::Socket { path, id } => {
                if !Self::lock(&self.sockets).contains(&id.digest()) {
                    return Err(Error::ExecStartFailed {
                        command: String::new(),
                        reason: "socket not registered with backend".to_string(),
                    });
                }
                ResolvedMount {
                    path: path.clone(),
                    kind: ResolvedKind::Socket,
                }
            }
        };
        Ok(resolved)
    }

    fn resolve_lowered_mount(
        &self,
        mount: &LoweredMount,
        solved: &[DirectoryHandle],
    ) -> Result<ResolvedMount> {
        let as_exec = match mount {
            LoweredMount::Directory {
                path,
                source,
                source_path,
            } => ExecMount::Directory {
                path: path.clone(),
                source: solved[*source].clone(),
                source_path: source_path.clone(),
            },
            LoweredMount::File {
                path,
                source,
                source_path,
            } => ExecMount::File {
                path: path.clone(),
                source: solved[*source].clone(),
                source_path: source_path.clone(),
            },
            LoweredMount::Temp { path } => ExecMount::Temp { path: path.clone() },
            LoweredMount::Cache {
                path,
                volume,
                base,
                sharing,
            } => ExecMount::Cache {
                path: path.clone(),
                volume: volume.clone(),
                base: base
                    .as_ref()
                    .map(|(idx, base_path)| (solved[*idx].clone(), base_path.clone())),
                sharing: *sharing,
            },
            LoweredMount::Secret { path, id } => ExecMount::Secret {
                path: path.clone(),
                id: id.clone(),
            },
            LoweredMount::Socket { path, id } => ExecMount::Socket {
                path: path.clone(),
                id: id.clone(),
            },
        };
        self.resolve_exec_mount(&as_exec)
    }

    async fn solve_exec_node(
        &self,
        base: &DirectoryHandle,
        exec: &LoweredExec,
        solved: &[DirectoryHandle],
    ) -> Result<MemNode> {
        let rootfs = self.tree(base)?;
        let mounts: Vec<ResolvedMount> = exec
            .mounts
            .iter()
            .map(|m| self.resolve_lowered_mount(m, solved))
            .collect::<Result<_>>()?;

        // Service addresses come from the live registry; execs replayed
        // outside an engine-driven evaluation see services only if they
        // are still running.
        let services: Vec<ServiceAddr> = exec
            .services
            .iter()
            .map(|s| {
                let ports = Self::lock(&self.services)
                    .values()
                    .find(|state| state.hostname == s.hostname)
                    .map(|state| state.ports.clone())
                    .unwrap_or_default();
                ServiceAddr {
                    alias: s.alias.clone(),
                    hostname: s.hostname.clone(),
                    ports,
                }
            })
            .collect();

        let (post_rootfs, _output) = self
            .exec_inner(
                rootfs,
                &exec.args,
                &exec.env,
                &exec.secret_env,
                mounts,
                exec.workdir.as_deref(),
                exec.stdin.as_deref(),
                exec.redirect_stdout.as_deref(),
                exec.redirect_stderr.as_deref(),
                services,
            )
            .await?;
        Ok(post_rootfs)
    }
}

// =============================================================================
// BuildBackend Implementation
// =============================================================================

#[async_trait]
impl BuildBackend for MemoryBackend {
    async fn solve(
        &self,
        dag: &LoweredDag,
        cancel: &CancellationToken,
    ) -> Result<DirectoryHandle> {
        self.solve_calls.fetch_add(1, Ordering::Relaxed);
        let mut solved: Vec<DirectoryHandle> = Vec::with_capacity(dag.nodes.len());

        for node in &dag.nodes {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(handle) = Self::lock(&self.node_cache).get(&node.digest) {
                solved.push(handle.clone());
                continue;
            }

            let tree = match &node.op {
                LoweredOp::Scratch => MemNode::dir(),
                LoweredOp::Pull { reference } => {
                    let key = format!("{reference}|{}", node.platform);
                    let image = Self::lock(&self.images).get(&key).cloned().ok_or_else(|| {
                        Error::PullFailed {
                            reference: reference.clone(),
                            reason: format!("no image registered for platform {}", node.platform),
                        }
                    })?;
                    image.tree.clone()
                }
                LoweredOp::DockerfileBuild {
                    context,
                    context_path,
                    dockerfile,
                    build_args,
                    target,
                } => {
                    let context_tree = self.tree(&solved[*context])?;
                    let context_tree = context_tree
                        .get(context_path)
                        .cloned()
                        .unwrap_or_else(MemNode::dir);
                    let request = BuildRequest {
                        context: context_tree,
                        dockerfile: dockerfile.clone(),
                        build_args: build_args.clone(),
                        target: target.clone(),
                        platform: node.platform.clone(),
                    };
                    let handler = Self::lock(&self.build_handler).clone();
                    match handler {
                        Some(build) => build(&request)?,
                        None => {
                            return Err(Error::BuildFailed(
                                "no Dockerfile frontend registered with backend".to_string(),
                            ));
                        }
                    }
                }
                LoweredOp::Copy {
                    base,
                    source,
                    source_path,
                    dest_path,
                    include,
                    exclude,
                    permissions,
                } => {
                    let mut tree = self.tree(&solved[*base])?;
                    let source_tree = self.tree(&solved[*source])?;
                    let node_at = source_tree.get(source_path).ok_or_else(|| {
                        Error::SolveFailed {
                            digest: node.digest.clone(),
                            reason: format!("copy source {source_path} not found"),
                        }
                    })?;
                    match node_at {
                        MemNode::Dir { .. } => {
                            let filtered = filter_tree(node_at, "", include, exclude)
                                .unwrap_or_else(MemNode::dir);
                            match tree.get_mut(dest_path) {
                                Some(existing @ MemNode::Dir { .. }) => {
                                    existing.merge_from(&filtered)
                                }
                                _ => tree.insert(dest_path, filtered)?,
                            }
                        }
                        MemNode::File { data, mode } => {
                            let mode = permissions.unwrap_or(*mode);
                            tree.insert(dest_path, MemNode::file(data.clone(), mode))?;
                        }
                    }
                    tree
                }
                LoweredOp::Mkfile {
                    base,
                    path,
                    contents,
                    permissions,
                } => {
                    let mut tree = self.tree(&solved[*base])?;
                    tree.insert(path, MemNode::file(contents.clone(), *permissions))?;
                    tree
                }
                LoweredOp::Mkdir {
                    base,
                    path,
                    permissions,
                } => {
                    let mut tree = self.tree(&solved[*base])?;
                    tree.insert(
                        path,
                        MemNode::Dir {
                            entries: BTreeMap::new(),
                            mode: *permissions,
                        },
                    )?;
                    tree
                }
                LoweredOp::Exec { base, exec } => {
                    self.solve_exec_node(&solved[*base], exec, &solved).await?
                }
                LoweredOp::Overlay { base, layers } => {
                    let mut tree = self.tree(&solved[*base])?;
                    for (at, source, source_path) in layers {
                        let source_tree = self.tree(&solved[*source])?;
                        if let Some(layer) = source_tree.get(source_path) {
                            match (tree.get_mut(at), layer) {
                                (Some(existing @ MemNode::Dir { .. }), MemNode::Dir { .. }) => {
                                    existing.merge_from(layer)
                                }
                                _ => tree.insert(at, layer.clone())?,
                            }
                        }
                    }
                    tree
                }
            };

            let handle = self.store_tree(tree);
            Self::lock(&self.node_cache).insert(node.digest.clone(), handle.clone());
            solved.push(handle);
        }

        debug!(nodes = dag.nodes.len(), "solved op graph");
        Ok(solved[dag.root].clone())
    }

    async fn run(&self, spec: ExecSpec, cancel: &CancellationToken) -> Result<ExecOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rootfs = self.tree(&spec.rootfs)?;
        let mounts: Vec<ResolvedMount> = spec
            .mounts
            .iter()
            .map(|m| self.resolve_exec_mount(m))
            .collect::<Result<_>>()?;

        let (post_rootfs, output) = self
            .exec_inner(
                rootfs,
                &spec.args,
                &spec.env,
                &spec.secret_env,
                mounts,
                spec.workdir.as_deref(),
                spec.stdin.as_deref(),
                spec.redirect_stdout.as_deref(),
                spec.redirect_stderr.as_deref(),
                spec.services.clone(),
            )
            .await?;

        let post_handle = self.store_tree(post_rootfs);
        Self::lock(&self.node_cache).insert(spec.node_digest.clone(), post_handle.clone());

        let stdout_handle = self.alloc_handle("stream");
        let stderr_handle = self.alloc_handle("stream");
        {
            let mut streams = Self::lock(&self.streams);
            streams.insert(stdout_handle.clone(), output.stdout);
            streams.insert(stderr_handle.clone(), output.stderr);
        }

        Ok(ExecOutcome {
            exit_code: output.exit_code,
            stdout: StreamHandle(stdout_handle),
            stderr: StreamHandle(stderr_handle),
            post_rootfs: post_handle,
        })
    }

    async fn pull(&self, reference: &str, platform: &Platform) -> Result<PulledImage> {
        let key = format!("{reference}|{platform}");
        let image = Self::lock(&self.images)
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::PullFailed {
                reference: reference.to_string(),
                reason: format!("no image registered for platform {platform}"),
            })?;

        info!(reference, %platform, "pulled registered image");
        Ok(PulledImage {
            rootfs: self.store_tree(image.tree.clone()),
            resolved_ref: image.resolved_ref.clone(),
            config: image.config.clone(),
        })
    }

    async fn read_file(&self, dir: &DirectoryHandle, path: &str) -> Result<Vec<u8>> {
        let tree = self.tree(dir)?;
        match tree.get(path) {
            Some(MemNode::File { data, .. }) => Ok(data.clone()),
            Some(MemNode::Dir { .. }) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            ))),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path} not found"),
            ))),
        }
    }

    async fn read_dir(&self, dir: &DirectoryHandle, path: &str) -> Result<Vec<String>> {
        let tree = self.tree(dir)?;
        match tree.get(path) {
            Some(MemNode::Dir { entries, .. }) => Ok(entries.keys().cloned().collect()),
            Some(MemNode::File { .. }) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{path} is a file"),
            ))),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path} not found"),
            ))),
        }
    }

    async fn read_stream(&self, stream: &StreamHandle) -> Result<Vec<u8>> {
        Self::lock(&self.streams)
            .get(&stream.0)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown stream handle {}", stream.0)))
    }

    async fn push(
        &self,
        images: &[ImageAssembly],
        address: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<String> {
        let reference: oci_distribution::Reference =
            address.parse().map_err(|e| Error::PublishFailed {
                address: address.to_string(),
                reason: format!("{e}"),
            })?;

        if Self::lock(&self.auth_required).contains(reference.registry()) {
            let authorized = match credential {
                Some(cred) => Self::lock(&self.secrets).contains_key(&cred.secret.digest()),
                None => false,
            };
            if !authorized {
                return Err(Error::PublishFailed {
                    address: address.to_string(),
                    reason: format!("registry {} requires credentials", reference.registry()),
                });
            }
        }

        let manifests: Vec<PublishedManifest> = images
            .iter()
            .map(|image| {
                let tree = self.tree(&image.rootfs)?;
                let config_json = serde_json::to_vec(&image.config)?;
                let mut hasher = Sha256::new();
                hasher.update(&config_json);
                hasher.update(tree.digest().as_bytes());
                Ok(PublishedManifest {
                    platform: image.platform.to_string(),
                    digest: format!("sha256:{}", hex::encode(hasher.finalize())),
                })
            })
            .collect::<Result<_>>()?;

        let index_json = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX_MEDIA_TYPE,
            "manifests": manifests
                .iter()
                .map(|m| serde_json::json!({ "digest": m.digest, "platform": m.platform }))
                .collect::<Vec<_>>(),
        }))?;
        let index_digest = format!("sha256:{}", hex::encode(Sha256::digest(&index_json)));

        Self::lock(&self.published).insert(
            address.to_string(),
            PublishedIndex {
                digest: index_digest.clone(),
                manifests,
            },
        );

        let name = format!("{}/{}", reference.registry(), reference.repository());
        info!(address, digest = %index_digest, images = images.len(), "pushed image index");
        Ok(format!("{name}@{index_digest}"))
    }

    async fn export_oci(&self, images: &[ImageAssembly], path: &Path) -> Result<()> {
        let map_io = |e: std::io::Error| Error::ExportFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let file = std::fs::File::create(path).map_err(map_io)?;
        let mut builder = tar::Builder::new(file);

        let mut append = |name: &str, data: &[u8]| -> Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).map_err(map_io)
        };

        let mut index_manifests = Vec::with_capacity(images.len());
        for image in images {
            let tree = self.tree(&image.rootfs)?;
            let layer = tree_to_tar_gz(&tree).map_err(map_io)?;
            let layer_digest = hex::encode(Sha256::digest(&layer));

            let config_json = serde_json::to_vec(&image.config)?;
            let config_digest = hex::encode(Sha256::digest(&config_json));

            let manifest_json = serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE,
                "config": {
                    "mediaType": OCI_IMAGE_CONFIG_MEDIA_TYPE,
                    "digest": format!("sha256:{config_digest}"),
                    "size": config_json.len(),
                },
                "layers": [{
                    "mediaType": OCI_LAYER_MEDIA_TYPE_GZIP,
                    "digest": format!("sha256:{layer_digest}"),
                    "size": layer.len(),
                }],
            }))?;
            let manifest_digest = hex::encode(Sha256::digest(&manifest_json));

            append(&format!("blobs/sha256/{layer_digest}"), &layer)?;
            append(&format!("blobs/sha256/{config_digest}"), &config_json)?;
            append(&format!("blobs/sha256/{manifest_digest}"), &manifest_json)?;

            index_manifests.push(serde_json::json!({
                "mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE,
                "digest": format!("sha256:{manifest_digest}"),
                "size": manifest_json.len(),
                "platform": {
                    "os": image.platform.os,
                    "architecture": image.platform.arch,
                    "variant": image.platform.variant,
                },
            }));
        }

        let index_json = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX_MEDIA_TYPE,
            "manifests": index_manifests,
        }))?;
        append("index.json", &index_json)?;
        append(
            "oci-layout",
            &serde_json::to_vec(
                &serde_json::json!({ "imageLayoutVersion": OCI_LAYOUT_VERSION }),
            )?,
        )?;

        builder
            .into_inner()
            .and_then(|mut f| std::io::Write::flush(&mut f))
            .map_err(map_io)?;
        info!(path = %path.display(), images = images.len(), "wrote OCI layout tarball");
        Ok(())
    }

    async fn start_service(&self, spec: ServiceStartSpec) -> Result<RunningService> {
        // Materializing the rootfs handle is the start-validity check; a
        // service with no command is fine here (scripted backends do not
        // actually run a server loop).
        self.tree(&spec.rootfs)?;

        let instance = self.alloc_handle("svc");
        Self::lock(&self.services).insert(
            instance.clone(),
            ServiceState {
                hostname: spec.hostname.clone(),
                ports: spec.ports.clone(),
            },
        );
        Self::lock(&self.running_hostnames).insert(spec.hostname.clone());
        Self::lock(&self.started_log).push(spec.hostname.clone());

        info!(hostname = %spec.hostname, "service instance started");
        Ok(RunningService {
            instance,
            hostname: spec.hostname,
        })
    }

    async fn stop_service(&self, service: &RunningService) -> Result<()> {
        Self::lock(&self.services).remove(&service.instance);
        let still_hosted = Self::lock(&self.services)
            .values()
            .any(|s| s.hostname == service.hostname);
        if !still_hosted {
            Self::lock(&self.running_hostnames).remove(&service.hostname);
        }
        info!(hostname = %service.hostname, "service instance stopped");
        Ok(())
    }

    async fn add_secret(&self, name: &str, plaintext: &[u8]) -> Result<Secret> {
        let secret = Secret::new(name)?;
        Self::lock(&self.secrets).insert(secret.id().digest(), plaintext.to_vec());
        Ok(secret)
    }

    async fn add_socket(&self, host_path: &str) -> Result<Socket> {
        let socket = Socket::new(host_path)?;
        Self::lock(&self.sockets).insert(socket.id().digest());
        Ok(socket)
    }
}

/// Serializes a tree as a gzipped tarball (the OCI layer format).
fn tree_to_tar_gz(tree: &MemNode) -> std::io::Result<Vec<u8>> {
    fn append_node(
        builder: &mut tar::Builder<GzEncoder<Vec<u8>>>,
        node: &MemNode,
        path: &str,
    ) -> std::io::Result<()> {
        match node {
            MemNode::File { data, mode } => {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(*mode);
                header.set_entry_type(tar::EntryType::Regular);
                header.set_cksum();
                builder.append_data(&mut header, path, data.as_slice())?;
            }
            MemNode::Dir { entries, mode } => {
                if !path.is_empty() {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(0);
                    header.set_mode(*mode);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_cksum();
                    builder.append_data(&mut header, format!("{path}/"), std::io::empty())?;
                }
                for (name, child) in entries {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}/{name}")
                    };
                    append_node(builder, child, &child_path)?;
                }
            }
        }
        Ok(())
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_node(&mut builder, tree, "")?;
    builder.into_inner()?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_insert_and_get() {
        let mut root = MemNode::dir();
        root.insert("/etc/hosts", MemNode::file(b"localhost".to_vec(), 0o644))
            .unwrap();
        assert!(matches!(
            root.get("/etc/hosts"),
            Some(MemNode::File { .. })
        ));
        assert!(matches!(root.get("/etc"), Some(MemNode::Dir { .. })));
        assert!(root.get("/missing").is_none());
    }

    #[test]
    fn tree_digest_tracks_content() {
        let a = MemNode::dir().with_file("/a", b"1".to_vec());
        let b = MemNode::dir().with_file("/a", b"1".to_vec());
        let c = MemNode::dir().with_file("/a", b"2".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(glob_match("src/*", "src/lib.rs"));
        assert!(!glob_match("*.rs", "main.go"));
        assert!(glob_match("ma?n.rs", "main.rs"));
    }

    #[test]
    fn filter_applies_exclude_after_include() {
        let tree = MemNode::dir()
            .with_file("/keep.rs", b"k".to_vec())
            .with_file("/drop.rs", b"d".to_vec())
            .with_file("/other.txt", b"o".to_vec());
        let filtered = filter_tree(
            &tree,
            "",
            &["*.rs".to_string()],
            &["drop.rs".to_string()],
        )
        .unwrap();
        assert!(filtered.get("/keep.rs").is_some());
        assert!(filtered.get("/drop.rs").is_none());
        assert!(filtered.get("/other.txt").is_none());
    }

    #[test]
    fn merge_overwrites_files_and_merges_dirs() {
        let mut base = MemNode::dir()
            .with_file("/etc/hosts", b"old".to_vec())
            .with_file("/etc/motd", b"m".to_vec());
        let overlay = MemNode::dir().with_file("/etc/hosts", b"new".to_vec());
        base.merge_from(&overlay);
        assert_eq!(
            base.get("/etc/hosts"),
            Some(&MemNode::file(b"new".to_vec(), 0o644))
        );
        assert!(base.get("/etc/motd").is_some());
    }
}
