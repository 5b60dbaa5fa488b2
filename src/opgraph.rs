//! # Rootfs Op Graph
//!
//! Every rootfs-affecting container operation appends an immutable node to a
//! DAG rooted at a scratch or pulled base. Nodes are shared structurally via
//! `Arc`, so deriving a container is O(1) regardless of history length.
//!
//! ## Determinism
//!
//! Two containers with structurally equal derivation histories must produce
//! byte-identical lowered DAGs and therefore equal solve keys. Three rules
//! keep that true:
//!
//! - node payloads contain only `Vec`s and scalars (no hash maps), so
//!   serialization order is fixed;
//! - exec mounts are stored sorted by path and service bindings sorted by
//!   alias, regardless of the order the caller declared them;
//! - node digests are SHA-256 over a canonical JSON view of the node in
//!   which each input edge is replaced by the input's digest.
//!
//! ## Lowering
//!
//! [`OpRef::lower`] flattens the graph into a [`LoweredDag`]: nodes in
//! topological order (inputs strictly before consumers), de-duplicated by
//! digest so identical sub-DAGs are submitted to the backend exactly once,
//! and tagged with the platform of the container they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::container::mount::{CacheSharingMode, Mount, MountKind};
use crate::container::ServiceBinding;
use crate::ident::{ContainerId, SecretId, SocketId};
use crate::platform::Platform;
use crate::service::service_hostname;

// =============================================================================
// Graph Nodes
// =============================================================================

/// A shared reference to an op graph node.
///
/// Cloning is cheap and shares structure; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpRef(Arc<OpNode>);

/// A single filesystem build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpNode {
    /// The empty filesystem.
    Scratch,
    /// Pull a base image at a platform. The reference is digest-pinned by
    /// the time it lands in the graph.
    Pull { reference: String, platform: Platform },
    /// Build a Dockerfile frontend against a context directory.
    DockerfileBuild {
        context: OpRef,
        context_path: String,
        dockerfile: String,
        build_args: Vec<(String, String)>,
        target: Option<String>,
        platform: Platform,
    },
    /// Copy a filtered subtree of `source` into `base` at `dest_path`.
    Copy {
        base: OpRef,
        source: OpRef,
        source_path: String,
        dest_path: String,
        include: Vec<String>,
        exclude: Vec<String>,
        permissions: Option<u32>,
    },
    /// Write a file into `base`, creating parents as needed.
    Mkfile {
        base: OpRef,
        path: String,
        contents: Vec<u8>,
        permissions: u32,
    },
    /// Create a directory in `base`, creating parents as needed.
    Mkdir {
        base: OpRef,
        path: String,
        permissions: u32,
    },
    /// Run a process on `base`; the node's result is the post-exec rootfs
    /// with mount overlays excised.
    Exec { base: OpRef, exec: ExecOp },
    /// Overlay source subtrees onto `base` at their target paths, later
    /// layers winning. Used to materialize reads through mounted paths.
    Overlay {
        base: OpRef,
        layers: Vec<OverlayLayer>,
    },
}

/// One overlay layer: `source[source_path]` grafted onto the base at `at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLayer {
    pub at: String,
    pub source: OpRef,
    pub source_path: String,
}

/// The cache-keyed payload of an [`OpNode::Exec`].
///
/// Mounts are sorted by path and services by alias at construction time;
/// secret material is referenced by ID only and never enters the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub secret_env: Vec<(String, SecretId)>,
    pub mounts: Vec<Mount>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stdin: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_stderr: Option<String>,
    pub privileged: bool,
    pub services: Vec<ServiceBinding>,
}

impl OpRef {
    pub(crate) fn new(node: OpNode) -> Self {
        Self(Arc::new(node))
    }

    pub(crate) fn scratch() -> Self {
        Self::new(OpNode::Scratch)
    }

    /// Returns the underlying node.
    pub fn node(&self) -> &OpNode {
        &self.0
    }

    /// Digest of this node (with inputs substituted by their digests),
    /// lowered at `platform`. This is the backend cache key for the node.
    pub fn digest(&self, platform: &Platform) -> String {
        let dag = self.lower(platform);
        dag.nodes[dag.root].digest.clone()
    }

    /// Flattens the graph into topological order with digest-level
    /// de-duplication.
    pub fn lower(&self, platform: &Platform) -> LoweredDag {
        let mut lowering = Lowering {
            platform: platform.clone(),
            nodes: Vec::new(),
            by_digest: HashMap::new(),
            by_ptr: HashMap::new(),
        };
        let root = lowering.visit(self);
        LoweredDag {
            nodes: lowering.nodes,
            root,
        }
    }
}

// =============================================================================
// Lowered Form
// =============================================================================

/// A flattened, de-duplicated op DAG ready for backend submission.
///
/// `nodes[i]`'s inputs always have indices < i.
#[derive(Debug, Clone)]
pub struct LoweredDag {
    pub nodes: Vec<LoweredNode>,
    pub root: usize,
}

/// One node of a [`LoweredDag`].
#[derive(Debug, Clone)]
pub struct LoweredNode {
    /// Canonical content digest; stable across processes.
    pub digest: String,
    /// Platform of the container this node belongs to.
    pub platform: Platform,
    pub op: LoweredOp,
}

/// Node payload with input edges as indices into the owning DAG.
#[derive(Debug, Clone)]
pub enum LoweredOp {
    Scratch,
    Pull {
        reference: String,
    },
    DockerfileBuild {
        context: usize,
        context_path: String,
        dockerfile: String,
        build_args: Vec<(String, String)>,
        target: Option<String>,
    },
    Copy {
        base: usize,
        source: usize,
        source_path: String,
        dest_path: String,
        include: Vec<String>,
        exclude: Vec<String>,
        permissions: Option<u32>,
    },
    Mkfile {
        base: usize,
        path: String,
        contents: Vec<u8>,
        permissions: u32,
    },
    Mkdir {
        base: usize,
        path: String,
        permissions: u32,
    },
    Exec {
        base: usize,
        exec: LoweredExec,
    },
    Overlay {
        base: usize,
        layers: Vec<(String, usize, String)>,
    },
}

/// Exec payload with mount sources resolved to DAG indices.
#[derive(Debug, Clone)]
pub struct LoweredExec {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub secret_env: Vec<(String, SecretId)>,
    pub mounts: Vec<LoweredMount>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub stdin: Option<Vec<u8>>,
    pub redirect_stdout: Option<String>,
    pub redirect_stderr: Option<String>,
    pub privileged: bool,
    pub services: Vec<LoweredService>,
}

/// A mount in lowered form.
#[derive(Debug, Clone)]
pub enum LoweredMount {
    Directory {
        path: String,
        source: usize,
        source_path: String,
    },
    File {
        path: String,
        source: usize,
        source_path: String,
    },
    Temp {
        path: String,
    },
    Cache {
        path: String,
        /// Digest of the cache volume ID; the backend's volume key.
        volume: String,
        base: Option<(usize, String)>,
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

/// A service binding in lowered form: alias plus the stable hostname the
/// process will resolve it to.
#[derive(Debug, Clone)]
pub struct LoweredService {
    pub alias: String,
    pub service: ContainerId,
    pub hostname: String,
}

// =============================================================================
// Lowering Walk
// =============================================================================

struct Lowering {
    platform: Platform,
    nodes: Vec<LoweredNode>,
    by_digest: HashMap<String, usize>,
    by_ptr: HashMap<*const OpNode, usize>,
}

impl Lowering {
    fn visit(&mut self, op: &OpRef) -> usize {
        let ptr = Arc::as_ptr(&op.0);
        if let Some(&idx) = self.by_ptr.get(&ptr) {
            return idx;
        }

        let (lowered, view) = match op.node() {
            OpNode::Scratch => (
                LoweredOp::Scratch,
                serde_json::json!({ "op": "scratch" }),
            ),
            OpNode::Pull {
                reference,
                platform,
            } => (
                LoweredOp::Pull {
                    reference: reference.clone(),
                },
                serde_json::json!({
                    "op": "pull",
                    "reference": reference,
                    "platform": platform.to_string(),
                }),
            ),
            OpNode::DockerfileBuild {
                context,
                context_path,
                dockerfile,
                build_args,
                target,
                platform,
            } => {
                let context_idx = self.visit(context);
                (
                    LoweredOp::DockerfileBuild {
                        context: context_idx,
                        context_path: context_path.clone(),
                        dockerfile: dockerfile.clone(),
                        build_args: build_args.clone(),
                        target: target.clone(),
                    },
                    serde_json::json!({
                        "op": "dockerfile_build",
                        "context": self.nodes[context_idx].digest,
                        "context_path": context_path,
                        "dockerfile": dockerfile,
                        "build_args": build_args,
                        "target": target,
                        "platform": platform.to_string(),
                    }),
                )
            }
            OpNode::Copy {
                base,
                source,
                source_path,
                dest_path,
                include,
                exclude,
                permissions,
            } => {
                let base_idx = self.visit(base);
                let source_idx = self.visit(source);
                (
                    LoweredOp::Copy {
                        base: base_idx,
                        source: source_idx,
                        source_path: source_path.clone(),
                        dest_path: dest_path.clone(),
                        include: include.clone(),
                        exclude: exclude.clone(),
                        permissions: *permissions,
                    },
                    serde_json::json!({
                        "op": "copy",
                        "base": self.nodes[base_idx].digest,
                        "source": self.nodes[source_idx].digest,
                        "source_path": source_path,
                        "dest_path": dest_path,
                        "include": include,
                        "exclude": exclude,
                        "permissions": permissions,
                    }),
                )
            }
            OpNode::Mkfile {
                base,
                path,
                contents,
                permissions,
            } => {
                let base_idx = self.visit(base);
                (
                    LoweredOp::Mkfile {
                        base: base_idx,
                        path: path.clone(),
                        contents: contents.clone(),
                        permissions: *permissions,
                    },
                    serde_json::json!({
                        "op": "mkfile",
                        "base": self.nodes[base_idx].digest,
                        "path": path,
                        "contents": hex::encode(Sha256::digest(contents)),
                        "permissions": permissions,
                    }),
                )
            }
            OpNode::Mkdir {
                base,
                path,
                permissions,
            } => {
                let base_idx = self.visit(base);
                (
                    LoweredOp::Mkdir {
                        base: base_idx,
                        path: path.clone(),
                        permissions: *permissions,
                    },
                    serde_json::json!({
                        "op": "mkdir",
                        "base": self.nodes[base_idx].digest,
                        "path": path,
                        "permissions": permissions,
                    }),
                )
            }
            OpNode::Exec { base, exec } => {
                let base_idx = self.visit(base);
                let (lowered_exec, exec_view) = self.lower_exec(exec);
                (
                    LoweredOp::Exec {
                        base: base_idx,
                        exec: lowered_exec,
                    },
                    serde_json::json!({
                        "op": "exec",
                        "base": self.nodes[base_idx].digest,
                        "exec": exec_view,
                        "platform": self.platform.to_string(),
                    }),
                )
            }
            OpNode::Overlay { base, layers } => {
                let base_idx = self.visit(base);
                let mut lowered_layers = Vec::with_capacity(layers.len());
                let mut layer_views = Vec::with_capacity(layers.len());
                for layer in layers {
                    let idx = self.visit(&layer.source);
                    layer_views.push(serde_json::json!({
                        "at": layer.at,
                        "source": self.nodes[idx].digest,
                        "source_path": layer.source_path,
                    }));
                    lowered_layers.push((layer.at.clone(), idx, layer.source_path.clone()));
                }
                (
                    LoweredOp::Overlay {
                        base: base_idx,
                        layers: lowered_layers,
                    },
                    serde_json::json!({
                        "op": "overlay",
                        "base": self.nodes[base_idx].digest,
                        "layers": layer_views,
                    }),
                )
            }
        };

        let digest = digest_view(&view);
        if let Some(&idx) = self.by_digest.get(&digest) {
            self.by_ptr.insert(ptr, idx);
            return idx;
        }

        let idx = self.nodes.len();
        self.nodes.push(LoweredNode {
            digest: digest.clone(),
            platform: self.platform.clone(),
            op: lowered,
        });
        self.by_digest.insert(digest, idx);
        self.by_ptr.insert(ptr, idx);
        idx
    }

    fn lower_exec(&mut self, exec: &ExecOp) -> (LoweredExec, serde_json::Value) {
        let mut mounts = Vec::with_capacity(exec.mounts.len());
        let mut mount_views = Vec::with_capacity(exec.mounts.len());

        for mount in &exec.mounts {
            let (lowered, view) = match &mount.kind {
                MountKind::Directory { source } => {
                    let idx = self.visit(&source.origin);
                    (
                        LoweredMount::Directory {
                            path: mount.path.clone(),
                            source: idx,
                            source_path: source.path.clone(),
                        },
                        serde_json::json!({
                            "kind": "directory",
                            "path": mount.path,
                            "source": self.nodes[idx].digest,
                            "source_path": source.path,
                        }),
                    )
                }
                MountKind::File { source } => {
                    let idx = self.visit(&source.origin);
                    (
                        LoweredMount::File {
                            path: mount.path.clone(),
                            source: idx,
                            source_path: source.path.clone(),
                        },
                        serde_json::json!({
                            "kind": "file",
                            "path": mount.path,
                            "source": self.nodes[idx].digest,
                            "source_path": source.path,
                        }),
                    )
                }
                MountKind::Temp => (
                    LoweredMount::Temp {
                        path: mount.path.clone(),
                    },
                    serde_json::json!({ "kind": "temp", "path": mount.path }),
                ),
                MountKind::Cache { id, base, sharing } => {
                    let lowered_base = match base {
                        Some(dir) => {
                            let idx = self.visit(&dir.origin);
                            Some((idx, dir.path.clone()))
                        }
                        None => None,
                    };
                    let base_view = lowered_base
                        .as_ref()
                        .map(|(idx, path)| {
                            serde_json::json!({
                                "source": self.nodes[*idx].digest,
                                "source_path": path,
                            })
                        });
                    (
                        LoweredMount::Cache {
                            path: mount.path.clone(),
                            volume: id.digest(),
                            base: lowered_base,
                            sharing: *sharing,
                        },
                        serde_json::json!({
                            "kind": "cache",
                            "path": mount.path,
                            "volume": id.digest(),
                            "base": base_view,
                            "sharing": sharing,
                        }),
                    )
                }
                MountKind::Secret { id } => (
                    LoweredMount::Secret {
                        path: mount.path.clone(),
                        id: id.clone(),
                    },
                    serde_json::json!({
                        "kind": "secret",
                        "path": mount.path,
                        "secret": id.digest(),
                    }),
                ),
                MountKind::Socket { id } => (
                    LoweredMount::Socket {
                        path: mount.path.clone(),
                        id: id.clone(),
                    },
                    serde_json::json!({
                        "kind": "socket",
                        "path": mount.path,
                        "socket": id.digest(),
                    }),
                ),
            };
            mounts.push(lowered);
            mount_views.push(view);
        }

        let services: Vec<LoweredService> = exec
            .services
            .iter()
            .map(|binding| LoweredService {
                alias: binding.alias.clone(),
                service: binding.service.clone(),
                hostname: service_hostname(&binding.service),
            })
            .collect();
        let service_views: Vec<serde_json::Value> = exec
            .services
            .iter()
            .map(|binding| {
                serde_json::json!({
                    "alias": binding.alias,
                    "service": binding.service.digest(),
                })
            })
            .collect();

        let view = serde_json::json!({
            "args": exec.args,
            "env": exec.env,
            "secret_env": exec
                .secret_env
                .iter()
                .map(|(name, id)| serde_json::json!([name, id.digest()]))
                .collect::<Vec<_>>(),
            "mounts": mount_views,
            "workdir": exec.workdir,
            "user": exec.user,
            "stdin": exec.stdin.as_deref().map(|b| hex::encode(Sha256::digest(b))),
            "redirect_stdout": exec.redirect_stdout,
            "redirect_stderr": exec.redirect_stderr,
            "privileged": exec.privileged,
            "services": service_views,
        });

        (
            LoweredExec {
                args: exec.args.clone(),
                env: exec.env.clone(),
                secret_env: exec.secret_env.clone(),
                mounts,
                workdir: exec.workdir.clone(),
                user: exec.user.clone(),
                stdin: exec.stdin.clone(),
                redirect_stdout: exec.redirect_stdout.clone(),
                redirect_stderr: exec.redirect_stderr.clone(),
                privileged: exec.privileged,
                services,
            },
            view,
        )
    }
}

fn digest_view(view: &serde_json::Value) -> String {
    // serde_json::Value objects serialize with sorted keys, so this is
    // canonical as long as the views above stay maps-of-known-keys.
    let bytes = serde_json::to_vec(view).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkfile(base: OpRef, path: &str, contents: &[u8]) -> OpRef {
        OpRef::new(OpNode::Mkfile {
            base,
            path: path.to_string(),
            contents: contents.to_vec(),
            permissions: 0o644,
        })
    }

    #[test]
    fn structurally_equal_graphs_share_digests() {
        let platform = Platform::new("linux", "amd64");
        let a = mkfile(OpRef::scratch(), "/etc/motd", b"hello");
        let b = mkfile(OpRef::scratch(), "/etc/motd", b"hello");
        assert_eq!(a.digest(&platform), b.digest(&platform));

        let c = mkfile(OpRef::scratch(), "/etc/motd", b"other");
        assert_ne!(a.digest(&platform), c.digest(&platform));
    }

    #[test]
    fn lowering_is_topological_and_deduplicated() {
        let platform = Platform::new("linux", "amd64");
        let base = mkfile(OpRef::scratch(), "/shared", b"s");
        // Two branches off the same base, merged by an overlay.
        let left = mkfile(base.clone(), "/left", b"l");
        let right = mkfile(base.clone(), "/right", b"r");
        let root = OpRef::new(OpNode::Overlay {
            base: left,
            layers: vec![OverlayLayer {
                at: "/merged".to_string(),
                source: right,
                source_path: "/".to_string(),
            }],
        });

        let dag = root.lower(&platform);
        // scratch, base, left, right, overlay; the shared base appears once.
        assert_eq!(dag.nodes.len(), 5);
        assert_eq!(dag.root, dag.nodes.len() - 1);

        for (idx, node) in dag.nodes.iter().enumerate() {
            let inputs: Vec<usize> = match &node.op {
                LoweredOp::Scratch | LoweredOp::Pull { .. } => vec![],
                LoweredOp::DockerfileBuild { context, .. } => vec![*context],
                LoweredOp::Copy { base, source, .. } => vec![*base, *source],
                LoweredOp::Mkfile { base, .. }
                | LoweredOp::Mkdir { base, .. }
                | LoweredOp::Exec { base, .. } => vec![*base],
                LoweredOp::Overlay { base, layers } => {
                    let mut inputs = vec![*base];
                    inputs.extend(layers.iter().map(|(_, idx, _)| *idx));
                    inputs
                }
            };
            for input in inputs {
                assert!(input < idx, "node {idx} depends on later node {input}");
            }
        }
    }

    #[test]
    fn platform_distinguishes_exec_digests() {
        let exec = ExecOp {
            args: vec!["true".to_string()],
            env: vec![],
            secret_env: vec![],
            mounts: vec![],
            workdir: None,
            user: None,
            stdin: None,
            redirect_stdout: None,
            redirect_stderr: None,
            privileged: false,
            services: vec![],
        };
        let node = OpRef::new(OpNode::Exec {
            base: OpRef::scratch(),
            exec,
        });
        let amd = node.digest(&Platform::new("linux", "amd64"));
        let arm = node.digest(&Platform::new("linux", "arm64"));
        assert_ne!(amd, arm);
    }

    #[test]
    fn serde_roundtrip_preserves_structure() {
        let root = mkfile(OpRef::scratch(), "/a", b"x");
        let json = serde_json::to_string(&root).unwrap();
        let back: OpRef = serde_json::from_str(&json).unwrap();
        assert_eq!(root, back);
    }
}
