//! Path-keyed mounts, applied only at exec time.
//!
//! Mounts live in container configuration, not in rootfs: they are overlaid
//! when a process runs and excised when its rootfs is committed. The mount
//! list is insertion-ordered with at most one mount per exact path; adding
//! a mount at an occupied path replaces the occupant.

use serde::{Deserialize, Serialize};

use crate::artifact::{CacheVolume, Directory, File, Secret, Socket};
use crate::container::Container;
use crate::error::Result;
use crate::ident::{CacheId, SecretId, SocketId};
use crate::pathutil;

/// Concurrency policy of a cache volume mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSharingMode {
    /// Concurrent reader/writer access across the host.
    Shared,
    /// An isolated instance per consumer.
    Private,
    /// All access serialized.
    Locked,
}

impl Default for CacheSharingMode {
    fn default() -> Self {
        Self::Shared
    }
}

/// What is mounted at a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MountKind {
    /// A directory value overlaid read-write (writes excised at commit).
    Directory { source: Directory },
    /// A single file value.
    File { source: File },
    /// A tmpfs, empty at every exec.
    Temp,
    /// A persistent named cache volume, optionally seeded from `base`.
    Cache {
        id: CacheId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        base: Option<Directory>,
        sharing: CacheSharingMode,
    },
    /// A secret materialized as a read-only file; never committed.
    Secret { id: SecretId },
    /// A forwarded unix socket endpoint.
    Socket { id: SocketId },
}

impl MountKind {
    /// Short label for diagnostics and `MountNotReadable` errors.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            MountKind::Directory { .. } => "directory",
            MountKind::File { .. } => "file",
            MountKind::Temp => "tempfs",
            MountKind::Cache { .. } => "cache",
            MountKind::Secret { .. } => "secret",
            MountKind::Socket { .. } => "socket",
        }
    }
}

/// A mount record: an absolute path and what sits there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub path: String,
    pub kind: MountKind,
}

// =============================================================================
// Mount Operations
// =============================================================================

impl Container {
    /// Inserts or replaces a mount at `path`, keeping insertion order for
    /// paths not previously mounted.
    fn with_mount(&self, path: &str, kind: MountKind) -> Result<Container> {
        let path = pathutil::require_absolute(path)?;
        let mut next = self.clone();
        match next.mounts.iter_mut().find(|m| m.path == path) {
            Some(mount) => mount.kind = kind,
            None => next.mounts.push(Mount { path, kind }),
        }
        next.image_ref = None;
        Ok(next)
    }

    /// Mounts a directory value at an absolute path.
    pub fn with_mounted_directory(&self, path: &str, source: &Directory) -> Result<Container> {
        self.with_mount(
            path,
            MountKind::Directory {
                source: source.clone(),
            },
        )
    }

    /// Mounts a file value at an absolute path.
    pub fn with_mounted_file(&self, path: &str, source: &File) -> Result<Container> {
        self.with_mount(
            path,
            MountKind::File {
                source: source.clone(),
            },
        )
    }

    /// Mounts a tmpfs at an absolute path.
    pub fn with_mounted_temp(&self, path: &str) -> Result<Container> {
        self.with_mount(path, MountKind::Temp)
    }

    /// Mounts a cache volume at an absolute path.
    ///
    /// `base` seeds the volume's initial contents on first use; `sharing`
    /// governs concurrent access.
    pub fn with_mounted_cache(
        &self,
        path: &str,
        cache: &CacheVolume,
        base: Option<&Directory>,
        sharing: CacheSharingMode,
    ) -> Result<Container> {
        self.with_mount(
            path,
            MountKind::Cache {
                id: cache.id().clone(),
                base: base.cloned(),
                sharing,
            },
        )
    }

    /// Mounts a secret as a read-only file at an absolute path.
    ///
    /// Secret contents are injected by the backend at exec time and are
    /// never committed into rootfs.
    pub fn with_mounted_secret(&self, path: &str, secret: &Secret) -> Result<Container> {
        self.with_mount(
            path,
            MountKind::Secret {
                id: secret.id().clone(),
            },
        )
    }

    /// Forwards a unix socket endpoint to an absolute path.
    pub fn with_unix_socket(&self, path: &str, socket: &Socket) -> Result<Container> {
        self.with_mount(
            path,
            MountKind::Socket {
                id: socket.id().clone(),
            },
        )
    }

    /// Removes the socket forwarded at exactly `path`; other mount kinds at
    /// that path are left alone.
    pub fn without_unix_socket(&self, path: &str) -> Result<Container> {
        let path = pathutil::require_absolute(path)?;
        let mut next = self.clone();
        next.mounts
            .retain(|m| !(m.path == path && matches!(m.kind, MountKind::Socket { .. })));
        next.image_ref = None;
        Ok(next)
    }

    /// Removes any mount at exactly `path`.
    pub fn without_mount(&self, path: &str) -> Result<Container> {
        let path = pathutil::require_absolute(path)?;
        let mut next = self.clone();
        next.mounts.retain(|m| m.path != path);
        next.image_ref = None;
        Ok(next)
    }

    /// Returns the currently-mounted paths, sorted ascending.
    pub fn mounts(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mounts.iter().map(|m| m.path.clone()).collect();
        paths.sort();
        paths
    }

    /// The deepest mount whose path covers `path`, if any.
    pub(crate) fn mount_covering(&self, path: &str) -> Option<&Mount> {
        self.mounts
            .iter()
            .filter(|m| pathutil::is_under(&m.path, path))
            .max_by_key(|m| m.path.len())
    }
}
