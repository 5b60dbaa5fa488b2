//! Artifact values: directories, files, secrets, sockets, cache volumes.
//!
//! Like containers, these are immutable values. A [`Directory`] or [`File`]
//! is a pointer into the op graph (an origin node plus a path inside it);
//! deriving one appends graph nodes and returns a new value. [`Secret`],
//! [`Socket`], and [`CacheVolume`] are opaque references; the core never
//! sees secret plaintext or touches socket endpoints itself.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS};
use crate::engine::Engine;
use crate::error::Result;
use crate::ident::{CacheId, DirectoryId, FileId, SecretId, SocketId};
use crate::opgraph::{OpNode, OpRef};
use crate::pathutil;
use crate::platform::Platform;

// =============================================================================
// Directory
// =============================================================================

/// An immutable directory value: a lazily-evaluated filesystem tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Graph node whose solve result contains this directory.
    pub(crate) origin: OpRef,
    /// Normalized absolute path of this directory within the origin.
    pub(crate) path: String,
    /// Platform the origin is built for.
    pub(crate) platform: Platform,
}

impl Directory {
    /// The empty directory.
    pub fn scratch(platform: Platform) -> Self {
        Self {
            origin: OpRef::scratch(),
            path: "/".to_string(),
            platform,
        }
    }

    pub(crate) fn from_op(origin: OpRef, path: String, platform: Platform) -> Self {
        Self {
            origin,
            path,
            platform,
        }
    }

    /// Content-addressed ID of this directory value.
    pub fn id(&self) -> Result<DirectoryId> {
        DirectoryId::encode(self)
    }

    /// Decodes a directory from its opaque ID.
    pub fn from_id(id: &DirectoryId) -> Result<Self> {
        id.decode()
    }

    /// Resolves a caller path relative to this directory's root.
    fn join(&self, path: &str) -> Result<String> {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            return Ok(self.path.clone());
        }
        pathutil::resolve(Some(&self.path), rel)
    }

    /// Returns a sub-directory value at `path`. Lazy; the path is not
    /// checked for existence until the directory is read.
    pub fn directory(&self, path: &str) -> Result<Directory> {
        Ok(Self {
            origin: self.origin.clone(),
            path: self.join(path)?,
            platform: self.platform.clone(),
        })
    }

    /// Returns a file value at `path` within this directory.
    pub fn file(&self, path: &str) -> Result<File> {
        Ok(File {
            origin: self.origin.clone(),
            path: self.join(path)?,
            platform: self.platform.clone(),
        })
    }

    /// Returns a new directory with a file written at `path`.
    ///
    /// Parent directories are created as needed. `permissions` defaults
    /// to 0644.
    pub fn with_new_file(
        &self,
        path: &str,
        contents: impl Into<Vec<u8>>,
        permissions: Option<u32>,
    ) -> Result<Directory> {
        let target = self.join(path)?;
        Ok(Self {
            origin: OpRef::new(OpNode::Mkfile {
                base: self.origin.clone(),
                path: target,
                contents: contents.into(),
                permissions: permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS),
            }),
            path: self.path.clone(),
            platform: self.platform.clone(),
        })
    }

    /// Returns a new directory with an empty directory created at `path`.
    ///
    /// `permissions` defaults to 0755.
    pub fn with_new_directory(&self, path: &str, permissions: Option<u32>) -> Result<Directory> {
        let target = self.join(path)?;
        Ok(Self {
            origin: OpRef::new(OpNode::Mkdir {
                base: self.origin.clone(),
                path: target,
                permissions: permissions.unwrap_or(DEFAULT_DIR_PERMISSIONS),
            }),
            path: self.path.clone(),
            platform: self.platform.clone(),
        })
    }

    /// Returns a new directory with `source`'s contents copied in at `path`.
    ///
    /// `include`/`exclude` are glob filters on entry names; exclude is
    /// applied after include, and absent filters copy everything.
    pub fn with_directory(
        &self,
        path: &str,
        source: &Directory,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<Directory> {
        let target = self.join(path)?;
        Ok(Self {
            origin: OpRef::new(OpNode::Copy {
                base: self.origin.clone(),
                source: source.origin.clone(),
                source_path: source.path.clone(),
                dest_path: target,
                include: include.iter().map(|s| s.to_string()).collect(),
                exclude: exclude.iter().map(|s| s.to_string()).collect(),
                permissions: None,
            }),
            path: self.path.clone(),
            platform: self.platform.clone(),
        })
    }

    /// Returns a new directory with `source` copied to `path`.
    ///
    /// `permissions` overrides the source file's mode when given.
    pub fn with_file(&self, path: &str, source: &File, permissions: Option<u32>) -> Result<Directory> {
        let target = self.join(path)?;
        Ok(Self {
            origin: OpRef::new(OpNode::Copy {
                base: self.origin.clone(),
                source: source.origin.clone(),
                source_path: source.path.clone(),
                dest_path: target,
                include: Vec::new(),
                exclude: Vec::new(),
                permissions,
            }),
            path: self.path.clone(),
            platform: self.platform.clone(),
        })
    }

    /// Lists entry names at this directory's root, sorted ascending.
    ///
    /// Terminal: forces evaluation of the origin graph.
    pub async fn entries(&self, engine: &Engine) -> Result<Vec<String>> {
        engine.read_directory(self).await
    }
}

// =============================================================================
// File
// =============================================================================

/// An immutable file value within a lazily-evaluated tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub(crate) origin: OpRef,
    pub(crate) path: String,
    pub(crate) platform: Platform,
}

impl File {
    /// Content-addressed ID of this file value.
    pub fn id(&self) -> Result<FileId> {
        FileId::encode(self)
    }

    /// Decodes a file from its opaque ID.
    pub fn from_id(id: &FileId) -> Result<Self> {
        id.decode()
    }

    /// Reads the file's bytes. Terminal: forces evaluation of the origin.
    pub async fn contents(&self, engine: &Engine) -> Result<Vec<u8>> {
        engine.read_file(self).await
    }
}

// =============================================================================
// Opaque References
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SecretPayload {
    pub name: String,
}

/// An opaque reference to a backend-held secret.
///
/// The core moves secrets by ID only; plaintext lives in the backend and is
/// injected through its secret channel at exec time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    id: SecretId,
}

impl Secret {
    pub(crate) fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: SecretId::encode(&SecretPayload { name: name.into() })?,
        })
    }

    /// Wraps an existing secret ID.
    pub fn from_id(id: SecretId) -> Self {
        Self { id }
    }

    /// The opaque ID.
    pub fn id(&self) -> &SecretId {
        &self.id
    }

    /// The secret's registered name.
    pub fn name(&self) -> Result<String> {
        let payload: SecretPayload = self.id.decode()?;
        Ok(payload.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SocketPayload {
    pub host_path: String,
}

/// An opaque reference to a caller-owned unix socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socket {
    id: SocketId,
}

impl Socket {
    pub(crate) fn new(host_path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: SocketId::encode(&SocketPayload {
                host_path: host_path.into(),
            })?,
        })
    }

    /// Wraps an existing socket ID.
    pub fn from_id(id: SocketId) -> Self {
        Self { id }
    }

    /// The opaque ID.
    pub fn id(&self) -> &SocketId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CachePayload {
    pub key: String,
}

/// A named cache volume.
///
/// Volumes are addressed by key: equal keys yield equal IDs, so independent
/// pipelines naming the same key share the same volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheVolume {
    id: CacheId,
}

impl CacheVolume {
    /// Creates (or addresses) the cache volume named `key`.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: CacheId::encode(&CachePayload { key: key.into() })?,
        })
    }

    /// Wraps an existing cache ID.
    pub fn from_id(id: CacheId) -> Self {
        Self { id }
    }

    /// The opaque ID.
    pub fn id(&self) -> &CacheId {
        &self.id
    }
}
