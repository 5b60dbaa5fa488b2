//! # pipeforge
//!
//! **Lazily-Evaluated, Content-Addressed Container Pipeline Core**
//!
//! This crate is a graph engine for composing immutable descriptions of
//! container filesystems, executions, mounts, and image publications, and
//! resolving them on demand into concrete artifacts: filesystem trees,
//! process outputs, published references, and OCI tarballs.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           pipeforge                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                   Container Values (pure)                   │    │
//! │  │  with_env · with_mounted_* · with_exec · from · publish …   │    │
//! │  │        every operation returns a NEW container              │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │ rootfs ops append graph nodes     │
//! │  ┌──────────────────────────────┴──────────────────────────────┐    │
//! │  │                        Op Graph                             │    │
//! │  │  Scratch → Pull → Copy → Mkfile → Exec → Overlay            │    │
//! │  │  Arc-shared · canonical digests · topo-lowered              │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │ terminal ops force evaluation     │
//! │  ┌──────────────────────────────┴──────────────────────────────┐    │
//! │  │                          Engine                             │    │
//! │  │  single-flight solves │ service leases │ cancellation       │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! ├─────────────────────────────────┼───────────────────────────────────┤
//! │                          BuildBackend                               │
//! │        solve · run · pull · push · export_oci · services            │
//! │              (in-process: backend::memory::MemoryBackend)           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Value Semantics
//!
//! Containers, directories, and files are immutable records over an
//! `Arc`-shared op graph. Deriving a value is O(1) and never touches the
//! backend except where pinning is inherent (`from` resolves its digest at
//! derivation time, `with_exec` runs eagerly and records the outcome).
//! Everything else (entries, file contents, publish, export) evaluates
//! lazily through the [`Engine`], which single-flights structurally equal
//! solves and observes a cancellation token.
//!
//! A value's opaque ID is its canonical serialization: equal derivation
//! histories give byte-equal IDs, and `decode(encode(v)) == v`.
//!
//! # Services
//!
//! A container bound with [`Container::with_service_binding`] runs only
//! while some consumer evaluation needs it: the engine leases service
//! instances around each force, the coordinator starts each service at most
//! once, and the last released lease tears the instance down.
//!
//! # Example
//!
//! ```rust,ignore
//! use pipeforge::{Engine, MemoryBackend, Platform};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pipeforge::Result<()> {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let engine = Engine::new(backend);
//!
//!     let out = engine
//!         .container(None)
//!         .from(&engine, "alpine:3.18").await?
//!         .with_env_variable("MODE", "ci")
//!         .with_exec(&engine, ["echo", "hello"]).await?
//!         .stdout(&engine).await?;
//!
//!     assert_eq!(out.as_deref(), Some("hello\n"));
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod constants;
mod engine;
mod error;
mod ident;
mod opgraph;
mod pathutil;
mod pipeline;
mod platform;
mod publish;
mod service;

// =============================================================================
// Public Modules
// =============================================================================

/// Artifact values: directories, files, secrets, sockets, cache volumes.
pub mod artifact;

/// The BuildBackend capability and the in-process reference backend.
pub mod backend;

/// The container value model and its derivation operations.
pub mod container;

// =============================================================================
// Re-exports (primary API surface)
// =============================================================================

pub use crate::artifact::{CacheVolume, Directory, File, Secret, Socket};
pub use crate::backend::memory::{CommandOutput, ExecContext, MemNode, MemoryBackend};
pub use crate::backend::BuildBackend;
pub use crate::container::config::{ExposedPort, ImageConfig, NetworkProtocol};
pub use crate::container::exec::ExecOptions;
pub use crate::container::mount::CacheSharingMode;
pub use crate::container::Container;
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::ident::{CacheId, ContainerId, DirectoryId, FileId, SecretId, SocketId};
pub use crate::pipeline::PipelineLabel;
pub use crate::platform::Platform;
pub use crate::publish::{ImageAssembly, OciImageConfig};
