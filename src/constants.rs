//! Constants for the pipeline core.
//!
//! All limits, defaults, and keys are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Permissions
// =============================================================================

/// Default permissions for files written into a rootfs.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

/// Default permissions for directories created in a rootfs,
/// including implicitly-created parents.
pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum OCI image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of an encoded artifact ID accepted by the codec (4 MiB).
/// Large derivation chains are expected; unbounded input is not.
pub const MAX_ENCODED_ID_LEN: usize = 4 * 1024 * 1024;

/// Maximum length of a service binding alias.
pub const MAX_SERVICE_ALIAS_LEN: usize = 63;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for service startup.
pub const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Identifier Codec
// =============================================================================

/// Type tag prefix for container IDs.
pub const CONTAINER_ID_PREFIX: &str = "ctr:";

/// Type tag prefix for directory IDs.
pub const DIRECTORY_ID_PREFIX: &str = "dir:";

/// Type tag prefix for file IDs.
pub const FILE_ID_PREFIX: &str = "file:";

/// Type tag prefix for secret IDs.
pub const SECRET_ID_PREFIX: &str = "sec:";

/// Type tag prefix for socket IDs.
pub const SOCKET_ID_PREFIX: &str = "sock:";

/// Type tag prefix for cache volume IDs.
pub const CACHE_ID_PREFIX: &str = "cache:";

// =============================================================================
// Defaults
// =============================================================================

/// Default Dockerfile path, relative to the build context.
pub const DEFAULT_DOCKERFILE: &str = "./Dockerfile";

/// Working directory used when a container has none configured.
pub const DEFAULT_WORKDIR: &str = "/";

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Config media type.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI image layout version, written to `oci-layout` in exports.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";
