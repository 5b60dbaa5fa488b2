//! Platform triples for base-image pulls and build output.
//!
//! A [`Platform`] is the OS/arch/variant triple that parameterizes every
//! rootfs-producing operation. It is set when a container is constructed and
//! never mutated afterwards; derived containers inherit it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// OS/arch/variant triple in OCI notation (`linux/amd64`, `linux/arm64/v8`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (e.g. `linux`).
    pub os: String,
    /// CPU architecture (e.g. `amd64`, `arm64`).
    pub arch: String,
    /// Architecture variant (e.g. `v8`), if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,
}

impl Platform {
    /// Creates a platform from OS and architecture.
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            variant: None,
        }
    }

    /// Creates a platform with an explicit variant.
    pub fn with_variant(
        os: impl Into<String>,
        arch: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            variant: Some(variant.into()),
        }
    }

    /// Detects the host platform.
    ///
    /// Containers default to `linux/<host-arch>`: builds target Linux images
    /// even when the engine itself runs on another OS.
    pub fn host() -> Self {
        Self::new("linux", Self::host_arch())
    }

    fn host_arch() -> &'static str {
        #[cfg(target_arch = "x86_64")]
        return "amd64";

        #[cfg(target_arch = "aarch64")]
        return "arm64";

        #[cfg(target_arch = "arm")]
        return "arm";

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return "amd64";
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.arch, variant),
            None => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts.next().filter(|p| !p.is_empty());
        let arch = parts.next().filter(|p| !p.is_empty());
        let variant = parts.next().filter(|p| !p.is_empty());

        match (os, arch, parts.next()) {
            (Some(os), Some(arch), None) => Ok(Self {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: variant.map(str::to_string),
            }),
            _ => Err(Error::invalid_id(
                "platform",
                format!("'{s}' is not of the form os/arch[/variant]"),
            )),
        }
    }
}
