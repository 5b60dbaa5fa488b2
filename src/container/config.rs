//! OCI image configuration carried by container values.
//!
//! Env and labels are ordered name/value vectors, not maps: insertion order
//! is part of the value (it determines serialization, and therefore the
//! container's ID) and later writes shadow earlier ones by replacing the
//! entry in place.

use serde::{Deserialize, Serialize};

use crate::backend::StreamHandle;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

impl Default for NetworkProtocol {
    fn default() -> Self {
        Self::Tcp
    }
}

impl std::fmt::Display for NetworkProtocol {
    /// Lowercase form, as used in OCI config `ExposedPorts` keys.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A port a service container offers to its consumers.
///
/// The set is keyed by (port, protocol); the description is advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: NetworkProtocol,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// OCI image config fields of a container value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_args: Option<Vec<String>>,
    pub exposed_ports: Vec<ExposedPort>,
}

impl ImageConfig {
    /// Sets an env entry, replacing any prior entry of the same name in
    /// place (its position in the ordering is preserved).
    pub(crate) fn set_env(&mut self, name: &str, value: &str) {
        match self.env.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.env.push((name.to_string(), value.to_string())),
        }
    }

    /// Removes an env entry by name.
    pub(crate) fn remove_env(&mut self, name: &str) {
        self.env.retain(|(n, _)| n != name);
    }

    /// Looks up an env value by name.
    pub(crate) fn get_env(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a label, replacing any prior entry of the same name in place.
    pub(crate) fn set_label(&mut self, name: &str, value: &str) {
        match self.labels.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.labels.push((name.to_string(), value.to_string())),
        }
    }

    /// Removes a label by name.
    pub(crate) fn remove_label(&mut self, name: &str) {
        self.labels.retain(|(n, _)| n != name);
    }

    /// Adds an exposed port, replacing any prior entry with the same
    /// (port, protocol) key in place.
    pub(crate) fn add_port(&mut self, port: ExposedPort) {
        match self
            .exposed_ports
            .iter_mut()
            .find(|p| p.port == port.port && p.protocol == port.protocol)
        {
            Some(entry) => *entry = port,
            None => self.exposed_ports.push(port),
        }
    }

    /// Removes an exposed port by (port, protocol) key.
    pub(crate) fn remove_port(&mut self, port: u16, protocol: NetworkProtocol) {
        self.exposed_ports
            .retain(|p| !(p.port == port && p.protocol == protocol));
    }

    /// Merges image-provided defaults under locally-set fields.
    ///
    /// Used by `from`: scalar fields adopt the image value only when unset
    /// locally; env, labels, and ports take the image entries first with
    /// local entries layered on top (shadowing by key).
    pub(crate) fn merge_image_defaults(&self, image: &ImageConfig) -> ImageConfig {
        let mut merged = image.clone();
        for (name, value) in &self.env {
            merged.set_env(name, value);
        }
        for (name, value) in &self.labels {
            merged.set_label(name, value);
        }
        for port in &self.exposed_ports {
            merged.add_port(port.clone());
        }
        if self.user.is_some() {
            merged.user = self.user.clone();
        }
        if self.workdir.is_some() {
            merged.workdir = self.workdir.clone();
        }
        if self.entrypoint.is_some() {
            merged.entrypoint = self.entrypoint.clone();
        }
        if self.default_args.is_some() {
            merged.default_args = self.default_args.clone();
        }
        merged
    }
}

/// Results of the most recent execution on a container value chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExec {
    pub exit_code: i64,
    pub stdout: StreamHandle,
    pub stderr: StreamHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_replacement_preserves_position() {
        let mut config = ImageConfig::default();
        config.set_env("A", "1");
        config.set_env("B", "2");
        config.set_env("A", "3");
        assert_eq!(
            config.env,
            vec![
                ("A".to_string(), "3".to_string()),
                ("B".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn merge_keeps_local_values_on_top() {
        let mut local = ImageConfig::default();
        local.set_env("PATH", "/custom/bin");
        local.workdir = Some("/app".to_string());

        let mut image = ImageConfig::default();
        image.set_env("PATH", "/usr/bin");
        image.set_env("HOME", "/root");
        image.entrypoint = Some(vec!["/bin/sh".to_string()]);
        image.workdir = Some("/".to_string());

        let merged = local.merge_image_defaults(&image);
        assert_eq!(merged.get_env("PATH"), Some("/custom/bin"));
        assert_eq!(merged.get_env("HOME"), Some("/root"));
        assert_eq!(merged.workdir.as_deref(), Some("/app"));
        assert_eq!(merged.entrypoint, Some(vec!["/bin/sh".to_string()]));
    }
}
