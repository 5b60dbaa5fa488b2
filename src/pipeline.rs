//! Named sub-pipeline labels for observability.
//!
//! A pipeline label is a pure annotation: it tags every derived value with a
//! (name, description) pair so evaluation logs can be grouped by the logical
//! stage that produced them. Labels never affect rootfs content, and they are
//! excluded from cache keys at lowering time so relabelling a pipeline does
//! not invalidate solves.

use serde::{Deserialize, Serialize};

/// A named sub-pipeline tag carried by derived containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineLabel {
    /// Pipeline name, as shown in evaluation logs.
    pub name: String,
    /// Human-readable description of the pipeline's purpose.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

impl PipelineLabel {
    /// Creates a label with a name and optional description.
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            description,
        }
    }

    /// Nests a child label under this one, joining names with `/`.
    pub fn child(&self, name: &str, description: Option<String>) -> Self {
        Self {
            name: format!("{}/{}", self.name, name),
            description,
        }
    }
}

impl std::fmt::Display for PipelineLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_joins_names() {
        let root = PipelineLabel::new("ci", None);
        let child = root.child("test", Some("unit tests".to_string()));
        assert_eq!(child.name, "ci/test");
        assert_eq!(child.description.as_deref(), Some("unit tests"));
    }
}
