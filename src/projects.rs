//! Origin → project mapping.
//!
//! Loaded from a JSON file of the shape:
//!
//! ```json
//! {
//!   "default": "main",
//!   "projects": {
//!     "platform": ["https://github.com/acme/platform.git"],
//!     "infra": ["https://github.com/acme/deploy.git", "irc://chat/acme-ops"]
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    projects: HashMap<String, Vec<String>>,
}

/// Immutable per-run project lookup.
#[derive(Debug, Clone, Default)]
pub struct ProjectMap {
    by_origin: HashMap<String, String>,
    default: Option<String>,
}

impl ProjectMap {
    /// An empty map: every lookup answers `None`.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read projects file: {}", path.display()))?;
        let parsed: ProjectsFile =
            serde_json::from_str(&content).with_context(|| "Failed to parse projects file")?;

        let mut by_origin = HashMap::new();
        for (project, origins) in parsed.projects {
            for origin in origins {
                by_origin.insert(origin, project.clone());
            }
        }
        Ok(Self {
            by_origin,
            default: parsed.default,
        })
    }

    /// Project for an origin, falling back to the default project if one
    /// is configured.
    pub fn project_for(&self, origin: &str) -> Option<&str> {
        self.by_origin
            .get(origin)
            .map(String::as_str)
            .or(self.default.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_and_lookup() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(
            br#"{
                "default": "main",
                "projects": {
                    "platform": ["https://github.com/acme/platform.git"],
                    "infra": ["https://github.com/acme/deploy.git"]
                }
            }"#,
        )
        .unwrap();

        let map = ProjectMap::load(f.path()).unwrap();
        assert_eq!(
            map.project_for("https://github.com/acme/platform.git"),
            Some("platform")
        );
        assert_eq!(
            map.project_for("https://github.com/acme/deploy.git"),
            Some("infra")
        );
        assert_eq!(map.project_for("unknown-origin"), Some("main"));
    }

    #[test]
    fn test_empty_map_has_no_default() {
        assert_eq!(ProjectMap::empty().project_for("anything"), None);
    }
}
