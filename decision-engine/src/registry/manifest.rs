//! Discovery of capability manifest files.
//!
//! A manifest root is walked recursively and every `.json` file is parsed
//! as one capability. Files under `<root>/<app>/capabilities/` belong to
//! `<app>`.

use crate::error::{EngineError, EngineResult};
use crate::spec::CapabilitySpec;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub spec: CapabilitySpec,
    pub owning_app: Option<String>,
}

pub fn read_manifest(path: &Path) -> EngineResult<CapabilitySpec> {
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::Manifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| EngineError::Manifest {
        path: path.to_path_buf(),
        reason: format!("invalid JSON: {}", e),
    })?;
    CapabilitySpec::from_manifest(&value).map_err(|e| EngineError::Manifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// App owning a manifest laid out as `<app>/capabilities/<file>.json`
/// somewhere below `root`.
pub fn owning_app(root: &Path, path: &Path) -> Option<String> {
    let parent = path.parent()?;
    if parent == root || parent.file_name()?.to_str()? != "capabilities" {
        return None;
    }
    let app_dir = parent.parent()?;
    if !app_dir.starts_with(root) || app_dir == root {
        return None;
    }
    app_dir.file_name()?.to_str().map(str::to_string)
}

/// Walks `root` and parses every manifest found. Unreadable directories and
/// invalid files are logged and skipped. A missing root yields nothing.
pub fn discover_manifests(root: &Path) -> Vec<ManifestEntry> {
    if !root.is_dir() {
        debug!("[Registry] Manifest directory {} not present", root.display());
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut dirs_to_process = vec![root.to_path_buf()];

    while let Some(current_dir) = dirs_to_process.pop() {
        let entries = match std::fs::read_dir(&current_dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    "[Registry] Failed to read directory {}: {}",
                    current_dir.display(),
                    e
                );
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                dirs_to_process.push(path);
                continue;
            }
            if file_type.is_symlink() && path.is_dir() {
                debug!("[Registry] Not following directory link {}", path.display());
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match read_manifest(&path) {
                Ok(spec) => found.push(ManifestEntry {
                    owning_app: owning_app(root, &path),
                    path,
                    spec,
                }),
                Err(e) => warn!("[Registry] Skipping {}", e),
            }
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::CapabilityKind;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn owning_app_requires_capabilities_dir_below_root() {
        let root = Path::new("/srv/apps");
        assert_eq!(
            owning_app(root, Path::new("/srv/apps/my_app/capabilities/x.json")).as_deref(),
            Some("my_app")
        );
        assert_eq!(owning_app(root, Path::new("/srv/apps/x.json")), None);
        assert_eq!(owning_app(root, Path::new("/srv/apps/my_app/x.json")), None);

        let shared = Path::new("/srv/data/capabilities");
        assert_eq!(owning_app(shared, Path::new("/srv/data/capabilities/x.json")), None);
    }

    #[test]
    fn discovery_walks_nested_dirs_and_skips_bad_files() {
        let dir = tempdir().unwrap();
        let caps = dir.path().join("lights").join("capabilities");
        fs::create_dir_all(&caps).unwrap();
        fs::write(
            caps.join("dim.json"),
            r#"{"name": "lights.dim", "type": "rpc", "parameters": []}"#,
        )
        .unwrap();
        fs::write(caps.join("broken.json"), "{ not json").unwrap();
        fs::write(caps.join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("ping.json"), r#"{"name": "core.ping"}"#).unwrap();

        let found = discover_manifests(dir.path());
        assert_eq!(found.len(), 2);
        let dim = found.iter().find(|m| m.spec.name == "lights.dim").unwrap();
        assert_eq!(dim.spec.kind, CapabilityKind::Rpc);
        assert_eq!(dim.owning_app.as_deref(), Some("lights"));
        let ping = found.iter().find(|m| m.spec.name == "core.ping").unwrap();
        assert_eq!(ping.owning_app, None);
    }

    #[cfg(unix)]
    #[test]
    fn directory_links_are_not_followed() {
        let dir = tempdir().unwrap();
        let caps = dir.path().join("capabilities");
        fs::create_dir_all(&caps).unwrap();
        fs::write(caps.join("ping.json"), r#"{"name": "core.ping"}"#).unwrap();
        std::os::unix::fs::symlink(dir.path(), caps.join("loop")).unwrap();

        let found = discover_manifests(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].spec.name, "core.ping");
    }

    #[test]
    fn missing_root_is_empty() {
        assert!(discover_manifests(Path::new("/definitely/not/here")).is_empty());
    }
}
