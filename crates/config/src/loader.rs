use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::{ConfigError, HubConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["trellis.toml", "trellis.yaml", "trellis.yml", "trellis.json"];

/// Bootstrap files consulted when no primary config exists. A setup file is a
/// regular config, typically carrying `setup_mode = true` and little else.
const SETUP_FILENAMES: &[&str] = &["setup.toml", "setup.yaml", "setup.yml", "setup.json"];

/// Load config from an explicit path, or discover it in standard locations.
///
/// Search order for discovery:
/// 1. `./trellis.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/trellis/trellis.{toml,yaml,yml,json}` (user-global)
/// 3. the same locations for `setup.{toml,yaml,yml,json}`
///
/// An explicit path that does not exist falls back to a `setup.*` file in the
/// same directory before failing. Missing config is fatal to the caller.
pub fn load(path: Option<&Path>) -> Result<HubConfig, ConfigError> {
    let path = match path {
        Some(p) if p.exists() => p.to_path_buf(),
        Some(p) => {
            let fallback = sibling_setup_file(p);
            match fallback {
                Some(f) => {
                    warn!(path = %p.display(), fallback = %f.display(), "config file missing, using setup file");
                    f
                },
                None => return Err(ConfigError::NotFound),
            }
        },
        None => find_config_file().ok_or(ConfigError::NotFound)?,
    };

    debug!(path = %path.display(), "loading config");
    let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_config(&raw, &path)
}

fn sibling_setup_file(missing: &Path) -> Option<PathBuf> {
    let dir = missing.parent().unwrap_or_else(|| Path::new("."));
    SETUP_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Find the first config file in standard locations, setup files last.
fn find_config_file() -> Option<PathBuf> {
    for names in [CONFIG_FILENAMES, SETUP_FILENAMES] {
        // Project-local
        for name in names {
            let p = PathBuf::from(name);
            if p.exists() {
                return Some(p);
            }
        }

        // User-global: ~/.config/trellis/
        if let Some(dir) = config_dir() {
            for name in names {
                let p = dir.join(name);
                if p.exists() {
                    return Some(p);
                }
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/trellis/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "trellis").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<HubConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let parsed = match ext {
        "toml" => toml::from_str(raw).map_err(|e| e.to_string()),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| e.to_string()),
        "json" => serde_json::from_str(raw).map_err(|e| e.to_string()),
        _ => Err(format!("unsupported config format: .{ext}")),
    };

    parsed.map_err(|message| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    })
}
