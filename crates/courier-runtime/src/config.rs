//! Node configuration loading from `~/.courier/config.toml` with defaults.
//!
//! A file may list other files under `include`, relative to its own
//! directory. Included files are layered first, in order, and the including
//! file's own keys win.

use courier_types::NodeConfig;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: usize = 10;

/// Load node configuration from a TOML file, falling back to defaults on
/// any read, parse or include failure.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    let layered = match read_layered(&config_path, &mut Vec::new()) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to load config, using defaults");
            return NodeConfig::default();
        }
    };
    match layered.try_into::<NodeConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), transports = config.transports.len(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Invalid config, using defaults");
            NodeConfig::default()
        }
    }
}

/// Read `path` with its includes layered underneath. `chain` holds the
/// files currently being read, outermost first.
fn read_layered(path: &Path, chain: &mut Vec<PathBuf>) -> Result<toml::Value, String> {
    if chain.len() > MAX_INCLUDE_DEPTH {
        return Err(format!("includes nested deeper than {MAX_INCLUDE_DEPTH}"));
    }
    let canonical = std::fs::canonicalize(path)
        .map_err(|e| format!("cannot resolve {}: {e}", path.display()))?;
    if chain.contains(&canonical) {
        return Err(format!("{} includes itself", canonical.display()));
    }

    let text = std::fs::read_to_string(&canonical)
        .map_err(|e| format!("cannot read {}: {e}", canonical.display()))?;
    let mut own: toml::Value =
        toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", canonical.display()))?;
    let includes = take_includes(&mut own)?;
    if includes.is_empty() {
        return Ok(own);
    }

    let dir = canonical.parent().unwrap_or(Path::new(".")).to_path_buf();
    chain.push(canonical);
    let mut layered = toml::Value::Table(toml::map::Map::new());
    for name in includes {
        let included = include_path(&dir, &name)?;
        debug!(include = %included.display(), "Reading config include");
        merge(&mut layered, read_layered(&included, chain)?);
    }
    chain.pop();

    merge(&mut layered, own);
    Ok(layered)
}

/// Remove and return the `include` list of a parsed file.
fn take_includes(value: &mut toml::Value) -> Result<Vec<String>, String> {
    let Some(include) = value.as_table_mut().and_then(|t| t.remove("include")) else {
        return Ok(Vec::new());
    };
    let toml::Value::Array(entries) = include else {
        return Err("`include` must be a list of file names".to_string());
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            toml::Value::String(name) => Ok(name),
            other => Err(format!("`include` entry {other} is not a string")),
        })
        .collect()
}

/// Only plain relative paths below `dir` may be included.
fn include_path(dir: &Path, name: &str) -> Result<PathBuf, String> {
    let relative = Path::new(name);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain || name.is_empty() {
        return Err(format!("include \"{name}\" must be a relative path below the config directory"));
    }
    Ok(dir.join(relative))
}

/// Lay `overlay` over `base`: tables merge key by key, anything else is
/// replaced.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// The Courier home directory, `~/.courier`.
pub fn courier_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".courier")
}

/// The default config file path, `~/.courier/config.toml`.
pub fn default_config_path() -> PathBuf {
    courier_home().join("config.toml")
}
