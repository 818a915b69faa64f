//! Cache configuration and cache root resolution

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the cache root
pub const CACHE_DIR_ENV: &str = "COHORTS_CACHE_DIR";

/// Settings for a [`Cache`](crate::Cache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root; resolved from the environment when absent
    pub root: Option<PathBuf>,
    /// Read and write entries at all; when off every value is recomputed
    pub enabled: bool,
    /// Compare stored provenance with the current environment on every read
    pub check_provenance: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            enabled: true,
            check_provenance: false,
        }
    }
}

impl CacheConfig {
    /// Configuration rooted at an explicit directory
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Parse a TOML configuration document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::configuration(format!("Invalid cache configuration: {e}")))
    }

    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&content)
    }

    /// The configured root, or the first writable default location
    pub fn resolve_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) if !root.as_os_str().is_empty() => Ok(root.clone()),
            _ => default_cache_root(),
        }
    }
}

/// Inputs for determining cache root directory
#[derive(Debug, Clone)]
struct CacheInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) COHORTS_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/cohorts
    // 3) OS cache dir/cohorts
    // 4) ~/.cohorts/cache
    // 5) TMPDIR/cohorts/cache (fallback)
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.override_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("cohorts"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("cohorts"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".cohorts/cache"));
    }
    candidates.push(inputs.temp_dir.join("cohorts/cache"));

    for path in candidates {
        // Existing directories can be read-only (shared analysis servers)
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => continue,
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        tracing::debug!(candidate = %path.display(), "cache root candidate not writable");
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

/// Resolve the default cache root from the environment
pub fn default_cache_root() -> Result<PathBuf> {
    let non_empty = |name: &str| {
        std::env::var(name)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
    };
    let inputs = CacheInputs {
        override_dir: non_empty(CACHE_DIR_ENV),
        xdg_cache_home: non_empty("XDG_CACHE_HOME"),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}
