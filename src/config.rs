use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from fixiir.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FixIirConfig {
    pub flopoco: FlopocoConfig,
    pub filter: FilterConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FlopocoConfig {
    /// Explicit executable; when unset, `flopoco` on PATH, then ./build/flopoco.
    pub executable: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub timeout_secs: Option<f64>,
    pub loglevel: i32,
    pub generate_figures: i32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub lsb_in: i32,
    pub lsb_out: i32,
    pub fallback_h: Option<f64>,
}

impl Default for FlopocoConfig {
    fn default() -> Self {
        Self {
            executable: None,
            extra_args: Vec::new(),
            timeout_secs: None,
            loglevel: 1,
            generate_figures: 0,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            lsb_in: -12,
            lsb_out: -12,
            fallback_h: None,
        }
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load the config at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<FixIirConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(FixIirConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
