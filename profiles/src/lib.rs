#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("profile rejects {field} = {value}")]
    Invalid { field: &'static str, value: f64 },
}

/// A single simulation run: how long, how fine, and how reproducible.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunProfile {
    pub name: String,
    pub dt_ms: f64,
    pub t_end_ms: f64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_group_size_hint")]
    pub group_size_hint: usize,
    #[serde(default)]
    pub log_spikes: bool,
}

fn default_threads() -> usize {
    1
}

fn default_group_size_hint() -> usize {
    1024
}

impl RunProfile {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let reader = std::fs::File::open(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let profile: RunProfile =
            serde_yaml::from_reader(reader).map_err(|source| ConfigError::Parse { path, source })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt_ms > 0.0) || !self.dt_ms.is_finite() {
            return Err(ConfigError::Invalid {
                field: "dt_ms",
                value: self.dt_ms,
            });
        }
        if !(self.t_end_ms > 0.0) || !self.t_end_ms.is_finite() {
            return Err(ConfigError::Invalid {
                field: "t_end_ms",
                value: self.t_end_ms,
            });
        }
        if self.group_size_hint == 0 {
            return Err(ConfigError::Invalid {
                field: "group_size_hint",
                value: 0.0,
            });
        }
        Ok(())
    }

    pub fn fallback() -> Self {
        RunProfile {
            name: "default".to_string(),
            dt_ms: 0.025,
            t_end_ms: 100.0,
            seed: 0,
            threads: 1,
            group_size_hint: default_group_size_hint(),
            log_spikes: false,
        }
    }
}
