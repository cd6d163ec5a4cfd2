//! Daemon configuration.
//!
//! A single JSON document, probed from the working directory first and
//! `/etc` last. Only two keys matter: where to listen and where the
//! database lives.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const LOOKUP_PATHS: [&str; 3] = ["config.json", "pkiadm.json", "/etc/pkiadm.json"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path of the Unix socket to listen on.
    #[serde(rename = "Path")]
    pub path: PathBuf,
    /// Path of the persisted graph document.
    #[serde(rename = "Storage")]
    pub storage: PathBuf,
}

impl Config {
    /// Probe the well-known locations in order and load the first hit.
    pub fn load() -> Result<Self> {
        for path in LOOKUP_PATHS {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }
        bail!("no config file found");
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}
