pub mod types;


pub use types::*;

use crate::error::{FlintrockError, Result};
use std::path::Path;

impl FlintrockConfig {
    /// Load the defaults file (if it exists) and apply environment variable
    /// overrides. A missing file falls back to built-in defaults so the tool
    /// works with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: FlintrockConfig = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                FlintrockError::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content).map_err(|e| {
                    FlintrockError::Config(format!("{}: {}", path.display(), e))
                })?,
                Some("json") => serde_json::from_str(&content).map_err(|e| {
                    FlintrockError::Config(format!("{}: {}", path.display(), e))
                })?,
                Some(ext) => {
                    return Err(FlintrockError::Config(format!(
                        "unsupported config format: .{}, use .toml or .json",
                        ext
                    )))
                }
                None => {
                    return Err(FlintrockError::Config(
                        "config file has no extension, use .toml or .json".to_string(),
                    ))
                }
            }
        } else {
            tracing::debug!("config file not found at {}, using defaults", path.display());
            FlintrockConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides cover the SSH identity only; provider region
    /// and credentials stay with the cloud SDK's own chain.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLINTROCK_SSH_USER") {
            self.ssh.user = v;
        }
        if let Ok(v) = std::env::var("FLINTROCK_IDENTITY_FILE") {
            self.ssh.identity_file = Some(v.into());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssh.user.is_empty() {
            return Err(FlintrockError::Config("ssh user cannot be empty".into()));
        }
        if !matches!(self.launch.java_version, 8 | 11) {
            return Err(FlintrockError::Config(format!(
                "java-version must be 8 or 11, got {}",
                self.launch.java_version
            )));
        }
        if let Some(price) = self.ec2.spot_price {
            if price <= 0.0 {
                return Err(FlintrockError::Config(format!(
                    "spot-price must be positive, got {}",
                    price
                )));
            }
        }
        parse_tags(&self.ec2.tags)?;
        Ok(())
    }
}

/// Split `key=value` tag entries, rejecting malformed ones.
pub fn parse_tags(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    FlintrockError::Config(format!("tag {:?} is not of the form key=value", entry))
                })
        })
        .collect()
}
