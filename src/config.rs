//! Crate configuration: where credentials live, and the timeouts the engine
//! uses. Deliberately small — a plain `serde`-derived struct loaded from
//! TOML, no process-wide singleton.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeapError, Result};

fn default_leap_port() -> u16 {
    8081
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    60
}

/// Resolve the default directory pairing writes credentials into:
/// `$XDG_CONFIG_HOME/pylutron_caseta/`, falling back to `~/.config/pylutron_caseta`.
pub fn default_cert_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("pylutron_caseta");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("pylutron_caseta")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    #[serde(default = "default_leap_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| LeapError::Protocol(e.to_string()))
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let toml_str =
            toml::to_string_pretty(self).map_err(|e| LeapError::Protocol(e.to_string()))?;
        std::fs::write(path, &toml_str)?;
        Ok(())
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.cert_dir.clone().unwrap_or_else(default_cert_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_leap_port(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            cert_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config {
            host: "192.168.1.50".to_string(),
            ..Config::default()
        };
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.host, "192.168.1.50");
        assert_eq!(parsed.port, 8081);
        assert_eq!(parsed.request_timeout().as_secs(), 5);
    }
}
