use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use marquee_ipc::{PeerConfig, TransportConfig};
use marquee_workers::DEFAULT_RENDER_THREAD;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// `<config dir>/Marquee/host.json`, when the platform has a config dir.
pub static DEFAULT_CONFIG_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    let mut path = dirs::config_dir()?;
    path.push("Marquee");
    path.push("host.json");
    Some(path)
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a valid host configuration: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("MARQUEE_CALL_TIMEOUT_MS must be a number of milliseconds, got {0:?}")]
    CallTimeout(String),
}

/// Host settings. Read from disk, never written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Peer executable launched by `marquee run` when none is given.
    pub peer: Option<PathBuf>,
    pub peer_args: Vec<String>,
    /// How long an unanswered call stays pending.
    pub call_timeout_ms: u64,
    /// Period of the sweep that expires stale calls.
    pub maintenance_interval_ms: u64,
    pub render_thread: String,
    pub transport: TransportConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer: None,
            peer_args: Vec::new(),
            call_timeout_ms: 30_000,
            maintenance_interval_ms: 1_000,
            render_thread: DEFAULT_RENDER_THREAD.to_string(),
            transport: TransportConfig::default(),
        }
    }
}

impl HostConfig {
    /// Loads `path`, or the default location when `path` is `None`, then
    /// applies environment overrides.
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None => match DEFAULT_CONFIG_PATH.as_deref() {
                Some(path) if path.exists() => Self::read(path)?,
                _ => {
                    debug!("no host configuration file, using defaults");
                    Self::default()
                }
            },
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `MARQUEE_PEER` and `MARQUEE_CALL_TIMEOUT_MS` as read by `lookup`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(peer) = lookup("MARQUEE_PEER").filter(|value| !value.is_empty()) {
            self.peer = Some(PathBuf::from(peer));
        }
        if let Some(raw) = lookup("MARQUEE_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::CallTimeout(raw.clone()))?;
        }
        Ok(self)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    /// Launch settings for the configured peer, falling back to
    /// [`PeerConfig::default`] for the executable.
    pub fn peer_config(&self) -> PeerConfig {
        let mut config = PeerConfig {
            args: self.peer_args.clone(),
            transport: self.transport.clone(),
            ..PeerConfig::default()
        };
        if let Some(peer) = &self.peer {
            config.executable = peer.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"peer": "/opt/peer", "call_timeout_ms": 500, "transport": {{"overflow": "drop_oldest"}}}}"#
        )
        .unwrap();

        let config = HostConfig::read(file.path()).unwrap();
        assert_eq!(config.peer, Some(PathBuf::from("/opt/peer")));
        assert_eq!(config.call_timeout(), Duration::from_millis(500));
        assert_eq!(config.maintenance_interval_ms, 1_000);
        assert_eq!(
            config.transport.overflow,
            marquee_ipc::OverflowPolicy::DropOldest
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostConfig::load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ nope").unwrap();
        assert!(matches!(
            HostConfig::read(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn environment_overrides() {
        let config = HostConfig::default()
            .with_env_overrides(|key| match key {
                "MARQUEE_PEER" => Some("/usr/bin/peer".into()),
                "MARQUEE_CALL_TIMEOUT_MS" => Some(" 250 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.peer_config().executable, PathBuf::from("/usr/bin/peer"));
        assert_eq!(config.call_timeout_ms, 250);

        let err = HostConfig::default()
            .with_env_overrides(|key| (key == "MARQUEE_CALL_TIMEOUT_MS").then(|| "soon".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::CallTimeout(raw) if raw == "soon"));
    }
}
