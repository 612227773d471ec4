//! Configuration loading
//!
//! An optional TOML file supplies settings; `UNISON_*` environment variables
//! override it. Anything unset falls back to per-user directories.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use tracing::{debug, info};
use unison_net::DEFAULT_PORT;
use uuid::Uuid;

use crate::error::{AppError, Result};

const CONFIG_FILE: &str = "unison.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "unison", "unison")
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory of audio files served to every room
    pub audio_dir: PathBuf,
    /// Directory holding one durable state file per room
    pub state_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let dirs = project_dirs();
        Self {
            port: DEFAULT_PORT,
            audio_dir: dirs
                .as_ref()
                .map(|d| d.data_dir().join("audio"))
                .unwrap_or_else(|| PathBuf::from("audio")),
            state_dir: dirs
                .as_ref()
                .map(|d| d.data_dir().join("rooms"))
                .unwrap_or_else(|| PathBuf::from("rooms")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub server: String,
    pub room: Option<String>,
    pub name: String,
    /// SQLite file for cached tracks
    pub cache_db: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", DEFAULT_PORT),
            room: None,
            name: default_name(),
            cache_db: project_dirs()
                .map(|d| d.cache_dir().join("tracks.db"))
                .unwrap_or_else(|| PathBuf::from("tracks.db")),
        }
    }
}

fn default_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("guest-{}", &id[..6])
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|d| d.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path` (or the default location), then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);
        let mut config = match &path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading config");
                Self::parse(&std::fs::read_to_string(path)?)?
            }
            _ => {
                debug!("No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `UNISON_*` overrides looked up through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = var("UNISON_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| AppError::Config(format!("UNISON_PORT is not a port: {}", port)))?;
        }
        if let Some(dir) = var("UNISON_AUDIO_DIR") {
            self.server.audio_dir = dir.into();
        }
        if let Some(dir) = var("UNISON_STATE_DIR") {
            self.server.state_dir = dir.into();
        }
        if let Some(db) = var("UNISON_CACHE_DB") {
            self.client.cache_db = db.into();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [server]
            port = 9000
            audio_dir = "/srv/music"

            [client]
            room = "abcdef"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.audio_dir, PathBuf::from("/srv/music"));
        assert_eq!(config.server.state_dir, ServerConfig::default().state_dir);
        assert_eq!(config.client.room.as_deref(), Some("abcdef"));
        assert!(config.client.name.starts_with("guest-"));
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("UNISON_PORT", "7400"),
            ("UNISON_STATE_DIR", "/var/lib/unison"),
            ("UNISON_CACHE_DB", "/tmp/tracks.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::parse("[server]\nport = 9000\n").unwrap();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 7400);
        assert_eq!(config.server.state_dir, PathBuf::from("/var/lib/unison"));
        assert_eq!(config.client.cache_db, PathBuf::from("/tmp/tracks.db"));
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "UNISON_PORT").then(|| "loud".to_string()));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unison.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(AppError::Toml(_))));
    }
}
