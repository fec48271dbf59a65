// Configuration management for the ashdht CLI
//
// JSON file in the platform config directory:
// - Linux: ~/.config/ashdht/config.json
// - macOS: ~/Library/Application Support/ashdht/config.json
// - Windows: %APPDATA%\ashdht\config.json
//
// Per key: command line flag, then environment variable, then file, then
// default. The file is created with defaults on first use.

use anyhow::{Context, Result};
use ashdht_core::rendezvous::DEFAULT_BOOTSTRAP_TOKEN;
use ashdht_core::store::NODELIST_FILE;
use ashdht_core::Role;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "ashdht";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub irc_server: String,
    pub irc_port: u16,
    pub irc_tls: bool,
    pub channel: String,

    /// `bot` answers bootstrap requests, `client` sends them
    pub mode: Role,

    pub bootstrap_command: String,

    /// UDP port for the overlay, forwarded on the gateway
    pub port: u16,

    pub debug: bool,

    /// Node list location; defaults to the data directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_list_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            irc_server: "irc.libera.chat".to_string(),
            irc_port: 6697,
            irc_tls: true,
            channel: "#soulfire".to_string(),
            mode: Role::Responder,
            bootstrap_command: DEFAULT_BOOTSTRAP_TOKEN.to_string(),
            port: random_port(),
            debug: false,
            node_list_path: None,
        }
    }
}

/// Fresh installs pick their overlay port from 50000..=60000
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(50000..=60000)
}

fn parse_truthy(value: &str) -> Result<bool, std::convert::Infallible> {
    Ok(matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    ))
}

/// Flags that override the config file. Each one also reads its
/// environment variable when the flag is absent.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// IRC server hostname
    #[arg(long, env = "IRC_SERVER")]
    pub irc_server: Option<String>,

    /// IRC server port
    #[arg(long, env = "IRC_PORT")]
    pub irc_port: Option<u16>,

    /// Use TLS for the IRC connection
    #[arg(long, env = "IRC_TLS", value_parser = BoolishValueParser::new())]
    pub irc_tls: Option<bool>,

    /// Rendezvous channel
    #[arg(long, env = "IRC_CHANNEL")]
    pub channel: Option<String>,

    /// Role: bot or client
    #[arg(long, env = "MODE")]
    pub mode: Option<Role>,

    /// Overlay UDP port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Bootstrap request token
    #[arg(long, env = "BOOTSTRAP_COMMAND")]
    pub bootstrap_command: Option<String>,

    /// Verbose logging. `DEBUG` counts when it is 1, true or yes.
    #[arg(long, env = "DEBUG", action = ArgAction::SetTrue, value_parser = parse_truthy)]
    pub debug: bool,
}

impl ConfigOverrides {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(v) = self.irc_server {
            config.irc_server = v;
        }
        if let Some(v) = self.irc_port {
            config.irc_port = v;
        }
        if let Some(v) = self.irc_tls {
            config.irc_tls = v;
        }
        if let Some(v) = self.channel {
            config.channel = v;
        }
        if let Some(v) = self.mode {
            config.mode = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.bootstrap_command {
            config.bootstrap_command = v;
        }
        config.debug |= self.debug;
        config
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join(APP_DIR))
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        Ok(dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join(APP_DIR))
    }

    /// `--config` if given, else the default location
    pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path),
            None => Ok(Self::config_dir()?.join("config.json")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn node_list_path(&self) -> Result<PathBuf> {
        match &self.node_list_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join(NODELIST_FILE)),
        }
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "irc_server" => self.irc_server = value.to_string(),
            "irc_port" => self.irc_port = value.parse().context("Invalid port number")?,
            "irc_tls" => self.irc_tls = value.parse().context("Invalid boolean value")?,
            "channel" => self.channel = value.to_string(),
            "mode" => self.mode = value.parse().map_err(anyhow::Error::msg)?,
            "bootstrap_command" => {
                if value.trim().is_empty() || value.contains(char::is_whitespace) {
                    anyhow::bail!("Bootstrap command must be a single word");
                }
                self.bootstrap_command = value.to_string();
            }
            "port" => self.port = value.parse().context("Invalid port number")?,
            "debug" => self.debug = value.parse().context("Invalid boolean value")?,
            "node_list_path" => {
                self.node_list_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "irc_server" => Some(self.irc_server.clone()),
            "irc_port" => Some(self.irc_port.to_string()),
            "irc_tls" => Some(self.irc_tls.to_string()),
            "channel" => Some(self.channel.clone()),
            "mode" => Some(self.mode.to_string()),
            "bootstrap_command" => Some(self.bootstrap_command.clone()),
            "port" => Some(self.port.to_string()),
            "debug" => Some(self.debug.to_string()),
            "node_list_path" => self.node_list_path.as_ref().map(|p| p.display().to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("irc_server".to_string(), self.irc_server.clone()),
            ("irc_port".to_string(), self.irc_port.to_string()),
            ("irc_tls".to_string(), self.irc_tls.to_string()),
            ("channel".to_string(), self.channel.clone()),
            ("mode".to_string(), self.mode.to_string()),
            ("bootstrap_command".to_string(), self.bootstrap_command.clone()),
            ("port".to_string(), self.port.to_string()),
            ("debug".to_string(), self.debug.to_string()),
            (
                "node_list_path".to_string(),
                self.node_list_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.irc_server, "irc.libera.chat");
        assert_eq!(config.irc_port, 6697);
        assert!(config.irc_tls);
        assert_eq!(config.channel, "#soulfire");
        assert_eq!(config.mode, Role::Responder);
        assert_eq!(config.bootstrap_command, "!bootstrap");
        assert!((50000..=60000).contains(&config.port));
        assert!(!config.debug);
    }

    #[test]
    fn test_first_load_creates_file_and_keeps_port() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let first = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let second = Config::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mode": "client", "port": 51234}"#).unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.mode, Role::Acquirer);
        assert_eq!(config.port, 51234);
        assert_eq!(config.channel, "#soulfire");
    }

    #[test]
    fn test_set_get() {
        let mut config = Config::default();
        config.set("mode", "client").unwrap();
        config.set("port", "55555").unwrap();
        config.set("irc_tls", "false").unwrap();

        assert_eq!(config.get("mode").as_deref(), Some("client"));
        assert_eq!(config.get("port").as_deref(), Some("55555"));
        assert_eq!(config.get("irc_tls").as_deref(), Some("false"));
        assert!(config.get("node_list_path").is_none());

        assert!(config.set("port", "70000").is_err());
        assert!(config.set("mode", "server").is_err());
        assert!(config.set("bootstrap_command", "two words").is_err());
        assert!(config.set("nope", "x").is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = Config {
            channel: "#from-file".to_string(),
            port: 51000,
            ..Config::default()
        };
        let overrides = ConfigOverrides {
            channel: Some("#from-flag".to_string()),
            mode: Some(Role::Acquirer),
            ..ConfigOverrides::default()
        };

        let config = overrides.apply(file);
        assert_eq!(config.channel, "#from-flag");
        assert_eq!(config.mode, Role::Acquirer);
        assert_eq!(config.port, 51000);
    }

    #[test]
    fn test_node_list_path_override() {
        let mut config = Config::default();
        config.set("node_list_path", "/tmp/peers.txt").unwrap();
        assert_eq!(config.node_list_path().unwrap(), PathBuf::from("/tmp/peers.txt"));
    }
}
