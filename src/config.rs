//! Configuration loading and CLI merge.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub listen: ListenConfig,
    pub database: DatabaseConfig,
}

/// Server identity and protocol limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used as the source prefix of server-originated replies.
    pub name: String,
    /// Network name advertised in ISUPPORT.
    pub network: String,
    /// Server password. Empty disables the PASS check.
    pub password: Option<String>,
    /// Path to the MOTD file. Reloaded when its mtime changes.
    pub motd_file: Option<String>,
    pub log_format: LogFormat,
    /// Worker threads for the runtime.
    pub workers: usize,
    /// Concurrent connections allowed per peer IP.
    pub max_per_ip: u32,
    /// Seconds of silence before a connection is reaped.
    pub idle_timeout_secs: u64,
    /// Nickname length cap, in bytes after encoding.
    pub nick_max_len: usize,
    /// Channel name length cap, in bytes.
    pub channel_max_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "chatter.local".to_string(),
            network: "chatter".to_string(),
            password: None,
            motd_file: None,
            log_format: LogFormat::Pretty,
            workers: 4,
            max_per_ip: 10,
            idle_timeout_secs: 240,
            nick_max_len: chatter_proto::NICK_MAX_DEFAULT,
            channel_max_len: 64,
        }
    }
}

/// Listener ports.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address for both listeners.
    pub host: IpAddr,
    /// Raw TCP IRC port.
    pub port: u16,
    /// WebSocket IRC port. 0 disables the listener.
    pub ws_port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 6667,
            ws_port: 8200,
        }
    }
}

impl ListenConfig {
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ws_port)
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "chatterd.db".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults so the
    /// daemon can run from CLI flags alone.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let cfg = Config::default();
        assert_eq!(cfg.listen.port, 6667);
        assert_eq!(cfg.listen.ws_port, 8200);
        assert_eq!(cfg.server.workers, 4);
        assert_eq!(cfg.server.nick_max_len, 9);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            name = "irc.example.net"
            password = "hunter2"

            [listen]
            port = 6697
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.name, "irc.example.net");
        assert_eq!(cfg.server.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.listen.port, 6697);
        assert_eq!(cfg.listen.ws_port, 8200);
    }
}
