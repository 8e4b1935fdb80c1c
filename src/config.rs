//! JSON configuration for the binaries. Keys travel base64-encoded.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_log_level() -> String {
    "info".to_string()
}

fn default_message() -> String {
    "hello faketcp".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_max_fragment_len() -> usize {
    1400
}

fn default_reassembly_timeout_secs() -> u64 {
    5
}

/// FakeTCP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub psk_base64: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// FakeTCP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_addr: String,
    pub psk_base64: String,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// ICMP tunnel settings, shared by both tunnel modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Address the tunnel client pings (port ignored on raw sockets).
    pub server_ip: String,
    /// UDP endpoint the tunnel server forwards to.
    pub backend_addr: String,
    /// 16-byte AES key, base64.
    pub tunnel_key_base64: String,
    #[serde(default = "default_max_fragment_len")]
    pub max_fragment_len: usize,
    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Loads a configuration from a JSON file.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::ConfigError(format!("failed to parse {}: {}", path.display(), e)))?;
    info!("loaded config from {}", path.display());
    Ok(config)
}

/// Decodes a base64 key field.
pub fn decode_key(b64: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| Error::ConfigError(format!("invalid base64 key: {}", e)))
}

pub const FAKETCP_SERVER_CONFIG_EXAMPLE: &str = r#"{
  "listen_addr": "0.0.0.0:4000",
  "psk_base64": "c3VwZXJzZWNyZXRrZXkxMjM=",
  "idle_timeout_secs": 60,
  "log_level": "info"
}"#;

pub const FAKETCP_CLIENT_CONFIG_EXAMPLE: &str = r#"{
  "server_addr": "127.0.0.1:4000",
  "psk_base64": "c3VwZXJzZWNyZXRrZXkxMjM=",
  "message": "hello faketcp",
  "log_level": "info"
}"#;

pub const ICMP_TUNNEL_CONFIG_EXAMPLE: &str = r#"{
  "server_ip": "127.0.0.1",
  "backend_addr": "127.0.0.1:9001",
  "tunnel_key_base64": "MDEyMzQ1Njc4OWFiY2RlZg==",
  "max_fragment_len": 1400,
  "reassembly_timeout_secs": 5,
  "message": "ping through the tunnel",
  "log_level": "info"
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn examples_parse() {
        let server: ServerConfig = serde_json::from_str(FAKETCP_SERVER_CONFIG_EXAMPLE).unwrap();
        assert_eq!(decode_key(&server.psk_base64).unwrap(), b"supersecretkey123");

        let client: ClientConfig = serde_json::from_str(FAKETCP_CLIENT_CONFIG_EXAMPLE).unwrap();
        assert_eq!(client.server_addr, "127.0.0.1:4000");

        let tunnel: TunnelConfig = serde_json::from_str(ICMP_TUNNEL_CONFIG_EXAMPLE).unwrap();
        assert_eq!(decode_key(&tunnel.tunnel_key_base64).unwrap(), b"0123456789abcdef");
        assert_eq!(tunnel.max_fragment_len, 1400);
    }

    #[test]
    fn defaults_fill_in() {
        let cfg: ServerConfig = serde_json::from_str(
            r#"{"listen_addr": ":4000", "psk_base64": "c3VwZXJzZWNyZXRrZXkxMjM="}"#,
        )
        .unwrap();
        assert_eq!(cfg.idle_timeout_secs, 60);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn bad_base64_rejected() {
        assert!(matches!(decode_key("not base64!!!"), Err(Error::ConfigError(_))));
    }
}
