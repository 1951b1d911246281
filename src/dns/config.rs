//! configuration file loading
//!
//! The server is configured through a JSON file; every field has a default
//! so a minimal deployment only needs to name the upstream resolver and
//! the rule file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use derive_more::{Display, Error, From};
use serde_derive::Deserialize;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            ip: "8.8.8.8".to_string(),
            port: 53,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub local_ip: String,
    pub local_port: u16,
    pub upstream: UpstreamConfig,
    /// TTL stamped on override answers; also the ceiling applied to TTLs
    /// learned from upstream responses.
    pub cache_ttl: u32,
    pub cache_size: usize,
    /// Seconds between cache sweeps.
    pub sweep_interval: u64,
    pub workers: usize,
    /// Answer blackholed names with NXDOMAIN instead of a null address.
    pub blackhole_nxdomain: bool,
    pub database_file: String,
    pub log_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            local_ip: "0.0.0.0".to_string(),
            local_port: 53,
            upstream: UpstreamConfig::default(),
            cache_ttl: 3600,
            cache_size: 1000,
            sweep_interval: 30,
            workers: 64,
            blackhole_nxdomain: false,
            database_file: "dns_rules.txt".to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<ServerConfig> {
        let file = File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();

        assert_eq!("0.0.0.0", config.local_ip);
        assert_eq!(53, config.local_port);
        assert_eq!("8.8.8.8", config.upstream.ip);
        assert_eq!(3600, config.cache_ttl);
        assert_eq!(1000, config.cache_size);
        assert_eq!(64, config.workers);
        assert!(!config.blackhole_nxdomain);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "local_port": 5353,
                "upstream": {{ "ip": "10.3.9.4" }},
                "database_file": "/etc/compass/rules.txt"
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();

        assert_eq!(5353, config.local_port);
        assert_eq!("10.3.9.4", config.upstream.ip);
        assert_eq!(53, config.upstream.port);
        assert_eq!("/etc/compass/rules.txt", config.database_file);
        assert_eq!(3600, config.cache_ttl);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "local_port = 53").unwrap();

        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServerConfig::from_file(Path::new("/nonexistent/config.json")).is_err());
    }
}
