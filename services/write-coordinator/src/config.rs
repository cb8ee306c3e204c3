//! Write-coordinator configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/write-coordinator/config.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `node.name`
//! - `node.own_pool`
//! - `pools.count`

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WriteCoordinatorConfig {
    pub schema_version: u32,
    pub node: NodeConfig,
    pub pools: PoolsConfig,
    pub time_precision: TimePrecisionToml,
    pub http: HttpConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub own_pool: u16,
}

#[derive(Debug, Clone)]
pub struct PoolsConfig {
    pub count: u16,
}

#[derive(Debug, Clone)]
pub struct TimePrecisionToml {
    /// One of `"seconds"`, `"millis"`, `"micros"`, `"nanos"`.
    pub unit: String,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    pub peer_timeout_ms: u64,
}

/// A peer pool this node forwards non-local inserts to.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub pool: u16,
    pub base_url: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node: Option<RawNodeConfig>,
    pools: Option<RawPoolsConfig>,
    time_precision: Option<RawTimePrecision>,
    http: Option<RawHttpConfig>,
    #[serde(default)]
    peers: Vec<RawPeerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNodeConfig {
    name: Option<String>,
    own_pool: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawPoolsConfig {
    count: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawTimePrecision {
    unit: Option<String>,
    min: Option<i64>,
    max: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawHttpConfig {
    bind: Option<String>,
    peer_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPeerConfig {
    pool: u16,
    base_url: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "/etc/write-coordinator/config.toml";

pub fn load_config_from_path(path: &Path) -> Result<WriteCoordinatorConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&text)
}

pub fn load_config() -> Result<WriteCoordinatorConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from_str(toml_str: &str) -> Result<WriteCoordinatorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "unsupported schema_version {schema_version}"
        )));
    }

    let raw_node = raw.node.ok_or_else(|| ConfigError::MissingField("node".to_owned()))?;
    let node = NodeConfig {
        name: raw_node
            .name
            .ok_or_else(|| ConfigError::MissingField("node.name".to_owned()))?,
        own_pool: raw_node
            .own_pool
            .ok_or_else(|| ConfigError::MissingField("node.own_pool".to_owned()))?,
    };

    let raw_pools = raw.pools.ok_or_else(|| ConfigError::MissingField("pools".to_owned()))?;
    let count = raw_pools
        .count
        .ok_or_else(|| ConfigError::MissingField("pools.count".to_owned()))?;
    if count == 0 {
        return Err(ConfigError::InvalidValue("pools.count must be at least 1".to_owned()));
    }
    if node.own_pool >= count {
        return Err(ConfigError::InvalidValue(format!(
            "node.own_pool {} is outside pools.count {}",
            node.own_pool, count
        )));
    }
    let pools = PoolsConfig { count };

    let time_precision = match raw.time_precision {
        Some(raw_tp) => TimePrecisionToml {
            unit: raw_tp.unit.unwrap_or_else(|| "seconds".to_owned()),
            min: raw_tp.min.unwrap_or(0),
            max: raw_tp.max.unwrap_or(i64::MAX),
        },
        None => TimePrecisionToml {
            unit: "seconds".to_owned(),
            min: 0,
            max: i64::MAX,
        },
    };

    let http = match raw.http {
        Some(raw_http) => HttpConfig {
            bind: raw_http.bind.unwrap_or_else(|| "0.0.0.0:7420".to_owned()),
            peer_timeout_ms: raw_http.peer_timeout_ms.unwrap_or(2_000),
        },
        None => HttpConfig {
            bind: "0.0.0.0:7420".to_owned(),
            peer_timeout_ms: 2_000,
        },
    };

    let peers = raw
        .peers
        .into_iter()
        .map(|p| PeerConfig {
            pool: p.pool,
            base_url: p.base_url,
        })
        .collect();

    Ok(WriteCoordinatorConfig {
        schema_version,
        node,
        pools,
        time_precision,
        http,
        peers,
    })
}

#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_valid_config() {
        let toml_str = r#"
            schema_version = 1
            [node]
            name = "node-a"
            own_pool = 0
            [pools]
            count = 2
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(cfg.node.own_pool, 0);
        assert_eq!(cfg.pools.count, 2);
        assert_eq!(cfg.time_precision.unit, "seconds");
        assert_eq!(cfg.http.bind, "0.0.0.0:7420");
    }

    #[test]
    fn rejects_own_pool_outside_pool_count() {
        let toml_str = r#"
            schema_version = 1
            [node]
            name = "node-a"
            own_pool = 5
            [pools]
            count = 2
        "#;
        assert!(matches!(
            load_config_from_str(toml_str),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn rejects_missing_node_name() {
        let toml_str = r#"
            schema_version = 1
            [node]
            own_pool = 0
            [pools]
            count = 1
        "#;
        assert!(matches!(
            load_config_from_str(toml_str),
            Err(ConfigError::MissingField(_))
        ));
    }
}
