use std::collections::{HashMap, HashSet};
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use super::types::{Config, ServerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no servers defined in configuration")]
    NoServers,
}

/// Loads and validates a YAML configuration file.
///
/// Conflicting `(host, port, server_name)` triples are dropped with a
/// warning rather than treated as a hard error, matching thttpd's
/// historical tolerance for partially-bad virtual-host setups.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = serde_yaml::from_str(&text)?;
    if config.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    Ok(Config {
        servers: validate_configs(config.servers),
    })
}

/// Drops servers whose `(host, port, server_name)` triple collides with
/// another server, and servers that mix a wildcard bind (`0.0.0.0`) with a
/// specific address on the same port (the bind would fail at `listen`
/// time anyway).
pub fn validate_configs(configs: Vec<ServerConfig>) -> Vec<ServerConfig> {
    let mut conflict_indices = HashSet::new();

    let mut usage_map: HashMap<(String, u16, String), Vec<usize>> = HashMap::new();
    for (idx, config) in configs.iter().enumerate() {
        for port in &config.ports {
            let key = (config.host.clone(), *port, config.server_name.clone());
            usage_map.entry(key).or_default().push(idx);
        }
    }
    for ((host, port, server_name), indices) in usage_map {
        if indices.len() > 1 {
            warn!(
                host, port, server_name, "duplicate server binding, dropping conflicting entries"
            );
            conflict_indices.extend(indices);
        }
    }

    let mut port_hosts: HashMap<u16, HashSet<String>> = HashMap::new();
    for config in &configs {
        for port in &config.ports {
            port_hosts.entry(*port).or_default().insert(config.host.clone());
        }
    }
    for (port, hosts) in port_hosts {
        if hosts.contains("0.0.0.0") && hosts.len() > 1 {
            warn!(port, ?hosts, "wildcard bind conflicts with specific host on same port");
            for (idx, config) in configs.iter().enumerate() {
                if config.ports.contains(&port) {
                    conflict_indices.insert(idx);
                }
            }
        }
    }

    configs
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !conflict_indices.contains(idx))
        .map(|(_, c)| c)
        .collect()
}
