use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// WialonIPS tracker listener
    #[serde(default)]
    pub wialon: ListenerConfig,
    /// EGTS tracker listener
    #[serde(default)]
    pub egts: ListenerConfig,
    /// Reference data files
    pub datasource: DatasourceConfig,
    /// Mapping services to push enriched snapshots to
    #[serde(default)]
    pub mapping: Vec<MappingConfig>,
    /// Raw fix relay to a remote ingestion endpoint
    #[serde(default)]
    pub relay: Option<RelayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "ListenerConfig::default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: Self::default_listen_addr(),
        }
    }
}

impl ListenerConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:0".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    #[serde(default = "DatasourceConfig::default_routes_file")]
    pub routes_file: String,
    #[serde(default = "DatasourceConfig::default_vehicles_file")]
    pub vehicles_file: String,
    #[serde(default = "DatasourceConfig::default_schedules_file")]
    pub schedules_file: String,
}

impl DatasourceConfig {
    fn default_routes_file() -> String {
        "./datasource/routes.txt".to_string()
    }
    fn default_vehicles_file() -> String {
        "./datasource/vehicles.txt".to_string()
    }
    fn default_schedules_file() -> String {
        "./datasource/schedules.txt".to_string()
    }
}

/// One external mapping service endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    /// Name used in logs (e.g. "yandex", "2gis")
    pub name: String,
    /// Client identifier assigned by the mapping service
    pub client_id: String,
    pub url: String,
    /// Gzip the XML payload and switch to multipart encoding
    #[serde(default)]
    pub compressed: bool,
    /// Which of the route's external numbers this endpoint is keyed by
    #[serde(default)]
    pub route_number: RouteNumberSource,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteNumberSource {
    #[default]
    Yandex,
    TwoGis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Remote ingestion endpoint, host:port
    pub addr: String,
    /// Source tag attached to every forwarded fix
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
