//! Typed node configuration
//!
//! Loaded from a JSON file with camelCase keys and validated once at startup.
//! Any validation failure is fatal.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::ApiDefinition;
use crate::error::{Error, Result};
use crate::identity::PrivateKeyInput;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub wallet: WalletConfig,
    pub token: TokenConfig,
    pub aggregators: Vec<String>,
    pub solana: SolanaConfig,

    #[serde(default)]
    pub provider: Option<ProviderConfig>,

    #[serde(default)]
    pub registrar: RegistrarConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub address: String,
    pub private_key: PrivateKeyInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub mint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolanaConfig {
    pub network: String,
    pub rpc_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Status API port. An explicit `null` leaves it unset.
    #[serde(default = "default_port")]
    pub port: Option<u16>,

    #[serde(default)]
    pub http_disabled: bool,

    #[serde(default)]
    pub public_endpoint: Option<String>,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub results: ResultsConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub apis: Vec<ApiDefinition>,
}

impl ProviderConfig {
    pub fn http_enabled(&self) -> bool {
        !self.http_disabled
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Announced multiaddresses, used when no live transport handle is wired in
    #[serde(default)]
    pub multiaddrs: Vec<String>,
}

/// Ledger backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// One of `json`, `file`, `sqlite`, `redis`
    #[serde(rename = "type", default = "default_database_type")]
    pub kind: String,

    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Connection URL for network backends
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: default_database_type(),
            path: default_database_path(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsConfig {
    #[serde(default = "default_results_path")]
    pub storage_path: PathBuf,

    /// Base URL results are served under; defaults to `{publicEndpoint}/results`
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_results_path(),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: default_code_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl QueueConfig {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Registration and heartbeat timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrarConfig {
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Re-register a pair after this many consecutive heartbeat failures.
    /// `None` keeps the base behaviour of never re-registering.
    #[serde(default)]
    pub reregister_after_failures: Option<u32>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            registration_timeout_secs: default_registration_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reregister_after_failures: None,
        }
    }
}

impl RegistrarConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn default_port() -> Option<u16> {
    Some(3000)
}

fn default_database_type() -> String {
    "json".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/ledger.json")
}

fn default_results_path() -> PathBuf {
    PathBuf::from("./data/results")
}

fn default_code_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_registration_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

impl NodeConfig {
    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.wallet.address.trim().is_empty() {
            return Err(Error::Config("wallet.address is required".to_string()));
        }

        match &self.wallet.private_key {
            PrivateKeyInput::Bytes(b) if b.is_empty() => {
                return Err(Error::Config("wallet.privateKey is required".to_string()));
            }
            PrivateKeyInput::Text(t) if t.trim().is_empty() => {
                return Err(Error::Config("wallet.privateKey is required".to_string()));
            }
            _ => {}
        }

        if self.token.symbol.is_empty() || self.token.mint.is_empty() {
            return Err(Error::Config("token.symbol and token.mint are required".to_string()));
        }

        if self.solana.network.is_empty() || self.solana.rpc_url.is_empty() {
            return Err(Error::Config(
                "solana.network and solana.rpcUrl are required".to_string(),
            ));
        }

        if self.aggregators.is_empty() {
            return Err(Error::NoAggregators);
        }

        for url in &self.aggregators {
            if !is_http_url(url) {
                return Err(Error::Config(format!("aggregator is not an http(s) URL: {}", url)));
            }
        }

        if self.registrar.heartbeat_interval_secs == 0
            || self.registrar.heartbeat_timeout_secs == 0
            || self.registrar.registration_timeout_secs == 0
        {
            return Err(Error::Config("registrar intervals must be greater than 0".to_string()));
        }

        if self.registrar.heartbeat_timeout_secs >= self.registrar.heartbeat_interval_secs {
            warn!(
                "registrar.heartbeatTimeoutSecs ({}) is not below heartbeatIntervalSecs ({}); heartbeats may overlap",
                self.registrar.heartbeat_timeout_secs, self.registrar.heartbeat_interval_secs
            );
        }

        if let Some(provider) = &self.provider {
            provider.validate()?;
        }

        Ok(())
    }

    pub fn apis(&self) -> Vec<ApiDefinition> {
        self.provider
            .as_ref()
            .map(|p| p.apis.clone())
            .unwrap_or_default()
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<()> {
        if self.http_enabled() && self.port.unwrap_or(0) == 0 {
            return Err(Error::Config(
                "provider.port is required unless httpDisabled is set".to_string(),
            ));
        }

        if self.http_enabled() && !self.p2p.enabled {
            match &self.public_endpoint {
                Some(endpoint) if is_http_url(endpoint) => {}
                Some(endpoint) => {
                    return Err(Error::Config(format!(
                        "provider.publicEndpoint is not an http(s) URL: {}",
                        endpoint
                    )));
                }
                None => {
                    return Err(Error::Config(
                        "provider.publicEndpoint is required unless P2P is enabled or HTTP is disabled"
                            .to_string(),
                    ));
                }
            }
        }

        if self.database.kind.is_empty() {
            return Err(Error::Config("provider.database.type is required".to_string()));
        }

        if self.results.storage_path.as_os_str().is_empty() {
            return Err(Error::Config(
                "provider.results.storagePath is required".to_string(),
            ));
        }

        if self.queue.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "provider.queue.sweepIntervalSecs must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for api in &self.apis {
            if api.id.trim().is_empty() {
                return Err(Error::Config("API id must not be empty".to_string()));
            }
            // Ids travel unescaped in aggregator and status API paths
            if !is_valid_api_id(&api.id) {
                return Err(Error::Config(format!(
                    "API id may only contain letters, digits, '.', '_' and '-': {}",
                    api.id
                )));
            }
            if !seen.insert(api.id.as_str()) {
                return Err(Error::Config(format!("duplicate API id: {}", api.id)));
            }
        }

        Ok(())
    }

    /// URL under which saved results are reachable
    pub fn results_base_url(&self) -> Option<String> {
        self.results.public_base_url.clone().or_else(|| {
            self.public_endpoint
                .as_ref()
                .map(|e| format!("{}/results", e.trim_end_matches('/')))
        })
    }
}

fn is_valid_api_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
