//! Registration of advertised APIs with every configured aggregator
//!
//! Each (aggregator, API) pair moves through
//! `Unregistered → Registered → (HeartbeatOk | HeartbeatFailed)*`.
//! One pair failing never stops the others from being attempted.

use provider_common::config::{NodeConfig, RegistrarConfig};
use provider_common::{ApiCatalog, ApiDefinition, Error, Identity, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::client::AggregatorClient;
use crate::transport::{resolve_endpoints, MultiaddrSource, ResolvedEndpoints, Transport};

/// Lifecycle of one (aggregator, API) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Unregistered,
    Registered,
    HeartbeatOk,
    HeartbeatFailed,
}

impl PairState {
    /// Whether heartbeats are sent for this pair
    pub fn is_registered(&self) -> bool {
        !matches!(self, PairState::Unregistered)
    }
}

/// Snapshot of one pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairStatus {
    pub aggregator: String,
    pub api_id: String,
    pub state: PairState,
    /// Consecutive heartbeat failures since the last success
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct PairEntry {
    state: PairState,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl PairEntry {
    fn new() -> Self {
        Self {
            state: PairState::Unregistered,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Registration body: the advertised API plus where and by whom it is served
#[derive(Debug, Serialize)]
pub struct RegistrationPayload<'a> {
    #[serde(flatten)]
    pub api: &'a ApiDefinition,
    pub endpoint: &'a str,
    pub endpoints: &'a [String],
    pub provider_address: &'a str,
    pub transport: Transport,
}

/// One API that could not be registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationFailure {
    pub api_id: String,
    pub error: String,
}

/// Outcome of the registration pass for one aggregator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorOutcome {
    pub aggregator: String,
    pub registered: Vec<String>,
    pub failed: Vec<RegistrationFailure>,
}

/// Per-aggregator summary of a registration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrationReport {
    pub aggregators: Vec<AggregatorOutcome>,
}

impl RegistrationReport {
    pub fn registered_count(&self) -> usize {
        self.aggregators.iter().map(|a| a.registered.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.aggregators.iter().map(|a| a.failed.len()).sum()
    }

    /// True when not a single pair registered; the node is unreachable
    pub fn all_failed(&self) -> bool {
        self.registered_count() == 0
    }
}

/// Registers the node's APIs and tracks every (aggregator, API) pair
pub struct Registrar {
    pub(crate) config: RegistrarConfig,
    aggregators: Vec<String>,
    identity: Arc<Identity>,
    catalog: Arc<dyn ApiCatalog>,
    p2p: Option<Arc<dyn MultiaddrSource>>,
    http_enabled: bool,
    public_endpoint: Option<String>,
    pub(crate) client: Arc<dyn AggregatorClient>,
    pairs: Mutex<BTreeMap<(String, String), PairEntry>>,
    registration_complete: AtomicBool,
}

impl Registrar {
    /// Create a registrar. Fails with [`Error::NoAggregators`] when there is
    /// nobody to register with.
    pub fn new(
        config: &NodeConfig,
        identity: Arc<Identity>,
        catalog: Arc<dyn ApiCatalog>,
        p2p: Option<Arc<dyn MultiaddrSource>>,
        client: Arc<dyn AggregatorClient>,
    ) -> Result<Self> {
        if config.aggregators.is_empty() {
            return Err(Error::NoAggregators);
        }

        let (http_enabled, public_endpoint) = match &config.provider {
            Some(provider) => (provider.http_enabled(), provider.public_endpoint.clone()),
            None => (false, None),
        };

        Ok(Self {
            config: config.registrar.clone(),
            aggregators: config.aggregators.clone(),
            identity,
            catalog,
            p2p,
            http_enabled,
            public_endpoint,
            client,
            pairs: Mutex::new(BTreeMap::new()),
            registration_complete: AtomicBool::new(false),
        })
    }

    pub fn aggregators(&self) -> &[String] {
        &self.aggregators
    }

    pub fn provider_address(&self) -> &str {
        self.identity.public_address()
    }

    /// Whether the initial pass has attempted every pair
    pub fn registration_complete(&self) -> bool {
        self.registration_complete.load(Ordering::SeqCst)
    }

    /// Register every advertised API with every aggregator, one call per pair.
    ///
    /// Never aborts early: each failure is logged and reported, then the next
    /// pair is attempted.
    pub async fn register_all(&self) -> RegistrationReport {
        let apis = self.catalog.list_apis();
        info!(
            "Registering {} API(s) with {} aggregator(s) as {}",
            apis.len(),
            self.aggregators.len(),
            self.provider_address()
        );

        {
            let mut pairs = self.pairs();
            for aggregator in &self.aggregators {
                for api in &apis {
                    pairs
                        .entry((aggregator.clone(), api.id.clone()))
                        .or_insert_with(PairEntry::new);
                }
            }
        }

        let mut report = RegistrationReport::default();
        for aggregator in &self.aggregators {
            let mut outcome = AggregatorOutcome {
                aggregator: aggregator.clone(),
                ..Default::default()
            };

            for api in &apis {
                match self.register_api(aggregator, api).await {
                    Ok(()) => outcome.registered.push(api.id.clone()),
                    Err(e) => outcome.failed.push(RegistrationFailure {
                        api_id: api.id.clone(),
                        error: e.to_string(),
                    }),
                }
            }

            info!(
                "Aggregator {}: {} registered, {} failed",
                aggregator,
                outcome.registered.len(),
                outcome.failed.len()
            );
            report.aggregators.push(outcome);
        }

        self.registration_complete.store(true, Ordering::SeqCst);

        if report.all_failed() {
            error!("Registration failed with every aggregator; node is unreachable");
        }

        report
    }

    /// Register one API with one aggregator and record the pair's new state
    pub async fn register_api(&self, aggregator: &str, api: &ApiDefinition) -> Result<()> {
        let result = self.send_registration(aggregator, api).await;

        match &result {
            Ok(()) => {
                info!("Registered {} with {}", api.id, aggregator);
                self.update_pair(aggregator, &api.id, |entry| {
                    entry.state = PairState::Registered;
                    entry.consecutive_failures = 0;
                    entry.last_error = None;
                });
            }
            Err(e) => {
                warn!("Failed to register {} with {}: {}", api.id, aggregator, e);
                let message = e.to_string();
                self.update_pair(aggregator, &api.id, |entry| {
                    entry.state = PairState::Unregistered;
                    entry.last_error = Some(message);
                });
            }
        }

        result
    }

    async fn send_registration(&self, aggregator: &str, api: &ApiDefinition) -> Result<()> {
        let resolved = self.resolve(&api.id)?;

        let payload = RegistrationPayload {
            api,
            endpoint: &resolved.endpoint,
            endpoints: &resolved.endpoints,
            provider_address: self.provider_address(),
            transport: resolved.transport,
        };

        // Sign the exact bytes that go on the wire
        let body = serde_json::to_vec(&payload)?;
        let signature = self.identity.sign_base64(&body);

        debug!(
            "Sending registration for {} to {} ({} bytes, transport {})",
            api.id,
            aggregator,
            body.len(),
            resolved.transport
        );

        let timeout = self.config.registration_timeout();
        tokio::time::timeout(
            timeout,
            self.client
                .register(aggregator, body, self.provider_address(), &signature),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))?
    }

    /// Resolve the endpoints an API is advertised under
    pub fn resolve(&self, api_id: &str) -> Result<ResolvedEndpoints> {
        resolve_endpoints(
            api_id,
            self.p2p.as_deref(),
            self.http_enabled,
            self.public_endpoint.as_deref(),
        )
    }

    /// Current state of every known pair, ordered by aggregator then API
    pub fn states(&self) -> Vec<PairStatus> {
        self.pairs()
            .iter()
            .map(|((aggregator, api_id), entry)| PairStatus {
                aggregator: aggregator.clone(),
                api_id: api_id.clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    /// Pairs that heartbeats go to
    pub(crate) fn registered_pairs(&self) -> Vec<(String, String)> {
        self.pairs()
            .iter()
            .filter(|(_, entry)| entry.state.is_registered())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn find_api(&self, api_id: &str) -> Option<ApiDefinition> {
        self.catalog.list_apis().into_iter().find(|api| api.id == api_id)
    }

    /// Apply `f` to a pair's entry, returning the failure count afterwards
    pub(crate) fn update_pair(
        &self,
        aggregator: &str,
        api_id: &str,
        f: impl FnOnce(&mut PairEntry),
    ) -> u32 {
        let mut pairs = self.pairs();
        let entry = pairs
            .entry((aggregator.to_string(), api_id.to_string()))
            .or_insert_with(PairEntry::new);
        f(entry);
        entry.consecutive_failures
    }

    fn pairs(&self) -> MutexGuard<'_, BTreeMap<(String, String), PairEntry>> {
        // Entries stay consistent even if a holder panicked
        self.pairs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PairEntry {
    pub(crate) fn heartbeat_ok(&mut self) {
        self.state = PairState::HeartbeatOk;
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    pub(crate) fn heartbeat_failed(&mut self, error: String) {
        self.state = PairState::HeartbeatFailed;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error);
    }

    pub(crate) fn reregister_failed(&mut self) {
        self.state = PairState::HeartbeatFailed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider_common::PrivateKeyInput;
    use serde_json::json;

    fn config() -> NodeConfig {
        NodeConfig::from_json(
            &json!({
                "wallet": { "address": "unused", "privateKey": "unused" },
                "token": { "symbol": "USDC", "mint": "mint" },
                "aggregators": ["https://agg.example"],
                "solana": { "network": "devnet", "rpcUrl": "https://rpc.example" },
                "provider": {
                    "port": 3000,
                    "publicEndpoint": "https://node.example",
                    "apis": [{ "id": "echo", "pricing": { "amount": 10 } }]
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_payload_shape() {
        let api: ApiDefinition = serde_json::from_value(json!({
            "id": "echo",
            "pricing": { "amount": 10 },
            "category": "utility"
        }))
        .unwrap();
        let endpoints = vec!["https://node.example".to_string()];
        let payload = RegistrationPayload {
            api: &api,
            endpoint: &endpoints[0],
            endpoints: &endpoints,
            provider_address: "ADDR",
            transport: Transport::Http,
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["id"], "echo");
        assert_eq!(value["pricing"]["amount"], 10);
        assert_eq!(value["category"], "utility");
        assert_eq!(value["endpoint"], "https://node.example");
        assert_eq!(value["endpoints"], json!(["https://node.example"]));
        assert_eq!(value["provider_address"], "ADDR");
        assert_eq!(value["transport"], "http");
    }

    #[test]
    fn test_report_all_failed() {
        let mut report = RegistrationReport::default();
        assert!(report.all_failed());

        report.aggregators.push(AggregatorOutcome {
            aggregator: "https://a".to_string(),
            registered: vec![],
            failed: vec![RegistrationFailure {
                api_id: "echo".to_string(),
                error: "boom".to_string(),
            }],
        });
        assert!(report.all_failed());

        report.aggregators.push(AggregatorOutcome {
            aggregator: "https://b".to_string(),
            registered: vec!["echo".to_string()],
            failed: vec![],
        });
        assert!(!report.all_failed());
        assert_eq!(report.registered_count(), 1);
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn test_requires_aggregators() {
        let mut config = config();
        config.aggregators.clear();

        let identity = Arc::new(Identity::from_input(&PrivateKeyInput::Bytes(vec![1; 32])).unwrap());
        let result = Registrar::new(
            &config,
            identity,
            Arc::new(config.apis()),
            None,
            Arc::new(crate::client::HttpAggregatorClient::new()),
        );
        assert!(matches!(result, Err(Error::NoAggregators)));
    }

    #[test]
    fn test_failure_counter() {
        let mut entry = PairEntry::new();
        entry.heartbeat_failed("timeout".to_string());
        entry.heartbeat_failed("timeout".to_string());
        assert_eq!(entry.consecutive_failures, 2);
        assert_eq!(entry.state, PairState::HeartbeatFailed);
        assert!(entry.state.is_registered());

        entry.heartbeat_ok();
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.last_error, None);
    }
}
