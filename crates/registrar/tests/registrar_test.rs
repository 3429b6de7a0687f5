//! Registration and heartbeat behaviour against an in-process aggregator mock

use async_trait::async_trait;
use base64::Engine;
use provider_common::{Error, Identity, NodeConfig, PrivateKeyInput, Result};
use provider_registrar::{AggregatorClient, MultiaddrSource, PairState, Registrar, StaticMultiaddrs};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const AGG_A: &str = "https://agg-a.example";
const AGG_B: &str = "https://agg-b.example";

#[derive(Debug, Clone)]
struct RegisterCall {
    aggregator: String,
    body: Vec<u8>,
    provider_address: String,
    signature: String,
}

/// Records every call; failures and hangs are configured per aggregator/API
#[derive(Default)]
struct MockAggregator {
    fail_register: HashSet<(String, String)>,
    hang_register: HashSet<String>,
    fail_heartbeat: HashSet<String>,
    hang_heartbeat: HashSet<String>,
    registers: Mutex<Vec<RegisterCall>>,
    heartbeats: Mutex<Vec<(String, String)>>,
}

impl MockAggregator {
    fn register_calls(&self) -> Vec<RegisterCall> {
        self.registers.lock().unwrap().clone()
    }

    fn heartbeat_calls(&self) -> Vec<(String, String)> {
        self.heartbeats.lock().unwrap().clone()
    }

    fn heartbeats_to(&self, aggregator: &str) -> usize {
        self.heartbeat_calls()
            .iter()
            .filter(|(agg, _)| agg == aggregator)
            .count()
    }
}

#[async_trait]
impl AggregatorClient for MockAggregator {
    async fn register(
        &self,
        aggregator_url: &str,
        body: Vec<u8>,
        provider_address: &str,
        signature: &str,
    ) -> Result<()> {
        let api_id = serde_json::from_slice::<Value>(&body).unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        self.registers.lock().unwrap().push(RegisterCall {
            aggregator: aggregator_url.to_string(),
            body,
            provider_address: provider_address.to_string(),
            signature: signature.to_string(),
        });

        if self.hang_register.contains(aggregator_url) {
            std::future::pending::<()>().await;
        }
        if self
            .fail_register
            .contains(&(aggregator_url.to_string(), api_id))
        {
            return Err(Error::AggregatorRejected {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        aggregator_url: &str,
        api_id: &str,
        _provider_address: &str,
    ) -> Result<()> {
        self.heartbeats
            .lock()
            .unwrap()
            .push((aggregator_url.to_string(), api_id.to_string()));

        if self.hang_heartbeat.contains(aggregator_url) {
            std::future::pending::<()>().await;
        }
        if self.fail_heartbeat.contains(aggregator_url) {
            return Err(Error::Http("connection refused".to_string()));
        }
        Ok(())
    }
}

fn node_config(provider: Value, registrar: Value) -> NodeConfig {
    NodeConfig::from_json(
        &json!({
            "wallet": { "address": "unused", "privateKey": "unused" },
            "token": { "symbol": "USDC", "mint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v" },
            "aggregators": [AGG_A, AGG_B],
            "solana": { "network": "devnet", "rpcUrl": "https://api.devnet.solana.com" },
            "provider": provider,
            "registrar": registrar
        })
        .to_string(),
    )
    .unwrap()
}

fn http_provider() -> Value {
    json!({
        "port": 3000,
        "publicEndpoint": "https://x",
        "apis": [
            { "id": "image-gen", "pricing": { "amount": 1000 } },
            { "id": "echo", "pricing": { "amount": 10 } }
        ]
    })
}

fn identity() -> Arc<Identity> {
    Arc::new(Identity::from_input(&PrivateKeyInput::Bytes(vec![42; 32])).unwrap())
}

fn registrar(config: &NodeConfig, client: Arc<MockAggregator>) -> Arc<Registrar> {
    let p2p: Option<Arc<dyn MultiaddrSource>> = config
        .provider
        .as_ref()
        .filter(|p| p.p2p.enabled)
        .map(|p| Arc::new(StaticMultiaddrs(p.p2p.multiaddrs.clone())) as Arc<dyn MultiaddrSource>);

    Arc::new(
        Registrar::new(config, identity(), Arc::new(config.apis()), p2p, client).unwrap(),
    )
}

/// Let spawned tasks run without moving the paused clock
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_partial_failure_isolation() {
    let config = node_config(http_provider(), json!({}));
    let client = Arc::new(MockAggregator {
        fail_register: [(AGG_A.to_string(), "image-gen".to_string())].into(),
        ..Default::default()
    });
    let registrar = registrar(&config, client.clone());

    let report = registrar.register_all().await;

    // Every pair was attempted despite the first one failing
    assert_eq!(client.register_calls().len(), 4);

    let a = &report.aggregators[0];
    assert_eq!(a.aggregator, AGG_A);
    assert_eq!(a.registered, vec!["echo".to_string()]);
    assert_eq!(a.failed.len(), 1);
    assert_eq!(a.failed[0].api_id, "image-gen");

    let b = &report.aggregators[1];
    assert_eq!(b.registered, vec!["image-gen".to_string(), "echo".to_string()]);
    assert!(b.failed.is_empty());

    assert!(!report.all_failed());
    assert!(registrar.registration_complete());

    let states = registrar.states();
    let failed_pair = states
        .iter()
        .find(|s| s.aggregator == AGG_A && s.api_id == "image-gen")
        .unwrap();
    assert_eq!(failed_pair.state, PairState::Unregistered);
    assert!(failed_pair.last_error.is_some());
    assert_eq!(
        states
            .iter()
            .filter(|s| s.state == PairState::Registered)
            .count(),
        3
    );
}

#[tokio::test]
async fn test_signature_covers_transmitted_bytes() {
    let config = node_config(http_provider(), json!({}));
    let client = Arc::new(MockAggregator::default());
    let registrar = registrar(&config, client.clone());
    let identity = identity();

    registrar.register_all().await;

    for call in client.register_calls() {
        assert_eq!(call.provider_address, identity.public_address());

        let signature: [u8; 64] = base64::engine::general_purpose::STANDARD
            .decode(&call.signature)
            .unwrap()
            .try_into()
            .unwrap();
        assert!(identity.verify(&call.body, &signature));

        let body: Value = serde_json::from_slice(&call.body).unwrap();
        assert_eq!(body["endpoint"], "https://x");
        assert_eq!(body["endpoints"], json!(["https://x"]));
        assert_eq!(body["transport"], "http");
        assert_eq!(body["provider_address"], identity.public_address());
        assert!(body["pricing"]["amount"].is_u64());
        assert!(call.aggregator == AGG_A || call.aggregator == AGG_B);
    }
}

#[tokio::test]
async fn test_p2p_endpoints_come_first() {
    let config = node_config(
        json!({
            "port": 3000,
            "publicEndpoint": "https://x",
            "p2p": { "enabled": true, "multiaddrs": ["/ip4/1.2.3.4/tcp/4001"] },
            "apis": [{ "id": "echo", "pricing": { "amount": 10 } }]
        }),
        json!({}),
    );
    let client = Arc::new(MockAggregator::default());
    registrar(&config, client.clone()).register_all().await;

    let body: Value = serde_json::from_slice(&client.register_calls()[0].body).unwrap();
    assert_eq!(body["endpoint"], "/ip4/1.2.3.4/tcp/4001");
    assert_eq!(body["endpoints"], json!(["/ip4/1.2.3.4/tcp/4001", "https://x"]));
    assert_eq!(body["transport"], "p2p");
}

#[tokio::test]
async fn test_no_endpoints_fails_without_network_calls() {
    let config = node_config(
        json!({
            "httpDisabled": true,
            "apis": [{ "id": "echo", "pricing": { "amount": 10 } }]
        }),
        json!({}),
    );
    let client = Arc::new(MockAggregator::default());
    let registrar = registrar(&config, client.clone());

    let report = registrar.register_all().await;

    assert!(report.all_failed());
    assert_eq!(report.failed_count(), 2);
    assert!(report.aggregators[0].failed[0].error.contains("No endpoints"));
    assert!(client.register_calls().is_empty());
    assert!(matches!(
        registrar.resolve("echo"),
        Err(Error::NoEndpoints { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hung_aggregator_times_out() {
    let config = node_config(http_provider(), json!({ "registrationTimeoutSecs": 10 }));
    let client = Arc::new(MockAggregator {
        hang_register: [AGG_A.to_string()].into(),
        ..Default::default()
    });
    let registrar = registrar(&config, client.clone());

    let started = tokio::time::Instant::now();
    let report = registrar.register_all().await;

    // Two hung calls at 10s each, then aggregator B answers immediately
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    assert_eq!(report.aggregators[0].failed.len(), 2);
    assert!(report.aggregators[0].failed[0].error.contains("timed out"));
    assert_eq!(report.aggregators[1].registered.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_requires_registration_pass() {
    let config = node_config(http_provider(), json!({}));
    let registrar = registrar(&config, Arc::new(MockAggregator::default()));

    assert!(registrar.start_heartbeat().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ticks_on_interval() {
    let config = node_config(http_provider(), json!({ "heartbeatIntervalSecs": 60 }));
    let client = Arc::new(MockAggregator {
        fail_register: [(AGG_B.to_string(), "echo".to_string())].into(),
        ..Default::default()
    });
    let registrar = registrar(&config, client.clone());
    registrar.register_all().await;

    let handle = registrar.start_heartbeat().unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(59)).await;
    settle().await;
    assert!(client.heartbeat_calls().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    // Only the three registered pairs are pinged
    let calls = client.heartbeat_calls();
    assert_eq!(calls.len(), 3);
    assert!(!calls.contains(&(AGG_B.to_string(), "echo".to_string())));

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(client.heartbeat_calls().len(), 6);

    assert!(registrar
        .states()
        .iter()
        .filter(|s| s.state.is_registered())
        .all(|s| s.state == PairState::HeartbeatOk));

    handle.stop().await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    settle().await;
    assert_eq!(client.heartbeat_calls().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_hung_heartbeat_does_not_block_cadence() {
    let config = node_config(
        http_provider(),
        json!({ "heartbeatIntervalSecs": 60, "heartbeatTimeoutSecs": 5 }),
    );
    let client = Arc::new(MockAggregator {
        hang_heartbeat: [AGG_B.to_string()].into(),
        ..Default::default()
    });
    let registrar = registrar(&config, client.clone());
    registrar.register_all().await;
    let handle = registrar.start_heartbeat().unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(client.heartbeats_to(AGG_A), 2);
    assert_eq!(client.heartbeats_to(AGG_B), 2);

    // Past the 5s heartbeat timeout
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    for status in registrar.states() {
        if status.aggregator == AGG_B {
            assert_eq!(status.state, PairState::HeartbeatFailed);
            assert_eq!(status.consecutive_failures, 1);
        } else {
            assert_eq!(status.state, PairState::HeartbeatOk);
        }
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(client.heartbeats_to(AGG_A), 4);
    assert_eq!(client.heartbeats_to(AGG_B), 4);

    // No re-registration by default
    assert_eq!(client.register_calls().len(), 4);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reregister_after_repeated_failures() {
    let config = node_config(
        http_provider(),
        json!({ "heartbeatIntervalSecs": 60, "reregisterAfterFailures": 2 }),
    );
    let client = Arc::new(MockAggregator {
        fail_heartbeat: [AGG_A.to_string()].into(),
        ..Default::default()
    });
    let registrar = registrar(&config, client.clone());
    registrar.register_all().await;
    let handle = registrar.start_heartbeat().unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(client.register_calls().len(), 4);

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    let to_a = client
        .register_calls()
        .iter()
        .filter(|c| c.aggregator == AGG_A)
        .count();
    assert_eq!(to_a, 4);

    for status in registrar.states().iter().filter(|s| s.aggregator == AGG_A) {
        assert_eq!(status.state, PairState::Registered);
        assert_eq!(status.consecutive_failures, 0);
    }

    handle.stop().await;
}
