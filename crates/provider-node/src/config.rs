//! Node configuration loading
//!
//! Reads the JSON config file, applies environment overrides, then validates.

use anyhow::{Context, Result};
use provider_common::{NodeConfig, PrivateKeyInput};
use std::path::Path;
use tracing::info;

/// Overrides `wallet.privateKey`
pub const PRIVATE_KEY_ENV: &str = "PROVIDER_PRIVATE_KEY";

/// Overrides `provider.publicEndpoint`
pub const PUBLIC_ENDPOINT_ENV: &str = "PROVIDER_PUBLIC_ENDPOINT";

/// Load configuration from `path`, with overrides from the process environment
pub fn load(path: &Path) -> Result<NodeConfig> {
    load_with(path, |key| std::env::var(key).ok())
}

/// Load configuration, resolving overrides through `lookup`
pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<NodeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: NodeConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    apply_overrides(&mut config, lookup);

    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded from {}", path.display());
    Ok(config)
}

fn apply_overrides(config: &mut NodeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(key) = lookup(PRIVATE_KEY_ENV).filter(|v| !v.trim().is_empty()) {
        info!("Using private key from {}", PRIVATE_KEY_ENV);
        config.wallet.private_key = PrivateKeyInput::Text(key);
    }

    if let Some(endpoint) = lookup(PUBLIC_ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
        if let Some(provider) = config.provider.as_mut() {
            info!("Using public endpoint from {}: {}", PUBLIC_ENDPOINT_ENV, endpoint);
            provider.public_endpoint = Some(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn write_config(dir: &Path, provider: serde_json::Value) -> std::path::PathBuf {
        let path = dir.join("config.json");
        let config = json!({
            "wallet": { "address": "addr", "privateKey": [1, 2, 3] },
            "token": { "symbol": "USDC", "mint": "mint" },
            "aggregators": ["https://agg.example"],
            "solana": { "network": "devnet", "rpcUrl": "https://rpc.example" },
            "provider": provider
        });
        std::fs::write(&path, config.to_string()).unwrap();
        path
    }

    #[test]
    fn test_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), json!({ "port": 3000 }));

        let env: HashMap<&str, &str> = [
            (PRIVATE_KEY_ENV, "base58secret"),
            (PUBLIC_ENDPOINT_ENV, "https://node.example"),
        ]
        .into();

        // Without the endpoint override validation fails
        assert!(load_with(&path, |_| None).is_err());

        let config = load_with(&path, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert!(matches!(
            config.wallet.private_key,
            PrivateKeyInput::Text(ref t) if t == "base58secret"
        ));
        assert_eq!(
            config.provider.unwrap().public_endpoint.as_deref(),
            Some("https://node.example")
        );
    }

    #[test]
    fn test_missing_file() {
        let err = load_with(Path::new("/nonexistent/config.json"), |_| None).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
