//! Transport resolution
//!
//! Decides which addresses an API is advertised under. P2P multiaddresses come
//! first, the public HTTP endpoint last; the first entry is the primary.

use provider_common::{Error, Result};
use serde::Serialize;
use std::fmt;

/// Anything that can report the node's current P2P listen addresses
pub trait MultiaddrSource: Send + Sync {
    fn multiaddrs(&self) -> Vec<String>;
}

/// Fixed multiaddress list, typically taken from `provider.p2p.multiaddrs`
#[derive(Debug, Clone, Default)]
pub struct StaticMultiaddrs(pub Vec<String>);

impl MultiaddrSource for StaticMultiaddrs {
    fn multiaddrs(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// Transport family that produced the primary endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    P2p,
    Http,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::P2p => "p2p",
            Transport::Http => "http",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an API can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEndpoints {
    /// Primary endpoint, always `endpoints[0]`
    pub endpoint: String,
    /// Every reachable endpoint in preference order
    pub endpoints: Vec<String>,
    pub transport: Transport,
}

/// Build the endpoint list for one API.
///
/// Fails with [`Error::NoEndpoints`] when neither transport yields an address.
pub fn resolve_endpoints(
    api_id: &str,
    p2p: Option<&dyn MultiaddrSource>,
    http_enabled: bool,
    public_endpoint: Option<&str>,
) -> Result<ResolvedEndpoints> {
    let mut endpoints: Vec<String> = p2p
        .map(|source| {
            source
                .multiaddrs()
                .into_iter()
                .map(|addr| addr.trim().to_string())
                .filter(|addr| !addr.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let p2p_count = endpoints.len();

    if http_enabled {
        if let Some(endpoint) = public_endpoint.map(str::trim).filter(|e| !e.is_empty()) {
            endpoints.push(endpoint.to_string());
        }
    }

    let endpoint = match endpoints.first() {
        Some(first) => first.clone(),
        None => {
            return Err(Error::NoEndpoints {
                api_id: api_id.to_string(),
            })
        }
    };

    let transport = if p2p_count > 0 {
        Transport::P2p
    } else {
        Transport::Http
    };

    Ok(ResolvedEndpoints {
        endpoint,
        endpoints,
        transport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_only() {
        let resolved = resolve_endpoints("echo", None, true, Some("https://x")).unwrap();
        assert_eq!(resolved.endpoint, "https://x");
        assert_eq!(resolved.endpoints, vec!["https://x".to_string()]);
        assert_eq!(resolved.transport, Transport::Http);
    }

    #[test]
    fn test_p2p_takes_precedence() {
        let p2p = StaticMultiaddrs(vec![
            "/ip4/10.0.0.1/tcp/4001/p2p/12D3Koo".to_string(),
            "  ".to_string(),
        ]);
        let resolved = resolve_endpoints("echo", Some(&p2p), true, Some("https://x")).unwrap();

        assert_eq!(resolved.endpoint, "/ip4/10.0.0.1/tcp/4001/p2p/12D3Koo");
        assert_eq!(resolved.endpoints.len(), 2);
        assert_eq!(resolved.endpoints[1], "https://x");
        assert_eq!(resolved.transport, Transport::P2p);
    }

    #[test]
    fn test_http_disabled_ignores_public_endpoint() {
        let err = resolve_endpoints("echo", None, false, Some("https://x")).unwrap_err();
        assert!(matches!(err, Error::NoEndpoints { ref api_id } if api_id == "echo"));
    }

    #[test]
    fn test_no_endpoints() {
        let empty = StaticMultiaddrs::default();
        let err = resolve_endpoints("echo", Some(&empty), true, None).unwrap_err();
        assert!(matches!(err, Error::NoEndpoints { .. }));
    }

    #[test]
    fn test_transport_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Transport::P2p).unwrap(), "p2p");
        assert_eq!(serde_json::to_value(Transport::Http).unwrap(), "http");
    }
}
