//! Provider registrar
//!
//! Advertises the node's APIs to every configured aggregator:
//! 1. Resolve endpoints (P2P multiaddresses, then the public HTTP endpoint)
//! 2. Serialize and sign each registration with the node identity
//! 3. Register every API with every aggregator, isolating failures
//! 4. Heartbeat the registered pairs on a fixed interval

pub mod client;
pub mod heartbeat;
pub mod registrar;
pub mod transport;

pub use client::{AggregatorClient, HttpAggregatorClient};
pub use heartbeat::HeartbeatHandle;
pub use registrar::{
    AggregatorOutcome, PairState, PairStatus, Registrar, RegistrationFailure,
    RegistrationPayload, RegistrationReport,
};
pub use transport::{resolve_endpoints, MultiaddrSource, ResolvedEndpoints, StaticMultiaddrs, Transport};
