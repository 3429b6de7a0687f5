//! Shared building blocks for the API provider node: error taxonomy,
//! node identity and signing, configuration and the advertised API model.

pub mod api;
pub mod config;
pub mod error;
pub mod identity;

pub use api::{ApiCatalog, ApiDefinition};
pub use config::{NodeConfig, ProviderConfig};
pub use error::{Error, Result};
pub use identity::{Identity, KeySource, PrivateKeyInput};
