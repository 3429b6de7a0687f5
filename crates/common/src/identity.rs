//! Node identity and detached signing
//!
//! The node is identified by an ed25519 keypair whose base58 public key is the
//! provider address advertised to every aggregator. The secret is read from
//! configuration in one of three shapes:
//!
//! - a JSON byte array (Solana `id.json` layout or a 32-byte seed)
//! - a 12 or 24 word BIP39 mnemonic, derived at `m/44'/501'/0'/0'`
//! - a base58 encoded secret key

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, SECRET_KEY_LENGTH};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

/// Solana BIP44 derivation path, all segments hardened.
pub const SOLANA_DERIVATION_PATH: [u32; 4] = [44, 501, 0, 0];

const HARDENED_OFFSET: u32 = 0x8000_0000;
const ED25519_SEED_KEY: &[u8] = b"ed25519 seed";
const KEYPAIR_LENGTH: usize = 64;

/// Private key as it appears in the configuration file
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrivateKeyInput {
    Bytes(Vec<u8>),
    Text(String),
}

impl fmt::Debug for PrivateKeyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivateKeyInput::Bytes(b) => write!(f, "Bytes([REDACTED; {}])", b.len()),
            PrivateKeyInput::Text(_) => write!(f, "Text([REDACTED])"),
        }
    }
}

/// Classified key material, resolved before any derivation happens
#[derive(Clone, PartialEq, Eq)]
pub enum KeySource {
    RawBytes(Vec<u8>),
    Mnemonic(String),
    Base58(String),
}

impl KeySource {
    /// Classify a configured private key by shape.
    ///
    /// Byte arrays are raw secret keys, strings of exactly 12 or 24 words are
    /// mnemonics and every other string is treated as base58.
    pub fn classify(input: &PrivateKeyInput) -> Self {
        match input {
            PrivateKeyInput::Bytes(bytes) => KeySource::RawBytes(bytes.clone()),
            PrivateKeyInput::Text(text) => {
                let words = text.split_whitespace().count();
                if words == 12 || words == 24 {
                    KeySource::Mnemonic(text.split_whitespace().collect::<Vec<_>>().join(" "))
                } else {
                    KeySource::Base58(text.trim().to_string())
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeySource::RawBytes(_) => "raw_bytes",
            KeySource::Mnemonic(_) => "mnemonic",
            KeySource::Base58(_) => "base58",
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySource::{}([REDACTED])", self.kind())
    }
}

/// The node's signing identity, held in memory for the process lifetime
pub struct Identity {
    signing_key: SigningKey,
    address: String,
}

impl Identity {
    /// Derive the identity from a configured private key.
    ///
    /// Every failure is a configuration error; callers should refuse to start.
    pub fn from_input(input: &PrivateKeyInput) -> Result<Self> {
        Self::from_source(KeySource::classify(input))
    }

    pub fn from_source(source: KeySource) -> Result<Self> {
        debug!("Deriving identity from {} key", source.kind());
        let signing_key = match source {
            KeySource::RawBytes(bytes) => signing_key_from_secret(&bytes)?,
            KeySource::Base58(encoded) => {
                let bytes = bs58::decode(&encoded)
                    .into_vec()
                    .map_err(|e| Error::InvalidSecretKey(format!("invalid base58: {}", e)))?;
                signing_key_from_secret(&bytes)?
            }
            KeySource::Mnemonic(phrase) => signing_key_from_mnemonic(&phrase)?,
        };

        Ok(Self::from_signing_key(signing_key))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        Self {
            signing_key,
            address,
        }
    }

    /// Base58 encoded public key
    pub fn public_address(&self) -> &str {
        &self.address
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Detached signature over the exact bytes given
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.signing_key.sign(payload).to_bytes()
    }

    /// Detached signature, base64 encoded for header transport
    pub fn sign_base64(&self, payload: &[u8]) -> String {
        STANDARD.encode(self.sign(payload))
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8; 64]) -> bool {
        let signature = Signature::from_bytes(signature);
        self.signing_key
            .verifying_key()
            .verify(payload, &signature)
            .is_ok()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Accepts the 64-byte Solana keypair layout (secret || public) or a bare
/// 32-byte secret.
fn signing_key_from_secret(bytes: &[u8]) -> Result<SigningKey> {
    match bytes.len() {
        KEYPAIR_LENGTH => {
            let mut keypair = [0u8; KEYPAIR_LENGTH];
            keypair.copy_from_slice(bytes);
            SigningKey::from_keypair_bytes(&keypair).map_err(|_| {
                Error::InvalidSecretKey("public key half does not match secret key".to_string())
            })
        }
        SECRET_KEY_LENGTH => {
            let mut secret = [0u8; SECRET_KEY_LENGTH];
            secret.copy_from_slice(bytes);
            Ok(SigningKey::from_bytes(&secret))
        }
        n => Err(Error::InvalidSecretKey(format!(
            "expected {} or {} bytes, got {}",
            KEYPAIR_LENGTH, SECRET_KEY_LENGTH, n
        ))),
    }
}

fn signing_key_from_mnemonic(phrase: &str) -> Result<SigningKey> {
    // Checksum is validated here; derivation never runs on a bad phrase.
    let mnemonic = bip39::Mnemonic::parse_in_normalized(bip39::Language::English, phrase)
        .map_err(|e| Error::InvalidMnemonic(e.to_string()))?;

    let seed = mnemonic.to_seed("");
    let (key, _chain_code) = derive_ed25519_path(&seed, &SOLANA_DERIVATION_PATH)?;
    Ok(SigningKey::from_bytes(&key))
}

/// SLIP-0010 ed25519 derivation. Every index is hardened.
pub fn derive_ed25519_path(seed: &[u8], path: &[u32]) -> Result<([u8; 32], [u8; 32])> {
    let (mut key, mut chain_code) = hmac_split(ED25519_SEED_KEY, &[seed])?;

    for index in path {
        let hardened = (index | HARDENED_OFFSET).to_be_bytes();
        (key, chain_code) = hmac_split(&chain_code, &[&[0u8][..], &key[..], &hardened[..]])?;
    }

    Ok((key, chain_code))
}

fn hmac_split(key: &[u8], parts: &[&[u8]]) -> Result<([u8; 32], [u8; 32])> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| Error::InvalidSecretKey(format!("hmac key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let output = mac.finalize().into_bytes();

    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&output[..32]);
    right.copy_from_slice(&output[32..]);
    Ok((left, right))
}
