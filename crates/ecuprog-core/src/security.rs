//! Security access
//!
//! Two handshake shapes unlock write access, selected by the command dialect:
//!
//! - challenge/response: the engine sends 16 random bytes and checks the
//!   device-computed answer with a [`ChallengeVerifier`]
//! - seed/key: the device issues a seed, the engine derives a key with the
//!   [`KeyDerivation`] strategy registered for the ECU manufacturer
//!
//! Authentication runs exactly once per session and is never retried.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{decode_secret, ConfigError, SecurityConfig};
use crate::ecu::EcuInfo;
use crate::error::{ProgramError, ProgramResult};
use crate::protocol::Request;
use crate::session::link::Link;

/// Length of a locally generated challenge
pub const CHALLENGE_LEN: usize = 16;

/// Shortest seed the device may return
pub const MIN_SEED_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("No key derivation registered for manufacturer '{0}'")]
    NoStrategy(String),

    #[error("Seed too short: {0} bytes, need at least {MIN_SEED_LEN}")]
    SeedTooShort(usize),

    #[error("Unexpected security access sub-function 0x{actual:02X} (expected 0x{expected:02X})")]
    UnexpectedSubFunction { expected: u8, actual: u8 },

    #[error("No challenge verifier configured")]
    NoVerifier,

    #[error("Challenge response rejected")]
    ChallengeRejected,

    #[error("Key derivation failed: {0}")]
    Derivation(String),
}

/// Computes the key for a device seed
pub trait KeyDerivation: Send + Sync {
    fn derive_key(&self, seed: &[u8], ecu: &EcuInfo) -> Result<Vec<u8>, SecurityError>;
}

/// Placeholder transform: seed bytes XOR a cycling secret
#[derive(Debug, Clone)]
pub struct XorKeyDerivation {
    secret: Vec<u8>,
}

impl XorKeyDerivation {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, SecurityError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(SecurityError::Derivation("empty secret".to_string()));
        }
        Ok(Self { secret })
    }
}

impl KeyDerivation for XorKeyDerivation {
    fn derive_key(&self, seed: &[u8], _ecu: &EcuInfo) -> Result<Vec<u8>, SecurityError> {
        Ok(xor_cycle(seed, &self.secret))
    }
}

fn xor_cycle(data: &[u8], secret: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ secret[i % secret.len()])
        .collect()
}

/// Key derivation strategies keyed by manufacturer (case-insensitive)
#[derive(Default, Clone)]
pub struct KeyDerivationRegistry {
    strategies: HashMap<String, Arc<dyn KeyDerivation>>,
    fallback: Option<Arc<dyn KeyDerivation>>,
}

impl std::fmt::Debug for KeyDerivationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut manufacturers: Vec<_> = self.strategies.keys().collect();
        manufacturers.sort();
        f.debug_struct("KeyDerivationRegistry")
            .field("manufacturers", &manufacturers)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl KeyDerivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// XOR strategies for every secret in the configuration; the top-level
    /// secret becomes the fallback
    pub fn from_config(config: &SecurityConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        if let Some(secret) = &config.secret {
            let secret = decode_secret("security.secret", secret)?;
            registry.fallback = Some(Arc::new(XorKeyDerivation { secret }));
        }
        for (manufacturer, secret) in &config.manufacturer_secrets {
            let field = format!("security.manufacturer_secrets.{}", manufacturer);
            let secret = decode_secret(&field, secret)?;
            registry.register(manufacturer, Arc::new(XorKeyDerivation { secret }));
        }
        Ok(registry)
    }

    pub fn register(&mut self, manufacturer: &str, strategy: Arc<dyn KeyDerivation>) {
        self.strategies
            .insert(manufacturer.to_ascii_lowercase(), strategy);
    }

    pub fn set_fallback(&mut self, strategy: Arc<dyn KeyDerivation>) {
        self.fallback = Some(strategy);
    }

    pub fn resolve(&self, ecu: &EcuInfo) -> Result<Arc<dyn KeyDerivation>, SecurityError> {
        self.strategies
            .get(&ecu.manufacturer.to_ascii_lowercase())
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| SecurityError::NoStrategy(ecu.manufacturer.clone()))
    }
}

/// Checks the device answer to a challenge
pub trait ChallengeVerifier: Send + Sync {
    fn verify(&self, challenge: &[u8], response: &[u8]) -> bool;
}

/// Accepts `response[i] == challenge[i] ^ secret[i % len]`
#[derive(Debug, Clone)]
pub struct XorChallengeVerifier {
    secret: Vec<u8>,
}

impl XorChallengeVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, SecurityError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(SecurityError::Derivation("empty secret".to_string()));
        }
        Ok(Self { secret })
    }
}

impl ChallengeVerifier for XorChallengeVerifier {
    fn verify(&self, challenge: &[u8], response: &[u8]) -> bool {
        response.len() == challenge.len() && xor_cycle(challenge, &self.secret) == response
    }
}

/// Fresh random challenge of [`CHALLENGE_LEN`] bytes
pub fn generate_challenge() -> Bytes {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    Bytes::from(challenge)
}

/// Handshake selected for the session's dialect
#[derive(Clone)]
pub enum SecurityAccess {
    ChallengeResponse(Option<Arc<dyn ChallengeVerifier>>),
    SeedKey {
        level: u8,
        keys: Arc<KeyDerivationRegistry>,
    },
}

impl SecurityAccess {
    pub(crate) async fn authenticate(&self, link: &Link<'_>, ecu: &EcuInfo) -> ProgramResult<()> {
        let result = match self {
            SecurityAccess::ChallengeResponse(verifier) => {
                challenge_response(link, verifier.as_deref()).await
            }
            SecurityAccess::SeedKey { level, keys } => seed_key(link, *level, keys, ecu).await,
        };

        // Device rejections during the handshake are security failures
        result.map_err(|e| match e {
            ProgramError::Protocol(msg) => ProgramError::Security(msg),
            other => other,
        })
    }
}

async fn challenge_response(
    link: &Link<'_>,
    verifier: Option<&dyn ChallengeVerifier>,
) -> ProgramResult<()> {
    let verifier = verifier.ok_or(SecurityError::NoVerifier)?;
    let challenge = generate_challenge();

    let answer = link
        .exchange(&Request::Authenticate {
            challenge: challenge.clone(),
        })
        .await?;

    if !verifier.verify(&challenge, &answer) {
        return Err(SecurityError::ChallengeRejected.into());
    }
    info!("Challenge/response authentication succeeded");
    Ok(())
}

async fn seed_key(
    link: &Link<'_>,
    level: u8,
    keys: &KeyDerivationRegistry,
    ecu: &EcuInfo,
) -> ProgramResult<()> {
    let seed_sub = level.wrapping_mul(2).wrapping_sub(1);
    let reply = link.exchange(&Request::RequestSeed { level }).await?;

    let (&sub, seed) = reply
        .split_first()
        .ok_or(SecurityError::SeedTooShort(0))?;
    if sub != seed_sub {
        return Err(SecurityError::UnexpectedSubFunction {
            expected: seed_sub,
            actual: sub,
        }
        .into());
    }
    if seed.len() < MIN_SEED_LEN {
        return Err(SecurityError::SeedTooShort(seed.len()).into());
    }
    if seed.iter().all(|b| *b == 0) {
        info!(level, "Security access already granted");
        return Ok(());
    }

    debug!(level, seed = %hex::encode(seed), "Received seed");
    let key = keys.resolve(ecu)?.derive_key(seed, ecu)?;

    let ack = link
        .exchange(&Request::SendKey {
            level,
            key: Bytes::from(key),
        })
        .await?;

    let key_sub = level.wrapping_mul(2);
    match ack.first() {
        Some(&sub) if sub == key_sub => {
            info!(level, "Security access unlocked");
            Ok(())
        }
        Some(&sub) => Err(SecurityError::UnexpectedSubFunction {
            expected: key_sub,
            actual: sub,
        }
        .into()),
        None => Err(ProgramError::Security(
            "Empty security access acknowledgement".to_string(),
        )),
    }
}
