//! Collaborators consulted during rotation.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use strongbox_core::{EntryKey, SecretBytes};
use strongbox_crypto::EnvelopeEngine;

use crate::error::{Result, RotationError};

/// Produces candidate secret values.
#[async_trait]
pub trait SecretGenerator: Send + Sync {
    async fn generate(&self, secret: &EntryKey) -> Result<SecretBytes>;
}

/// Random bytes from the key service, URL-safe base64 encoded.
pub struct RandomSecretGenerator {
    crypto: EnvelopeEngine,
    bytes: usize,
}

impl RandomSecretGenerator {
    pub fn new(crypto: EnvelopeEngine, bytes: usize) -> Self {
        Self { crypto, bytes }
    }
}

#[async_trait]
impl SecretGenerator for RandomSecretGenerator {
    async fn generate(&self, _secret: &EntryKey) -> Result<SecretBytes> {
        let raw = SecretBytes::new(self.crypto.generate_random(self.bytes).await?);
        Ok(SecretBytes::new(URL_SAFE_NO_PAD.encode(raw.expose()).into_bytes()))
    }
}

/// Reject weak candidates: too short, fewer than two character classes, or
/// a single repeated character.
pub fn check_strength(candidate: &[u8], min_length: usize) -> Result<()> {
    if candidate.len() < min_length {
        return Err(RotationError::invalid(format!(
            "candidate is {} bytes, minimum is {min_length}",
            candidate.len()
        )));
    }

    let mut classes = [false; 4];
    for b in candidate {
        let class = match b {
            b'a'..=b'z' => 0,
            b'A'..=b'Z' => 1,
            b'0'..=b'9' => 2,
            _ => 3,
        };
        classes[class] = true;
    }
    if classes.iter().filter(|c| **c).count() < 2 {
        return Err(RotationError::invalid("candidate uses fewer than two character classes"));
    }

    if let Some(first) = candidate.first() {
        if candidate.iter().all(|b| b == first) {
            return Err(RotationError::invalid("candidate is a single repeated character"));
        }
    }
    Ok(())
}

/// Checks that a candidate actually works (e.g. can log in downstream).
#[async_trait]
pub trait ValidationHook: Send + Sync {
    /// `Err(reason)` rejects the candidate.
    async fn validate(&self, secret: &EntryKey, candidate: &SecretBytes) -> std::result::Result<(), String>;
}

/// Accepts every candidate.
#[derive(Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl ValidationHook for AcceptAll {
    async fn validate(&self, _secret: &EntryKey, _candidate: &SecretBytes) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Observations of which secret versions are still being presented.
#[async_trait]
pub trait UsageTelemetry: Send + Sync {
    async fn record_use(&self, secret: &EntryKey, version: u64, at: DateTime<Utc>);

    /// Whether `version` was used at or after `since`.
    async fn used_since(&self, secret: &EntryKey, version: u64, since: DateTime<Utc>) -> bool;
}

/// Last-use timestamps kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryUsageTelemetry {
    last_used: DashMap<(EntryKey, u64), DateTime<Utc>>,
}

impl InMemoryUsageTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageTelemetry for InMemoryUsageTelemetry {
    async fn record_use(&self, secret: &EntryKey, version: u64, at: DateTime<Utc>) {
        self.last_used
            .entry((secret.clone(), version))
            .and_modify(|t| *t = (*t).max(at))
            .or_insert(at);
    }

    async fn used_since(&self, secret: &EntryKey, version: u64, since: DateTime<Utc>) -> bool {
        self.last_used
            .get(&(secret.clone(), version))
            .is_some_and(|t| *t >= since)
    }
}

/// Downstream error rate observed since the candidate went live.
#[async_trait]
pub trait ErrorRateMonitor: Send + Sync {
    /// Fraction in `[0, 1]`, or `None` when unknown.
    async fn error_rate(&self, secret: &EntryKey) -> Option<f64>;
}

/// Reports no errors.
#[derive(Debug, Default)]
pub struct NoErrors;

#[async_trait]
impl ErrorRateMonitor for NoErrors {
    async fn error_rate(&self, _secret: &EntryKey) -> Option<f64> {
        None
    }
}
