//! Credential entity (spec §3).

use chrono::{DateTime, Utc};

use crate::provider::Provider;

/// A stored, encrypted credential scoped to a tenant (and optionally a
/// project) and provider.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub tenant: String,
    pub project: Option<String>,
    pub provider: Provider,
    /// AES-256-GCM ciphertext of the raw API key.
    pub encrypted_key: Vec<u8>,
    pub nonce: [u8; 12],
    /// Opaque SHA-256 hash of the plaintext key, used for dedup without
    /// decrypting.
    pub key_hash: String,
    pub active: bool,
    pub default: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An opaque handle identifying a resolved credential, returned by
/// `Vault::resolve` for later `mark_used` bookkeeping (spec §4.2).
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub id: String,
}
