//! Credential Vault (C2) — spec §4.2. Resolves `(tenant, provider, project?)`
//! to a decrypted API key, enforcing one-default-per-scope.

use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::credential::types::{Credential, CredentialHandle};
use crate::error::{Error, Result};
use crate::provider::Provider;

/// SQLite-backed, AES-256-GCM-encrypted credential store. Keys are decrypted
/// lazily per call and must never enter log output (spec §4.2).
pub struct CredentialVault {
    conn: Arc<Mutex<Connection>>,
    encryption_key: [u8; 32],
}

impl CredentialVault {
    pub fn open(path: &str, encryption_key: [u8; 32]) -> Result<Self> {
        let conn = Connection::open(path)?;
        let vault = Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption_key,
        };
        vault.initialize_schema()?;
        Ok(vault)
    }

    pub fn in_memory(encryption_key: [u8; 32]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let vault = Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption_key,
        };
        vault.initialize_schema()?;
        Ok(vault)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("vault lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                project TEXT,
                provider TEXT NOT NULL,
                encrypted_key BLOB NOT NULL,
                nonce BLOB NOT NULL,
                key_hash TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                is_default INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_scope
                ON credentials(tenant, provider, project);",
        )?;
        Ok(())
    }

    fn cipher(&self) -> Aes256Gcm {
        let key = Key::<Aes256Gcm>::from_slice(&self.encryption_key);
        Aes256Gcm::new(key)
    }

    fn encrypt(&self, plaintext: &str) -> (Vec<u8>, [u8; 12]) {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .expect("encryption failure is a programming error, not a runtime condition");
        (ciphertext, nonce_bytes)
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; 12]) -> Result<String> {
        let nonce = Nonce::from_slice(nonce);
        let plaintext = self
            .cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Internal("credential decryption failed".into()))?;
        String::from_utf8(plaintext).map_err(|_| Error::Internal("credential payload not utf-8".into()))
    }

    /// Stores a new credential, unsetting any prior default in the same
    /// `(tenant, project, provider)` scope if `default` is true.
    pub fn store(
        &self,
        tenant: &str,
        project: Option<&str>,
        provider: Provider,
        plaintext_key: &str,
        default: bool,
    ) -> Result<Credential> {
        let (encrypted_key, nonce) = self.encrypt(plaintext_key);
        let key_hash = format!("{:x}", Sha256::digest(plaintext_key.as_bytes()));
        let id = format!("cred_{}", Uuid::new_v4());
        let created_at = Utc::now();

        let conn = self.conn.lock().expect("vault lock poisoned");
        if default {
            conn.execute(
                "UPDATE credentials SET is_default = 0
                 WHERE tenant = ?1 AND provider = ?2 AND project IS ?3",
                params![tenant, provider.env_prefix(), project],
            )?;
        }
        conn.execute(
            "INSERT INTO credentials
                (id, tenant, project, provider, encrypted_key, nonce, key_hash, active, is_default, last_used_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL, ?9)",
            params![
                id,
                tenant,
                project,
                provider.env_prefix(),
                encrypted_key,
                nonce.to_vec(),
                key_hash,
                default as i64,
                created_at.to_rfc3339(),
            ],
        )?;

        Ok(Credential {
            id,
            tenant: tenant.to_string(),
            project: project.map(|p| p.to_string()),
            provider,
            encrypted_key,
            nonce,
            key_hash,
            active: true,
            default,
            last_used_at: None,
            created_at,
        })
    }

    /// Resolution order (spec §4.2): project-scoped active default →
    /// tenant-scoped active default → most-recently-used active.
    pub fn resolve(
        &self,
        tenant: &str,
        provider: Provider,
        project: Option<&str>,
    ) -> Result<(String, CredentialHandle)> {
        let conn = self.conn.lock().expect("vault lock poisoned");

        if let Some(project) = project {
            if let Some(row) = query_one(
                &conn,
                "SELECT id, encrypted_key, nonce FROM credentials
                 WHERE tenant = ?1 AND provider = ?2 AND project = ?3 AND active = 1 AND is_default = 1
                 LIMIT 1",
                params![tenant, provider.env_prefix(), project],
            )? {
                drop(conn);
                return self.decrypt_row(row);
            }
        }

        if let Some(row) = query_one(
            &conn,
            "SELECT id, encrypted_key, nonce FROM credentials
             WHERE tenant = ?1 AND provider = ?2 AND project IS NULL AND active = 1 AND is_default = 1
             LIMIT 1",
            params![tenant, provider.env_prefix()],
        )? {
            drop(conn);
            return self.decrypt_row(row);
        }

        if let Some(row) = query_one(
            &conn,
            "SELECT id, encrypted_key, nonce FROM credentials
             WHERE tenant = ?1 AND provider = ?2 AND active = 1
             ORDER BY last_used_at DESC, created_at DESC
             LIMIT 1",
            params![tenant, provider.env_prefix()],
        )? {
            drop(conn);
            return self.decrypt_row(row);
        }

        Err(Error::no_credential(tenant, provider.env_prefix()))
    }

    fn decrypt_row(&self, row: (String, Vec<u8>, Vec<u8>)) -> Result<(String, CredentialHandle)> {
        let (id, encrypted_key, nonce) = row;
        let nonce_arr: [u8; 12] = nonce
            .try_into()
            .map_err(|_| Error::Internal("malformed credential nonce".into()))?;
        let plaintext = self.decrypt(&encrypted_key, &nonce_arr)?;
        Ok((plaintext, CredentialHandle { id }))
    }

    /// Updates usage counters; failures here must not fail the enclosing
    /// LLM call (spec §4.2), so this returns the error for the caller to log
    /// rather than propagate.
    pub fn mark_used(&self, handle: &CredentialHandle) -> Result<()> {
        let conn = self.conn.lock().expect("vault lock poisoned");
        let updated = conn.execute(
            "UPDATE credentials SET last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), handle.id],
        )?;
        if updated == 0 {
            warn!(credential_id = %handle.id, "mark_used: no matching credential row");
        }
        Ok(())
    }
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<(String, Vec<u8>, Vec<u8>)>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    if let Some(row) = rows.next()? {
        Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn store_and_resolve_tenant_default() {
        let vault = CredentialVault::in_memory(test_key()).unwrap();
        vault
            .store("acme", None, Provider::Anthropic, "sk-ant-secret", true)
            .unwrap();
        let (key, _handle) = vault.resolve("acme", Provider::Anthropic, None).unwrap();
        assert_eq!(key, "sk-ant-secret");
    }

    #[test]
    fn project_scoped_default_wins_over_tenant_default() {
        let vault = CredentialVault::in_memory(test_key()).unwrap();
        vault
            .store("acme", None, Provider::Anthropic, "tenant-key", true)
            .unwrap();
        vault
            .store("acme", Some("proj-1"), Provider::Anthropic, "project-key", true)
            .unwrap();
        let (key, _) = vault
            .resolve("acme", Provider::Anthropic, Some("proj-1"))
            .unwrap();
        assert_eq!(key, "project-key");
    }

    #[test]
    fn falls_back_to_most_recently_used_active() {
        let vault = CredentialVault::in_memory(test_key()).unwrap();
        vault
            .store("acme", None, Provider::Anthropic, "only-key", false)
            .unwrap();
        let (key, handle) = vault.resolve("acme", Provider::Anthropic, None).unwrap();
        assert_eq!(key, "only-key");
        vault.mark_used(&handle).unwrap();
    }

    #[test]
    fn no_credential_when_scope_empty() {
        let vault = CredentialVault::in_memory(test_key()).unwrap();
        let err = vault.resolve("acme", Provider::OpenAI, None).unwrap_err();
        assert!(matches!(err, Error::NoCredential { .. }));
    }

    #[test]
    fn storing_new_default_unsets_prior_default_in_scope() {
        let vault = CredentialVault::in_memory(test_key()).unwrap();
        vault
            .store("acme", None, Provider::Anthropic, "first", true)
            .unwrap();
        vault
            .store("acme", None, Provider::Anthropic, "second", true)
            .unwrap();
        let (key, _) = vault.resolve("acme", Provider::Anthropic, None).unwrap();
        assert_eq!(key, "second");
    }

    #[test]
    fn key_material_never_stored_as_plaintext() {
        let vault = CredentialVault::in_memory(test_key()).unwrap();
        let credential = vault
            .store("acme", None, Provider::Anthropic, "sk-ant-very-secret", true)
            .unwrap();
        assert_ne!(credential.encrypted_key, b"sk-ant-very-secret".to_vec());
    }
}
