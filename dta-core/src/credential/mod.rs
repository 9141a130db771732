//! Credential Vault (C2) — see spec §4.2.

pub mod types;
pub mod vault;

pub use types::{Credential, CredentialHandle};
pub use vault::CredentialVault;
