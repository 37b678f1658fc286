//! Secret Vault - opaque key→secret storage
//!
//! The account table keeps the secret inline. A platform keystore can be
//! attached to the database as a mirror through [`SecretVault`]; the store
//! writes to it inside `create`/`update` and removes entries on delete. When
//! a vault is attached, live rows without an inline secret are restored from it.
//!
//! Secrets held in memory are wrapped in `Zeroizing` so they are wiped when
//! an entry is replaced or dropped.

use std::collections::HashMap;
use std::sync::RwLock;
use zeroize::Zeroizing;

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Vault unavailable: {0}")]
    Unavailable(String),

    #[error("Vault write failed for account {id}: {reason}")]
    WriteFailed { id: i64, reason: String },
}

/// Secret storage keyed by local account id
pub trait SecretVault: Send + Sync {
    /// Store (or replace) the secret for an account
    fn set(&self, id: i64, secret: &str) -> Result<(), VaultError>;

    /// Read the secret for an account, `None` if the vault has no entry
    fn get(&self, id: i64) -> Result<Option<String>, VaultError>;

    /// Remove the secret for an account. Removing a missing entry is not an error.
    fn delete(&self, id: i64) -> Result<(), VaultError>;
}

/// Process-local vault, used headless and in tests
#[derive(Default)]
pub struct MemoryVault {
    entries: RwLock<HashMap<i64, Zeroizing<String>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretVault for MemoryVault {
    fn set(&self, id: i64, secret: &str) -> Result<(), VaultError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VaultError::Unavailable(e.to_string()))?;
        entries.insert(id, Zeroizing::new(secret.to_string()));
        Ok(())
    }

    fn get(&self, id: i64) -> Result<Option<String>, VaultError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| VaultError::Unavailable(e.to_string()))?;
        Ok(entries.get(&id).map(|s| s.as_str().to_string()))
    }

    fn delete(&self, id: i64) -> Result<(), VaultError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VaultError::Unavailable(e.to_string()))?;
        entries.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_vault_set_and_replace() {
        let vault = MemoryVault::new();
        assert!(vault.is_empty());

        vault.set(1, "JBSWY3DPEHPK3PXP").unwrap();
        vault.set(1, "KRSXG5CTMVRXEZLU").unwrap();

        assert_eq!(vault.len(), 1);
        assert_eq!(vault.get(1).unwrap(), Some("KRSXG5CTMVRXEZLU".to_string()));
    }

    #[test]
    fn test_memory_vault_delete_missing_is_ok() {
        let vault = MemoryVault::new();
        vault.set(7, "secret").unwrap();

        vault.delete(7).unwrap();
        vault.delete(7).unwrap();

        assert!(vault.get(7).unwrap().is_none());
    }
}
