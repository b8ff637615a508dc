use alloy::primitives::{Address, B256, keccak256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::{Signature, SignerSync};
use anyhow::anyhow;
use std::fmt;
use std::str::FromStr;

/// The ephemeral signing key of a session, kept in memory.
#[derive(Clone)]
pub struct SessionSigner {
    signer: PrivateKeySigner,
}

impl SessionSigner {
    /// Generates a new random private key
    pub fn generate() -> Self {
        Self {
            signer: PrivateKeySigner::random(),
        }
    }

    /// Restores a signer from its persisted hex form (with or without `0x`).
    pub fn from_persisted(key: &str) -> anyhow::Result<Self> {
        let signer = PrivateKeySigner::from_str(key.trim())
            .map_err(|e| anyhow!("Failed to parse private key: {e}"))?;
        Ok(Self { signer })
    }

    /// Address derived from the private key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// The `0x`-prefixed hex form of the private key, as written to the session store.
    pub(crate) fn persisted_key(&self) -> String {
        self.signer.to_bytes().to_string()
    }

    /// Signs `message` as an EIP-191 personal message.
    pub fn sign_message(&self, message: &[u8]) -> anyhow::Result<Signature> {
        Ok(self.signer.sign_message_sync(message)?)
    }

    /// Signs the keccak hash of `data`, which is how transaction payloads are signed.
    pub fn sign(&self, data: &[u8]) -> anyhow::Result<Signature> {
        let hash = keccak256(data);
        self.sign_hash(&hash)
    }

    fn sign_hash(&self, hash: &B256) -> anyhow::Result<Signature> {
        Ok(self.signer.sign_hash_sync(hash)?)
    }
}

impl From<PrivateKeySigner> for SessionSigner {
    fn from(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }
}

// Key material stays out of debug output.
impl fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSigner")
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_key_restores_same_address() {
        let signer = SessionSigner::generate();
        let restored = SessionSigner::from_persisted(&signer.persisted_key()).unwrap();
        assert_eq!(restored.address(), signer.address());
        assert!(signer.persisted_key().starts_with("0x"));
        assert_eq!(signer.persisted_key().len(), 66);
    }

    #[test]
    fn test_from_persisted_rejects_garbage() {
        assert!(SessionSigner::from_persisted("not a key").is_err());
        assert!(SessionSigner::from_persisted("").is_err());
    }

    #[test]
    fn test_message_signature_recovers_address() {
        let signer = SessionSigner::generate();
        let signature = signer.sign_message(b"hello session").unwrap();
        let recovered = signature
            .recover_address_from_msg(b"hello session".as_slice())
            .unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_debug_hides_key() {
        let signer = SessionSigner::generate();
        let debug = format!("{signer:?}");
        assert!(!debug.contains(&signer.persisted_key()[2..]));
    }
}
