//! Digest Signer Adapter
//!
//! Development implementation of the `Signer` port. Signatures are keyed
//! SHA-256 digests, which lets tests and single-node setups verify what was
//! signed without a key service.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::ports::Signer;
use crate::error::Result;
use crate::task::{ApprovalMsg, MsgCreateBucket, MsgCreateObject, MsgMigrateBucket};

#[derive(Debug, Clone)]
pub struct DigestSigner {
    key: Vec<u8>,
}

impl DigestSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn sign(&self, domain: &str, payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(domain.as_bytes());
        hasher.update(payload);
        hasher.finalize().to_vec()
    }

    /// Checks a signature produced by [`Signer::sign_integrity_hash`].
    pub fn verify_integrity(&self, object_id: u64, integrity: &[u8], signature: &[u8]) -> bool {
        self.sign("integrity", &integrity_payload(object_id, integrity)) == signature
    }
}

/// Hash of the concatenated checksum list.
pub fn integrity_hash(checksums: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for checksum in checksums {
        hasher.update(checksum);
    }
    hasher.finalize().to_vec()
}

fn integrity_payload(object_id: u64, integrity: &[u8]) -> Vec<u8> {
    let mut payload = object_id.to_be_bytes().to_vec();
    payload.extend_from_slice(integrity);
    payload
}

#[async_trait]
impl Signer for DigestSigner {
    async fn sign_create_bucket_approval(&self, msg: &MsgCreateBucket) -> Result<Vec<u8>> {
        Ok(self.sign("create-bucket", &msg.sign_bytes()?))
    }

    async fn sign_create_object_approval(&self, msg: &MsgCreateObject) -> Result<Vec<u8>> {
        Ok(self.sign("create-object", &msg.sign_bytes()?))
    }

    async fn sign_migrate_bucket_approval(&self, msg: &MsgMigrateBucket) -> Result<Vec<u8>> {
        Ok(self.sign("migrate-bucket", &msg.sign_bytes()?))
    }

    async fn sign_integrity_hash(
        &self,
        object_id: u64,
        checksums: &[Vec<u8>],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let integrity = integrity_hash(checksums);
        let signature = self.sign("integrity", &integrity_payload(object_id, &integrity));
        Ok((signature, integrity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_integrity_signature_verifies() {
        let signer = DigestSigner::new(b"operator".to_vec());
        let checksums = vec![vec![1u8; 32], vec![2u8; 32]];
        let (sig, integrity) = signer.sign_integrity_hash(7, &checksums).await.unwrap();
        assert_eq!(integrity, integrity_hash(&checksums));
        assert!(signer.verify_integrity(7, &integrity, &sig));
        assert!(!signer.verify_integrity(8, &integrity, &sig));
    }

    #[tokio::test]
    async fn test_approval_signature_ignores_existing_sig() {
        let signer = DigestSigner::new(b"operator".to_vec());
        let mut msg = MsgCreateBucket {
            bucket_name: "photos".into(),
            ..Default::default()
        };
        let first = signer.sign_create_bucket_approval(&msg).await.unwrap();
        msg.primary_sp_approval.sig = first.clone();
        assert_eq!(signer.sign_create_bucket_approval(&msg).await.unwrap(), first);
    }

    #[test]
    fn test_domains_are_separated() {
        let signer = DigestSigner::new(b"k".to_vec());
        assert_ne!(signer.sign("a", b"x"), signer.sign("b", b"x"));
    }
}
