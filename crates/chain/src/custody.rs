use std::fmt;

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use alloy::primitives::{Address, B256};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use quasar_core::CustodialWallet;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::PrivateKeySigner;

const NONCE_BYTES: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CustodyError {
    #[error("custody master key is not configured")]
    MissingKey,

    #[error("signing material for {0} is malformed")]
    Malformed(Address),

    #[error("signing material for {0} failed its integrity check")]
    Integrity(Address),

    #[error("sealing signing material failed")]
    Seal,
}

/// Holds signing material on behalf of account owners.
pub trait Custody: Send + Sync {
    /// Generate a fresh keypair and return its address with the sealed key.
    fn provision(&self) -> Result<CustodialWallet, CustodyError>;

    fn decrypt_signing_material(
        &self,
        wallet: &CustodialWallet,
    ) -> Result<PrivateKeySigner, CustodyError>;
}

/// AES-256-GCM custody keyed by the SHA-256 of a master secret.
///
/// Sealed form is `base64(nonce || ciphertext)`; the owning address is bound
/// as associated data, so material cannot be moved between accounts.
pub struct AesCustody {
    cipher: Aes256Gcm,
}

impl fmt::Debug for AesCustody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCustody(<redacted>)")
    }
}

impl AesCustody {
    pub fn new(master_key: &str) -> Result<Self, CustodyError> {
        let master_key = master_key.trim();
        if master_key.is_empty() {
            return Err(CustodyError::MissingKey);
        }
        let digest = Sha256::digest(master_key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest).map_err(|_| CustodyError::MissingKey)?;
        Ok(Self { cipher })
    }

    fn seal(&self, address: Address, key: &B256) -> Result<String, CustodyError> {
        let mut nonce = [0u8; NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut nonce);

        let aad = format!("{address:#x}");
        let ciphertext = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: key.as_slice(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::Seal)?;

        let mut payload = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(payload))
    }
}

impl Custody for AesCustody {
    fn provision(&self) -> Result<CustodialWallet, CustodyError> {
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        let encrypted_key = self.seal(address, &signer.to_bytes())?;
        Ok(CustodialWallet {
            address,
            encrypted_key,
        })
    }

    fn decrypt_signing_material(
        &self,
        wallet: &CustodialWallet,
    ) -> Result<PrivateKeySigner, CustodyError> {
        let address = wallet.address;
        let raw = BASE64_STANDARD
            .decode(wallet.encrypted_key.trim())
            .map_err(|_| CustodyError::Malformed(address))?;
        if raw.len() <= NONCE_BYTES {
            return Err(CustodyError::Malformed(address));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_BYTES);
        let aad = format!("{address:#x}");
        let plaintext = self
            .cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::Integrity(address))?;

        PrivateKeySigner::from_slice(&plaintext).map_err(|_| CustodyError::Malformed(address))
    }
}
