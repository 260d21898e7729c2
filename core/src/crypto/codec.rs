// Field-bundle encryption: XChaCha20-Poly1305 + keyed BLAKE3 checksum
//
// Seal:
// 1. Serialize the sensitive-field bundle to JSON
// 2. checksum = BLAKE3-keyed(checksum_key, plaintext)
// 3. XChaCha20-Poly1305(data_key, random 24-byte nonce, plaintext, aad = "{kind}:{id}")
// 4. Output: EncryptedBlob { ciphertext, iv, checksum, encrypted_at }
//
// Open reverses the steps; an AEAD failure or a checksum mismatch is an
// integrity failure. Binding the record id as AAD stops a blob from being
// replayed onto another record.

use super::keys::DataKey;
use crate::model::now_millis;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// KDF context for the checksum key.
/// Changing this invalidates every stored checksum.
const CHECKSUM_CONTEXT: &str = "chatvault 2026-10-19 record checksum";

const NONCE_LEN: usize = 24;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to serialize fields: {0}")]
    Serialize(String),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed: invalid ciphertext, wrong key, or wrong record")]
    Decrypt,
    #[error("Malformed blob: {0}")]
    Malformed(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

/// On-disk form of an encrypted sensitive-field bundle. Byte fields are hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    pub checksum: String,
    pub encrypted_at: u64,
}

/// A sensitive-field bundle as persisted: either plaintext or sealed.
///
/// Readers accept both variants regardless of the current encryption flag,
/// so records written under a different setting remain readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "lowercase")]
pub enum Stored<T> {
    Plain(T),
    Encrypted(EncryptedBlob),
}

impl<T> Stored<T> {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Stored::Encrypted(_))
    }

    pub fn as_plain(&self) -> Option<&T> {
        match self {
            Stored::Plain(fields) => Some(fields),
            Stored::Encrypted(_) => None,
        }
    }
}

/// Associated data binding a blob to one record.
pub fn record_aad(kind: &str, id: &str) -> Vec<u8> {
    format!("{}:{}", kind, id).into_bytes()
}

pub struct RecordCodec {
    key: Arc<DataKey>,
    checksum_key: Zeroizing<[u8; 32]>,
}

impl RecordCodec {
    pub fn new(key: Arc<DataKey>) -> Self {
        let checksum_key = Zeroizing::new(blake3::derive_key(CHECKSUM_CONTEXT, key.as_bytes()));
        Self { key, checksum_key }
    }

    fn checksum(&self, plaintext: &[u8]) -> blake3::Hash {
        blake3::keyed_hash(&self.checksum_key, plaintext)
    }

    pub fn encrypt<T: Serialize>(&self, aad: &[u8], fields: &T) -> Result<EncryptedBlob, CodecError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(fields).map_err(|e| CodecError::Serialize(e.to_string()))?,
        );
        let checksum = self.checksum(&plaintext);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(self.key.as_bytes())
            .map_err(|_| CodecError::Encrypt)?;
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad,
                },
            )
            .map_err(|_| CodecError::Encrypt)?;

        Ok(EncryptedBlob {
            ciphertext: hex::encode(ciphertext),
            iv: hex::encode(nonce_bytes),
            checksum: checksum.to_hex().to_string(),
            encrypted_at: now_millis(),
        })
    }

    pub fn decrypt<T: DeserializeOwned>(&self, aad: &[u8], blob: &EncryptedBlob) -> Result<T, CodecError> {
        let nonce_bytes =
            hex::decode(&blob.iv).map_err(|e| CodecError::Malformed(format!("iv: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CodecError::Malformed("invalid iv length".to_string()));
        }
        let ciphertext = hex::decode(&blob.ciphertext)
            .map_err(|e| CodecError::Malformed(format!("ciphertext: {}", e)))?;
        let expected = blake3::Hash::from_hex(&blob.checksum)
            .map_err(|e| CodecError::Malformed(format!("checksum: {}", e)))?;

        let cipher = XChaCha20Poly1305::new_from_slice(self.key.as_bytes())
            .map_err(|_| CodecError::Decrypt)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: &ciphertext,
                        aad,
                    },
                )
                .map_err(|_| CodecError::Decrypt)?,
        );

        // blake3::Hash equality is constant-time
        if self.checksum(&plaintext) != expected {
            return Err(CodecError::ChecksumMismatch);
        }

        serde_json::from_slice(&plaintext).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Persisted form of `fields` under the current encryption flag.
    pub fn seal<T: Serialize>(&self, encrypt: bool, aad: &[u8], fields: T) -> Result<Stored<T>, CodecError> {
        if encrypt {
            Ok(Stored::Encrypted(self.encrypt(aad, &fields)?))
        } else {
            Ok(Stored::Plain(fields))
        }
    }

    pub fn open<T: DeserializeOwned + Clone>(&self, aad: &[u8], stored: &Stored<T>) -> Result<T, CodecError> {
        match stored {
            Stored::Plain(fields) => Ok(fields.clone()),
            Stored::Encrypted(blob) => self.decrypt(aad, blob),
        }
    }
}
