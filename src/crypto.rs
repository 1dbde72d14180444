// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-column value sealing.
//!
//! Relays only ever see ciphertext. Each column value is sealed on its own,
//! with the cell's routing metadata bound as associated data so a relay cannot
//! move a ciphertext to a different table, row or column undetected.
//!
//! Key management is the caller's concern: hand the engine any
//! [`ColumnCipher`]. [`ChaChaColumnCipher`] is the bundled AEAD adapter.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("encryption failed for {0}")]
    Encrypt(String),
    #[error("decryption failed for {0}")]
    Decrypt(String),
    #[error("malformed ciphertext encoding: {0}")]
    Encoding(String),
}

/// Identity of the cell a value belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CellContext<'a> {
    pub table: &'a str,
    pub row_pk: &'a str,
    pub column: &'a str,
}

impl CellContext<'_> {
    /// Associated data bound into the seal.
    #[must_use]
    pub fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.table.len() + self.row_pk.len() + self.column.len() + 2);
        aad.extend_from_slice(self.table.as_bytes());
        aad.push(0);
        aad.extend_from_slice(self.row_pk.as_bytes());
        aad.push(0);
        aad.extend_from_slice(self.column.as_bytes());
        aad
    }
}

impl std::fmt::Display for CellContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.table, self.row_pk, self.column)
    }
}

/// Ciphertext plus the nonce needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedValue {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl SealedValue {
    /// Hex encode for the wire: `(encryptedValue, nonce)`.
    #[must_use]
    pub fn to_hex(&self) -> (String, String) {
        (hex::encode(&self.ciphertext), hex::encode(&self.nonce))
    }

    pub fn from_hex(ciphertext: &str, nonce: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            ciphertext: hex::decode(ciphertext).map_err(|e| CryptoError::Encoding(e.to_string()))?,
            nonce: hex::decode(nonce).map_err(|e| CryptoError::Encoding(e.to_string()))?,
        })
    }
}

/// Encrypt/decrypt contract, applied independently per column value.
pub trait ColumnCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], cell: &CellContext<'_>) -> Result<SealedValue, CryptoError>;

    fn decrypt(&self, sealed: &SealedValue, cell: &CellContext<'_>) -> Result<Vec<u8>, CryptoError>;
}

/// ChaCha20-Poly1305 with a fresh random nonce per value.
pub struct ChaChaColumnCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaColumnCipher {
    /// Build from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Fresh random 32-byte key.
    #[must_use]
    pub fn generate_key() -> [u8; 32] {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut out = [0u8; 32];
        out.copy_from_slice(&key);
        out
    }
}

impl ColumnCipher for ChaChaColumnCipher {
    fn encrypt(&self, plaintext: &[u8], cell: &CellContext<'_>) -> Result<SealedValue, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = cell.aad();
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| CryptoError::Encrypt(cell.to_string()))?;
        Ok(SealedValue { ciphertext, nonce: nonce.to_vec() })
    }

    fn decrypt(&self, sealed: &SealedValue, cell: &CellContext<'_>) -> Result<Vec<u8>, CryptoError> {
        if sealed.nonce.len() != NONCE_LEN {
            return Err(CryptoError::Encoding(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                sealed.nonce.len()
            )));
        }
        let aad = cell.aad();
        self.cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload { msg: &sealed.ciphertext, aad: &aad },
            )
            .map_err(|_| CryptoError::Decrypt(cell.to_string()))
    }
}
