//! Optional client-side value encryption
//!
//! Values are sealed with AES-256-GCM before they leave the client, using a
//! key derived from a base64 master key with HKDF-SHA256. Coordinator and
//! replicas only ever see the sealed bytes: `MAGIC || NONCE || CIPHERTEXT`.

use crate::common::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

/// Size of AES-256 key in bytes
const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Magic bytes to identify sealed values
const ENCRYPTION_MAGIC: &[u8] = b"TPCENC01";

/// HKDF context for value keys
const VALUE_KEY_CONTEXT: &[u8] = b"tpckv-value";

/// A sealed value split into its parts
#[derive(Debug, Clone)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(ENCRYPTION_MAGIC.len() + NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(ENCRYPTION_MAGIC);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let min_size = ENCRYPTION_MAGIC.len() + NONCE_SIZE + TAG_SIZE;
        if bytes.len() < min_size {
            return Err(Error::Crypto(format!(
                "sealed value too short: {} bytes, minimum {} bytes",
                bytes.len(),
                min_size
            )));
        }
        if !Self::is_encrypted(bytes) {
            return Err(Error::Crypto("value is not sealed".into()));
        }

        let nonce_start = ENCRYPTION_MAGIC.len();
        let ciphertext_start = nonce_start + NONCE_SIZE;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[nonce_start..ciphertext_start]);

        Ok(Self {
            nonce,
            ciphertext: bytes[ciphertext_start..].to_vec(),
        })
    }

    pub fn is_encrypted(bytes: &[u8]) -> bool {
        bytes.len() >= ENCRYPTION_MAGIC.len() && &bytes[..ENCRYPTION_MAGIC.len()] == ENCRYPTION_MAGIC
    }
}

/// Seals and opens values with one derived key.
pub struct ValueCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueCipher(AES-256-GCM)")
    }
}

impl ValueCipher {
    /// Build a cipher from a base64 master key of at least 32 bytes.
    pub fn from_master_key(master_key: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(master_key.trim())
            .map_err(|e| Error::Crypto(format!("invalid base64 master key: {}", e)))?;

        if key_bytes.len() < KEY_SIZE {
            return Err(Error::Crypto(format!(
                "master key too short: {} bytes, minimum {} bytes",
                key_bytes.len(),
                KEY_SIZE
            )));
        }

        let derived = derive_key(&key_bytes, VALUE_KEY_CONTEXT)?;
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

        Ok(EncryptedData {
            nonce: nonce_bytes,
            ciphertext,
        }
        .to_bytes())
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let encrypted = EncryptedData::from_bytes(sealed)?;
        let nonce = Nonce::from_slice(&encrypted.nonce);
        self.cipher
            .decrypt(nonce, encrypted.ciphertext.as_ref())
            .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
    }

    /// Generate a new random master key (for initial setup)
    pub fn generate_master_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }
}

/// Derive a key from master key using HKDF-SHA256
fn derive_key(master_key: &[u8], context: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, master_key);
    let mut output = [0u8; KEY_SIZE];
    hkdf.expand(context, &mut output)
        .map_err(|e| Error::Crypto(format!("key derivation failed: {}", e)))?;
    Ok(output)
}
