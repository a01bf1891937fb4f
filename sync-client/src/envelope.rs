//! Envelope encryption for wallet objects.
//!
//! An envelope is addressed to a recipient public key and can only be opened
//! with the matching private key:
//!
//! ```text
//! [onetime public key: 33][AES-256-CBC( [checksum: 4][lzma(json)] )]
//! ```
//!
//! - A fresh onetime keypair is generated per encryption
//! - `SHA-512(nonce || ECDH(onetime, recipient))` gives key (first 32 bytes)
//!   and IV (next 16 bytes)
//! - `checksum = SHA-256(compressed)[..4]` is the only integrity check and
//!   is verified before decompression
//!
//! Compression runs on the blocking thread pool.

use std::io::Read;
use std::sync::Arc;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use walletsync_types::{PublicKey, PUBLIC_KEY_SIZE};
use xz2::stream::{LzmaOptions, Stream};
use zeroize::Zeroizing;

use crate::keys::{KeyError, KeyProvider, PrivateKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Size of the integrity checksum prefix.
pub const CHECKSUM_SIZE: usize = 4;

/// Symmetric key size (AES-256).
const KEY_SIZE: usize = 32;

/// CBC initialization vector size.
const IV_SIZE: usize = 16;

/// Maximum LZMA compression level.
const LZMA_PRESET: u32 = 9;

/// Envelope errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The blob does not start with a valid onetime public key.
    #[error("invalid backup: not an encrypted wallet")]
    InvalidBackup,

    /// Wrong key, or the ciphertext was modified.
    #[error("invalid decryption key")]
    InvalidDecryptionKey,

    /// The checksum matched but the payload did not decompress.
    #[error("decompression failed: {0}")]
    DecompressionError(String),

    /// The payload is not valid JSON.
    #[error("malformed wallet: {0}")]
    MalformedWallet(String),

    /// Compressing the payload failed.
    #[error("compression failed: {0}")]
    CompressionError(String),

    /// The cipher could not be initialized.
    #[error("cipher setup failed: {0}")]
    Cipher(String),

    /// The recipient key is unusable.
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// Encrypts and decrypts wallet objects.
///
/// Stateless apart from the key provider and an optional nonce mixed into
/// key derivation.
#[derive(Clone)]
pub struct Envelope {
    keys: Arc<dyn KeyProvider>,
    nonce: Vec<u8>,
}

impl Envelope {
    /// Create an envelope codec with an empty nonce.
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            keys,
            nonce: Vec::new(),
        }
    }

    /// Mix a nonce into key derivation.
    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.nonce = nonce.into();
        self
    }

    /// Encrypt `wallet` for `recipient`.
    pub async fn encrypt(
        &self,
        wallet: &Value,
        recipient: &PublicKey,
    ) -> Result<Vec<u8>, EnvelopeError> {
        let (onetime_private, onetime_public) = self.keys.generate_key_pair()?;
        let shared = self.keys.ecdh(&onetime_private, recipient)?;
        let (key, iv) = derive_cipher_key(&self.nonce, &shared);

        // serde_json's default map is ordered, so this is canonical
        let json =
            serde_json::to_vec(wallet).map_err(|e| EnvelopeError::MalformedWallet(e.to_string()))?;
        let compressed = tokio::task::spawn_blocking(move || compress(&json))
            .await
            .map_err(|e| EnvelopeError::CompressionError(e.to_string()))??;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(CHECKSUM_SIZE + compressed.len()));
        plaintext.extend_from_slice(&checksum(&compressed));
        plaintext.extend_from_slice(&compressed);

        let cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv[..])
            .map_err(|e| EnvelopeError::Cipher(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut blob = Vec::with_capacity(PUBLIC_KEY_SIZE + ciphertext.len());
        blob.extend_from_slice(onetime_public.as_bytes());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob with the recipient's private key.
    pub async fn decrypt(
        &self,
        blob: &[u8],
        recipient: &PrivateKey,
    ) -> Result<Value, EnvelopeError> {
        if blob.len() < PUBLIC_KEY_SIZE {
            return Err(EnvelopeError::InvalidBackup);
        }
        let (onetime, ciphertext) = blob.split_at(PUBLIC_KEY_SIZE);
        let onetime = self
            .keys
            .parse_public_key(onetime)
            .map_err(|_| EnvelopeError::InvalidBackup)?;
        let shared = self.keys.ecdh(recipient, &onetime)?;
        let (key, iv) = derive_cipher_key(&self.nonce, &shared);

        if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
            return Err(EnvelopeError::InvalidDecryptionKey);
        }
        let cipher = Aes256CbcDec::new_from_slices(&key[..], &iv[..])
            .map_err(|_| EnvelopeError::InvalidDecryptionKey)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| EnvelopeError::InvalidDecryptionKey)?,
        );

        if plaintext.len() < CHECKSUM_SIZE {
            return Err(EnvelopeError::InvalidDecryptionKey);
        }
        let (expected, compressed) = plaintext.split_at(CHECKSUM_SIZE);
        if checksum(compressed) != expected {
            return Err(EnvelopeError::InvalidDecryptionKey);
        }

        let compressed = compressed.to_vec();
        let json = tokio::task::spawn_blocking(move || decompress(&compressed))
            .await
            .map_err(|e| EnvelopeError::DecompressionError(e.to_string()))??;

        serde_json::from_slice(&json).map_err(|e| EnvelopeError::MalformedWallet(e.to_string()))
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("nonce_len", &self.nonce.len())
            .finish()
    }
}

/// Split `SHA-512(nonce || secret)` into an AES key and IV.
fn derive_cipher_key(
    nonce: &[u8],
    secret: &[u8],
) -> (Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; IV_SIZE]>) {
    let mut hasher = Sha512::new();
    hasher.update(nonce);
    hasher.update(secret);
    let digest = hasher.finalize();

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let mut iv = Zeroizing::new([0u8; IV_SIZE]);
    key.copy_from_slice(&digest[..KEY_SIZE]);
    iv.copy_from_slice(&digest[KEY_SIZE..KEY_SIZE + IV_SIZE]);
    (key, iv)
}

fn checksum(compressed: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = Sha256::digest(compressed);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest[..CHECKSUM_SIZE]);
    out
}

fn compress(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let options = LzmaOptions::new_preset(LZMA_PRESET)
        .map_err(|e| EnvelopeError::CompressionError(e.to_string()))?;
    let stream = Stream::new_lzma_encoder(&options)
        .map_err(|e| EnvelopeError::CompressionError(e.to_string()))?;

    let mut out = Vec::new();
    xz2::read::XzEncoder::new_stream(data, stream)
        .read_to_end(&mut out)
        .map_err(|e| EnvelopeError::CompressionError(e.to_string()))?;
    Ok(out)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let stream = Stream::new_lzma_decoder(u64::MAX)
        .map_err(|e| EnvelopeError::DecompressionError(e.to_string()))?;

    let mut out = Vec::new();
    xz2::read::XzDecoder::new_stream(data, stream)
        .read_to_end(&mut out)
        .map_err(|e| EnvelopeError::DecompressionError(e.to_string()))?;
    Ok(out)
}
