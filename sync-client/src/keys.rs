//! Asymmetric key provider.
//!
//! This module provides:
//! - The [`KeyProvider`] trait the envelope and engine consume
//! - [`Secp256k1Provider`], the default implementation on `k256`
//! - [`PrivateKey`], zeroized on drop and redacted in debug output
//!
//! # Security Notes
//!
//! - Signatures are 65-byte compact recoverable ECDSA over a 32-byte hash
//! - Key derivation is deterministic: `private = SHA-256(seed)`
//! - The raw ECDH output (x-coordinate) is returned in a zeroizing buffer

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walletsync_types::{PublicKey, Signature, SIGNATURE_SIZE};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Private key size (256 bits = 32 bytes).
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Offset added to the recovery id in the signature header byte
/// (27 + 4 marks a compressed public key).
const COMPACT_HEADER: u8 = 27 + 4;

/// Key provider errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Bytes do not encode a valid private key.
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Bytes do not encode a point on the curve.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature is malformed or no key can be recovered from it.
    #[error("invalid signature")]
    InvalidSignature,

    /// Signing failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// The system RNG failed.
    #[error("random number generation failed: {0}")]
    Random(String),
}

/// A private key.
///
/// The bytes are wiped when the key is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_SIZE]);

impl PrivateKey {
    /// Wrap raw key bytes (not validated; providers validate on use).
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.0
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// Asymmetric key operations consumed by the envelope and the engine.
pub trait KeyProvider: Send + Sync {
    /// Deterministically derive a keypair from seed material.
    fn derive_key_pair(&self, seed: &[u8]) -> Result<(PrivateKey, PublicKey), KeyError>;

    /// Public key of a private key.
    fn public_key(&self, private: &PrivateKey) -> Result<PublicKey, KeyError>;

    /// Parse and validate an encoded public key.
    fn parse_public_key(&self, bytes: &[u8]) -> Result<PublicKey, KeyError>;

    /// ECDH shared secret between a private and a public key.
    fn ecdh(
        &self,
        private: &PrivateKey,
        public: &PublicKey,
    ) -> Result<Zeroizing<Vec<u8>>, KeyError>;

    /// Sign a 32-byte hash.
    fn sign(&self, hash: &[u8; 32], private: &PrivateKey) -> Result<Signature, KeyError>;

    /// Recover the signer's public key from a signature over `hash`.
    fn recover_public_key(
        &self,
        signature: &Signature,
        hash: &[u8; 32],
    ) -> Result<PublicKey, KeyError>;

    /// Generate a fresh keypair from a secure random 32-byte seed.
    fn generate_key_pair(&self) -> Result<(PrivateKey, PublicKey), KeyError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(&mut seed[..]).map_err(|e| KeyError::Random(e.to_string()))?;
        self.derive_key_pair(&seed[..])
    }

    /// Sign `SHA-256(data)`.
    fn sign_data(&self, data: &[u8], private: &PrivateKey) -> Result<Signature, KeyError> {
        self.sign(&sha256(data), private)
    }

    /// Recover the signer of `SHA-256(data)`.
    fn recover_data_signer(
        &self,
        signature: &Signature,
        data: &[u8],
    ) -> Result<PublicKey, KeyError> {
        self.recover_public_key(signature, &sha256(data))
    }
}

/// secp256k1 key provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Provider;

impl Secp256k1Provider {
    /// Create a new provider.
    pub fn new() -> Self {
        Self
    }

    fn secret_key(private: &PrivateKey) -> Result<k256::SecretKey, KeyError> {
        k256::SecretKey::from_slice(private.as_bytes()).map_err(|_| KeyError::InvalidPrivateKey)
    }

    fn parse_public(public: &PublicKey) -> Result<k256::PublicKey, KeyError> {
        k256::PublicKey::from_sec1_bytes(public.as_bytes()).map_err(|_| KeyError::InvalidPublicKey)
    }

    fn encode_public(key: &k256::PublicKey) -> Result<PublicKey, KeyError> {
        let point = key.to_encoded_point(true);
        PublicKey::from_bytes(point.as_bytes()).ok_or(KeyError::InvalidPublicKey)
    }
}

impl KeyProvider for Secp256k1Provider {
    fn derive_key_pair(&self, seed: &[u8]) -> Result<(PrivateKey, PublicKey), KeyError> {
        let private = PrivateKey(sha256(seed));
        let public = self.public_key(&private)?;
        Ok((private, public))
    }

    fn public_key(&self, private: &PrivateKey) -> Result<PublicKey, KeyError> {
        let secret = Self::secret_key(private)?;
        Self::encode_public(&secret.public_key())
    }

    fn parse_public_key(&self, bytes: &[u8]) -> Result<PublicKey, KeyError> {
        let point =
            k256::PublicKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::encode_public(&point)
    }

    fn ecdh(
        &self,
        private: &PrivateKey,
        public: &PublicKey,
    ) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let secret = Self::secret_key(private)?;
        let point = Self::parse_public(public)?;
        let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), point.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }

    fn sign(&self, hash: &[u8; 32], private: &PrivateKey) -> Result<Signature, KeyError> {
        let secret = Self::secret_key(private)?;
        let signing_key = SigningKey::from(&secret);
        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(hash)
            .map_err(|e| KeyError::SigningFailed(e.to_string()))?;

        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[0] = COMPACT_HEADER + recovery_id.to_byte();
        bytes[1..].copy_from_slice(&signature.to_bytes());
        Signature::from_bytes(&bytes).ok_or(KeyError::InvalidSignature)
    }

    fn recover_public_key(
        &self,
        signature: &Signature,
        hash: &[u8; 32],
    ) -> Result<PublicKey, KeyError> {
        let bytes = signature.as_bytes();
        let recovery_byte = bytes[0]
            .checked_sub(COMPACT_HEADER)
            .ok_or(KeyError::InvalidSignature)?;
        let recovery_id = RecoveryId::from_byte(recovery_byte).ok_or(KeyError::InvalidSignature)?;
        let signature =
            EcdsaSignature::from_slice(&bytes[1..]).map_err(|_| KeyError::InvalidSignature)?;

        let verifying_key = VerifyingKey::recover_from_prehash(hash, &signature, recovery_id)
            .map_err(|_| KeyError::InvalidSignature)?;
        Self::encode_public(&k256::PublicKey::from(&verifying_key))
    }
}

/// SHA-256 of `data` as a fixed array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Key Derivation Tests
    // ===========================================

    #[test]
    fn derivation_is_deterministic() {
        let provider = Secp256k1Provider::new();
        let (priv1, pub1) = provider.derive_key_pair(b"alice@example.com|alice|hunter2").unwrap();
        let (priv2, pub2) = provider.derive_key_pair(b"alice@example.com|alice|hunter2").unwrap();

        assert_eq!(priv1.as_bytes(), priv2.as_bytes());
        assert_eq!(pub1, pub2);
    }

    #[test]
    fn different_seeds_differ() {
        let provider = Secp256k1Provider::new();
        let (_, pub1) = provider.derive_key_pair(b"seed-1").unwrap();
        let (_, pub2) = provider.derive_key_pair(b"seed-2").unwrap();
        assert_ne!(pub1, pub2);
    }

    #[test]
    fn public_key_is_compressed() {
        let provider = Secp256k1Provider::new();
        let (_, public) = provider.derive_key_pair(b"seed").unwrap();
        assert!(matches!(public.as_bytes()[0], 0x02 | 0x03));
    }

    #[test]
    fn generated_pairs_are_random() {
        let provider = Secp256k1Provider::new();
        let (_, pub1) = provider.generate_key_pair().unwrap();
        let (_, pub2) = provider.generate_key_pair().unwrap();
        assert_ne!(pub1, pub2);
    }

    // ===========================================
    // ECDH Tests
    // ===========================================

    #[test]
    fn ecdh_is_symmetric() {
        let provider = Secp256k1Provider::new();
        let (a_priv, a_pub) = provider.generate_key_pair().unwrap();
        let (b_priv, b_pub) = provider.generate_key_pair().unwrap();

        let ab = provider.ecdh(&a_priv, &b_pub).unwrap();
        let ba = provider.ecdh(&b_priv, &a_pub).unwrap();

        assert_eq!(ab.as_slice(), ba.as_slice());
        assert_eq!(ab.len(), 32);
    }

    #[test]
    fn ecdh_rejects_off_curve_point() {
        let provider = Secp256k1Provider::new();
        let (private, _) = provider.generate_key_pair().unwrap();
        let bogus = PublicKey::from_bytes(&[0x05; 33]).unwrap();

        let result = provider.ecdh(&private, &bogus);
        assert!(matches!(result, Err(KeyError::InvalidPublicKey)));
    }

    // ===========================================
    // Signature Tests
    // ===========================================

    #[test]
    fn parse_public_key_validates_point() {
        let keys = Secp256k1Provider::new();
        let (_, public) = keys.derive_key_pair(b"seed").unwrap();
        assert_eq!(keys.parse_public_key(public.as_bytes()).unwrap(), public);

        let mut off_curve = *public.as_bytes();
        off_curve[0] = 0x05;
        assert!(matches!(
            keys.parse_public_key(&off_curve),
            Err(KeyError::InvalidPublicKey)
        ));
        assert!(keys.parse_public_key(&public.as_bytes()[..32]).is_err());
    }

    #[test]
    fn sign_then_recover() {
        let provider = Secp256k1Provider::new();
        let (private, public) = provider.derive_key_pair(b"signer").unwrap();
        let hash = sha256(b"encrypted wallet bytes");

        let signature = provider.sign(&hash, &private).unwrap();
        let recovered = provider.recover_public_key(&signature, &hash).unwrap();

        assert_eq!(recovered, public);
        assert!((31..=34).contains(&signature.as_bytes()[0]));
    }

    #[test]
    fn recover_with_other_hash_yields_other_key() {
        let provider = Secp256k1Provider::new();
        let (private, public) = provider.derive_key_pair(b"signer").unwrap();
        let signature = provider.sign_data(b"original", &private).unwrap();

        match provider.recover_data_signer(&signature, b"tampered") {
            Ok(recovered) => assert_ne!(recovered, public),
            Err(e) => assert!(matches!(e, KeyError::InvalidSignature)),
        }
    }

    #[test]
    fn bad_header_byte_is_rejected() {
        let provider = Secp256k1Provider::new();
        let (private, _) = provider.derive_key_pair(b"signer").unwrap();
        let hash = sha256(b"data");
        let mut bytes = *provider.sign(&hash, &private).unwrap().as_bytes();
        bytes[0] = 0;

        let signature = Signature::from_bytes(&bytes).unwrap();
        let result = provider.recover_public_key(&signature, &hash);
        assert!(matches!(result, Err(KeyError::InvalidSignature)));
    }

    #[test]
    fn private_key_debug_is_redacted() {
        let key = PrivateKey::from_bytes([0xAB; 32]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.to_lowercase().contains("abab"));
    }
}
