//! Identity and integrity types for walletsync.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Size of a compressed SEC1 public key.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of a compact recoverable signature (header byte + r + s).
pub const SIGNATURE_SIZE: usize = 65;

/// SHA-256 digest of an encrypted wallet blob.
///
/// This is the version identifier both replicas compare: the local side keeps
/// the last hash known to be in sync with the remote, the remote keeps the hash
/// of whatever it currently stores. Serialized as standard base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalletHash([u8; 32]);

impl WalletHash {
    /// Hash the given bytes.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Create a WalletHash from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as standard base64 (the wire representation).
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Decode from standard base64.
    pub fn from_base64(text: &str) -> Result<Self, TypesError> {
        let bytes = STANDARD
            .decode(text.as_bytes())
            .map_err(|e| TypesError::InvalidEncoding {
                kind: "wallet hash",
                reason: e.to_string(),
            })?;
        Self::from_bytes(&bytes).ok_or(TypesError::InvalidLength {
            kind: "wallet hash",
            expected: 32,
            actual: bytes.len(),
        })
    }
}

impl fmt::Display for WalletHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for WalletHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletHash({})", &self.to_string()[..12])
    }
}

impl Serialize for WalletHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WalletHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// A compressed secp256k1 public key (33 bytes).
///
/// This type only carries bytes; curve validation is the key provider's job.
/// Its string form (lowercase hex) is the stable identifier the remote store
/// files wallets under.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create a PublicKey from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == PUBLIC_KEY_SIZE {
            let mut arr = [0u8; PUBLIC_KEY_SIZE];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_string()[..12])
    }
}

impl FromStr for PublicKey {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| TypesError::InvalidEncoding {
            kind: "public key",
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes).ok_or(TypesError::InvalidLength {
            kind: "public key",
            expected: PUBLIC_KEY_SIZE,
            actual: bytes.len(),
        })
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A compact recoverable ECDSA signature (65 bytes).
///
/// Layout: `header (27 + 4 + recovery_id) || r (32) || s (32)`.
/// Serialized as standard base64.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create a Signature from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == SIGNATURE_SIZE {
            let mut arr = [0u8; SIGNATURE_SIZE];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &hex::encode(&self.0[..6]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                bytes.len()
            ))
        })
    }
}
