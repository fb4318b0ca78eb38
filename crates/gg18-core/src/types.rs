//! Core types for GG18 sessions

use crate::error::{ConfigError, Error};
use k256::ecdsa::{self, RecoveryId, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Index of a party within a keygen (0-based)
pub type PartyId = usize;

/// Unique identifier for a keygen or signing session
pub type SessionId = uuid::Uuid;

/// (t, n) threshold policy: any t+1 of n parties can sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawThreshold", into = "RawThreshold")]
pub struct ThresholdConfig {
    t: usize,
    n: usize,
}

#[derive(Serialize, Deserialize)]
struct RawThreshold {
    t: usize,
    n: usize,
}

impl ThresholdConfig {
    /// Create a threshold config, enforcing `0 < t+1 <= n`
    pub fn new(t: usize, n: usize) -> Result<Self, ConfigError> {
        if n == 0 || t >= n {
            return Err(ConfigError::InvalidThreshold { t, n });
        }
        Ok(Self { t, n })
    }

    /// The threshold t
    pub fn threshold(&self) -> usize {
        self.t
    }

    /// Number of parties n
    pub fn parties(&self) -> usize {
        self.n
    }

    /// Minimum size of a signing subset
    pub fn signers_required(&self) -> usize {
        self.t + 1
    }
}

impl TryFrom<RawThreshold> for ThresholdConfig {
    type Error = ConfigError;

    fn try_from(raw: RawThreshold) -> Result<Self, Self::Error> {
        ThresholdConfig::new(raw.t, raw.n)
    }
}

impl From<ThresholdConfig> for RawThreshold {
    fn from(config: ThresholdConfig) -> Self {
        RawThreshold {
            t: config.t,
            n: config.n,
        }
    }
}

impl fmt::Display for ThresholdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={} n={}", self.t, self.n)
    }
}

/// keccak256 of arbitrary bytes
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(bytes));
    out
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// 32-byte message hash to be signed. Hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageDigest([u8; 32]);

impl MessageDigest {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a hex digest, with or without `0x`
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let bytes = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| ConfigError::MalformedDigest(e.to_string()))?;
        let array: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            ConfigError::MalformedDigest(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(array))
    }

    /// keccak256 of the message, as Ethereum tooling hashes it
    pub fn keccak256(message: &[u8]) -> Self {
        Self(keccak256(message))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageDigest({})", self.to_hex())
    }
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for MessageDigest {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for MessageDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Ethereum-style address derived from a secp256k1 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthAddress([u8; 20]);

impl EthAddress {
    /// Last 20 bytes of keccak256 over the uncompressed point (without the 0x04 tag)
    pub fn from_public_key(public_key: &k256::PublicKey) -> Self {
        let encoded = public_key.to_encoded_point(false);
        let hash = keccak256(&encoded.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..]);
        Self(out)
    }

    /// Derive from a SEC1-encoded public key (compressed or not)
    pub fn from_sec1_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let public_key = k256::PublicKey::from_sec1_bytes(bytes)
            .map_err(|e| Error::Crypto(format!("invalid public key: {}", e)))?;
        Ok(Self::from_public_key(&public_key))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// EIP-55 mixed-case checksum encoding
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = hex::encode(keccak256(lower.as_bytes()));

        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (c, h) in lower.chars().zip(hash.chars()) {
            if c.is_ascii_alphabetic() && h.to_digit(16).unwrap_or(0) > 7 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Debug for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EthAddress({})", self.to_checksum())
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl FromStr for EthAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| ConfigError::MalformedAddress(e.to_string()))?;
        let array: [u8; 20] = bytes.try_into().map_err(|b: Vec<u8>| {
            ConfigError::MalformedAddress(format!("expected 20 bytes, got {}", b.len()))
        })?;
        Ok(Self(array))
    }
}

impl Serialize for EthAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for EthAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key material held by one party after a successful keygen.
///
/// The private share is opaque to the orchestration layer; only the engine
/// that produced it knows how to read it.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Keygen session this material came out of
    #[zeroize(skip)]
    pub keygen_session: SessionId,

    /// Owning party
    pub party_id: PartyId,

    /// Threshold policy of the keygen
    #[zeroize(skip)]
    pub config: ThresholdConfig,

    /// Private share, engine-encoded
    #[serde(with = "hex_bytes")]
    pub share: Vec<u8>,

    /// Joint public key (compressed SEC1)
    #[zeroize(skip)]
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,

    /// Public key shares of all parties (compressed SEC1)
    #[zeroize(skip)]
    #[serde(with = "hex_bytes_vec")]
    pub public_shares: Vec<Vec<u8>>,

    /// Address derived from the joint public key
    #[zeroize(skip)]
    pub address: EthAddress,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("keygen_session", &self.keygen_session)
            .field("party_id", &self.party_id)
            .field("config", &self.config)
            .field("public_key", &hex::encode(&self.public_key))
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// ECDSA signature (r, s) with recovery id v (0 or 1). `s` is low-s normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// R component
    #[serde(with = "hex_array")]
    pub r: [u8; 32],
    /// S component
    #[serde(with = "hex_array")]
    pub s: [u8; 32],
    /// Recovery ID
    pub v: u8,
}

impl Signature {
    /// Create a new signature
    pub fn new(r: [u8; 32], s: [u8; 32], v: u8) -> Self {
        Self { r, s, v }
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    /// Recover the signing public key from the digest
    pub fn recover_public_key(&self, digest: &MessageDigest) -> crate::Result<k256::PublicKey> {
        let signature = ecdsa::Signature::from_scalars(
            *k256::FieldBytes::from_slice(&self.r),
            *k256::FieldBytes::from_slice(&self.s),
        )
        .map_err(|_| Error::InvalidSignature)?;
        let recovery_id = RecoveryId::from_byte(self.v).ok_or(Error::InvalidSignature)?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
            .map_err(|_| Error::InvalidSignature)?;
        Ok(k256::PublicKey::from(&key))
    }

    /// Recover the signer's address from the digest
    pub fn recover_address(&self, digest: &MessageDigest) -> crate::Result<EthAddress> {
        Ok(EthAddress::from_public_key(&self.recover_public_key(digest)?))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = items.iter().map(hex::encode).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid scalar length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_bounds() {
        assert!(ThresholdConfig::new(0, 1).is_ok());
        assert!(ThresholdConfig::new(1, 3).is_ok());
        assert!(ThresholdConfig::new(2, 3).is_ok());
        assert_eq!(
            ThresholdConfig::new(3, 3),
            Err(ConfigError::InvalidThreshold { t: 3, n: 3 })
        );
        assert!(ThresholdConfig::new(0, 0).is_err());

        let config = ThresholdConfig::new(1, 3).unwrap();
        assert_eq!(config.signers_required(), 2);
    }

    #[test]
    fn test_threshold_deserialize_validates() {
        let ok: ThresholdConfig = serde_json::from_str(r#"{"t":1,"n":2}"#).unwrap();
        assert_eq!(ok.parties(), 2);
        assert!(serde_json::from_str::<ThresholdConfig>(r#"{"t":2,"n":2}"#).is_err());
    }

    #[test]
    fn test_digest_parsing() {
        let hex = "aa".repeat(32);
        let plain = MessageDigest::from_hex(&hex).unwrap();
        let prefixed = MessageDigest::from_hex(&format!("0x{}", hex)).unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain.to_hex(), hex);

        assert!(matches!(
            MessageDigest::from_hex("abcd"),
            Err(ConfigError::MalformedDigest(_))
        ));
        assert!(matches!(
            MessageDigest::from_hex("zz"),
            Err(ConfigError::MalformedDigest(_))
        ));
    }

    #[test]
    fn test_eip55_checksum() {
        let address: EthAddress = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse().unwrap();
        assert_eq!(
            address.to_checksum(),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn test_address_of_generator() {
        // Private key 1 has public key G
        let generator = k256::PublicKey::from_affine(k256::AffinePoint::GENERATOR).unwrap();
        let address = EthAddress::from_public_key(&generator);
        assert_eq!(
            address.to_string(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_signature_json_shape() {
        let sig = Signature::new([1u8; 32], [2u8; 32], 1);
        let json = serde_json::to_value(sig).unwrap();
        assert_eq!(json["r"], "01".repeat(32));
        assert_eq!(json["v"], 1);
        let back: Signature = serde_json::from_value(json).unwrap();
        assert_eq!(back, sig);
    }
}
