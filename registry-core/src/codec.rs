//! Canonical encoding of field elements and proof bundles
//!
//! Identity commitments and proof points are elements of the BN254 scalar
//! field. They travel as 32 big-endian bytes and must be strictly below the
//! field modulus; anything else is rejected at the boundary so the rest of
//! the crate never sees a non-canonical value.
//!
//! Proof bundles are opaque to the registry. Only their shape is fixed:
//!
//! ```text
//! protocol tag (1) || curve tag (1) || 8 × field element (32 each)
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of an encoded field element
pub const FIELD_BYTES: usize = 32;

/// BN254 scalar field modulus, big-endian
const BN254_SCALAR_MODULUS: [u8; FIELD_BYTES] = [
    0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81, 0x58, 0x5d,
    0x28, 0x33, 0xe8, 0x48, 0x79, 0xb9, 0x70, 0x91, 0x43, 0xe1, 0xf5, 0x93, 0xf0, 0x00, 0x00, 0x01,
];

/// Canonical field element (big-endian, below the BN254 scalar modulus)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct FieldValue([u8; FIELD_BYTES]);

impl FieldValue {
    /// The zero element
    pub const ZERO: FieldValue = FieldValue([0u8; FIELD_BYTES]);

    /// Decode 32 big-endian bytes, rejecting values at or above the modulus
    pub fn from_be_bytes(bytes: [u8; FIELD_BYTES]) -> Result<Self> {
        // Lexicographic order on big-endian bytes is numeric order
        if bytes >= BN254_SCALAR_MODULUS {
            return Err(Error::InvalidCommitment(format!(
                "0x{} is not below the field modulus",
                hex::encode(bytes)
            )));
        }
        Ok(Self(bytes))
    }

    /// Decode from a slice that must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; FIELD_BYTES] = bytes.try_into().map_err(|_| {
            Error::InvalidCommitment(format!("expected {} bytes, got {}", FIELD_BYTES, bytes.len()))
        })?;
        Self::from_be_bytes(array)
    }

    /// Build from a small integer (always canonical)
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; FIELD_BYTES];
        bytes[FIELD_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Parse `0x`-prefixed (or bare) hex, left-padded to 32 bytes
    pub fn from_hex(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() || digits.len() > FIELD_BYTES * 2 {
            return Err(Error::InvalidCommitment(format!("bad hex length: {}", s)));
        }
        let padded = format!("{:0>width$}", digits, width = FIELD_BYTES * 2);
        let decoded = hex::decode(&padded)
            .map_err(|e| Error::InvalidCommitment(format!("bad hex {}: {}", s, e)))?;
        Self::from_slice(&decoded)
    }

    /// Parse a base-10 integer
    pub fn from_decimal(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidCommitment("empty decimal".to_string()));
        }

        let mut bytes = [0u8; FIELD_BYTES];
        for ch in s.chars() {
            let digit = ch
                .to_digit(10)
                .ok_or_else(|| Error::InvalidCommitment(format!("bad decimal digit in {}", s)))?;

            // bytes = bytes * 10 + digit
            let mut carry = digit;
            for byte in bytes.iter_mut().rev() {
                let acc = (*byte as u32) * 10 + carry;
                *byte = (acc & 0xff) as u8;
                carry = acc >> 8;
            }
            if carry != 0 {
                return Err(Error::InvalidCommitment(format!("{} exceeds 256 bits", s)));
            }
        }

        Self::from_be_bytes(bytes)
    }

    /// Big-endian bytes
    pub fn to_be_bytes(&self) -> [u8; FIELD_BYTES] {
        self.0
    }

    /// Borrow the big-endian bytes
    pub fn as_bytes(&self) -> &[u8; FIELD_BYTES] {
        &self.0
    }

    /// Whether this is the zero element
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; FIELD_BYTES]
    }

    /// Value as u64 if it fits
    pub fn to_u64(&self) -> Option<u64> {
        if self.0[..FIELD_BYTES - 8].iter().any(|b| *b != 0) {
            return None;
        }
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[FIELD_BYTES - 8..]);
        Some(u64::from_be_bytes(low))
    }
}

impl TryFrom<[u8; FIELD_BYTES]> for FieldValue {
    type Error = Error;

    fn try_from(bytes: [u8; FIELD_BYTES]) -> Result<Self> {
        Self::from_be_bytes(bytes)
    }
}

impl From<FieldValue> for [u8; FIELD_BYTES] {
    fn from(value: FieldValue) -> Self {
        value.0
    }
}

impl FromStr for FieldValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("0x") {
            Self::from_hex(s)
        } else {
            Self::from_decimal(s)
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldValue({})", self)
    }
}

/// Proof system discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProofProtocol {
    /// Groth16 SNARK
    Groth16 = 1,
}

impl ProofProtocol {
    /// Wire tag
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Parse from wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ProofProtocol::Groth16),
            _ => None,
        }
    }

    /// Conventional name
    pub fn name(&self) -> &'static str {
        match self {
            ProofProtocol::Groth16 => "groth16",
        }
    }
}

/// Curve discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Curve {
    /// BN254 (a.k.a. bn128 / alt_bn128)
    Bn254 = 1,
}

impl Curve {
    /// Wire tag
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Parse from wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Curve::Bn254),
            _ => None,
        }
    }

    /// Conventional name
    pub fn name(&self) -> &'static str {
        match self {
            Curve::Bn254 => "bn128",
        }
    }
}

/// Number of field elements in a proof: a (2), b (4), c (2)
pub const PROOF_POINTS: usize = 8;

/// Opaque proof bundle, passed through to the verifier untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Proof system
    pub protocol: ProofProtocol,
    /// Curve the points live on
    pub curve: Curve,
    /// Point coordinates in a, b, c order
    pub points: [FieldValue; PROOF_POINTS],
}

impl Proof {
    /// Encoded length in bytes
    pub const ENCODED_LEN: usize = 2 + PROOF_POINTS * FIELD_BYTES;

    /// Groth16 / BN254 bundle
    pub fn groth16(points: [FieldValue; PROOF_POINTS]) -> Self {
        Self {
            protocol: ProofProtocol::Groth16,
            curve: Curve::Bn254,
            points,
        }
    }

    /// `a` point (G1)
    pub fn a(&self) -> [FieldValue; 2] {
        [self.points[0], self.points[1]]
    }

    /// `b` point (G2)
    pub fn b(&self) -> [FieldValue; 4] {
        [self.points[2], self.points[3], self.points[4], self.points[5]]
    }

    /// `c` point (G1)
    pub fn c(&self) -> [FieldValue; 2] {
        [self.points[6], self.points[7]]
    }

    /// Structural check done before a proof is handed to the verifier.
    ///
    /// An all-zero bundle is structurally invalid and never reaches the
    /// verifier.
    pub fn check_shape(&self) -> Result<()> {
        if self.points.iter().all(FieldValue::is_zero) {
            return Err(Error::InvalidProofShape("all proof points are zero".to_string()));
        }
        Ok(())
    }

    /// Canonical bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.push(self.protocol.tag());
        out.push(self.curve.tag());
        for point in &self.points {
            out.extend_from_slice(point.as_bytes());
        }
        out
    }

    /// Decode canonical bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::InvalidProofShape(format!(
                "expected {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }

        let protocol = ProofProtocol::from_tag(bytes[0])
            .ok_or_else(|| Error::InvalidProofShape(format!("unknown protocol tag {}", bytes[0])))?;
        let curve = Curve::from_tag(bytes[1])
            .ok_or_else(|| Error::InvalidProofShape(format!("unknown curve tag {}", bytes[1])))?;

        let mut points = [FieldValue::ZERO; PROOF_POINTS];
        for (i, chunk) in bytes[2..].chunks_exact(FIELD_BYTES).enumerate() {
            points[i] = FieldValue::from_slice(chunk)
                .map_err(|e| Error::InvalidProofShape(format!("point {}: {}", i, e)))?;
        }

        Ok(Self {
            protocol,
            curve,
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULUS_DECIMAL: &str =
        "21888242871839275222246405745257511950750368739177004523237434763547328495617";

    #[test]
    fn test_modulus_rejected() {
        assert!(FieldValue::from_be_bytes(BN254_SCALAR_MODULUS).is_err());
        assert!(FieldValue::from_decimal(MODULUS_DECIMAL).is_err());
        assert!(FieldValue::from_be_bytes([0xff; 32]).is_err());
    }

    #[test]
    fn test_largest_element_accepted() {
        let max = FieldValue::from_decimal(
            "21888242871839275222246405745257511950750368739177004523237434763547328495616",
        )
        .unwrap();
        assert_eq!(
            max.to_string(),
            "0x30644e72e131a029b85045b68181585d2833e84879b9709143e1f593f0000000"
        );
    }

    #[test]
    fn test_hex_and_decimal_agree() {
        let from_hex = FieldValue::from_hex("0x2a").unwrap();
        let from_dec: FieldValue = "42".parse().unwrap();
        assert_eq!(from_hex, from_dec);
        assert_eq!(from_hex, FieldValue::from_u64(42));
        assert_eq!(from_hex.to_u64(), Some(42));
        // Odd-length hex is left padded
        assert_eq!(FieldValue::from_hex("abc").unwrap(), FieldValue::from_u64(0xabc));
    }

    #[test]
    fn test_bad_input() {
        assert!(FieldValue::from_hex("0x").is_err());
        assert!(FieldValue::from_hex("0xzz").is_err());
        assert!(FieldValue::from_decimal("12a").is_err());
        assert!(FieldValue::from_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_serde_rejects_non_canonical() {
        let encoded = bincode::serialize(&[0xffu8; 32]).unwrap();
        assert!(bincode::deserialize::<FieldValue>(&encoded).is_err());
    }

    #[test]
    fn test_proof_bytes() {
        let points = std::array::from_fn(|i| FieldValue::from_u64(i as u64 + 1));
        let proof = Proof::groth16(points);
        let bytes = proof.to_bytes();
        assert_eq!(bytes.len(), Proof::ENCODED_LEN);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 1);
        assert_eq!(Proof::from_bytes(&bytes).unwrap(), proof);
        assert_eq!(proof.b()[0], FieldValue::from_u64(3));
        assert_eq!(proof.c()[1], FieldValue::from_u64(8));
    }

    #[test]
    fn test_proof_bad_tags() {
        let proof = Proof::groth16([FieldValue::from_u64(1); PROOF_POINTS]);
        let mut bytes = proof.to_bytes();
        bytes[0] = 9;
        assert!(matches!(Proof::from_bytes(&bytes), Err(Error::InvalidProofShape(_))));
        assert!(Proof::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_empty_proof_shape() {
        let proof = Proof::groth16([FieldValue::ZERO; PROOF_POINTS]);
        assert!(proof.check_shape().is_err());
    }
}
