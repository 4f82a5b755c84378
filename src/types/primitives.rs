// Primitives - Fundamental types shared by every staking component
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Block height reported by the chain
pub type BlockNumber = u64;

/// Epoch index (the first epoch is 1)
pub type EpochNumber = u64;

/// Stake and reward amounts
/// u128 so that products of two realistic amounts still fit before flooring
pub type Balance = u128;

/// Denominator for commission rates expressed in basis points
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Account address (32 bytes)
/// Serialized as a full lowercase hex string, displayed shortened
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address([u8; 32]);

impl Address {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Deterministic address for a human readable name (Blake3 of the seed)
    pub fn from_seed(seed: &str) -> Self {
        Address(*blake3::hash(seed.as_bytes()).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for Address {
    fn from(bytes: [u8; 32]) -> Self {
        Address(bytes)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_hex()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| AddressError::InvalidHex(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| AddressError::InvalidLength(v.len()))?;
        Ok(Address(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid hex address: {0}")]
    InvalidHex(String),

    #[error("Address must be 32 bytes, got {0}")]
    InvalidLength(usize),
}
