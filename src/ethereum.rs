//! Address canonicalisation and validation.
//!
//! The tracer keys every address by its trimmed, lower-cased form so that
//! `0xAbC..` and `0xabc..` collapse into one graph node. User-supplied seed
//! addresses are additionally validated as 20-byte hex addresses.

use alloy_primitives::Address;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Regex pattern for BSC/EVM addresses (case-insensitive)
static ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)0x[a-f0-9]{40}$").expect("Invalid regex pattern")
});

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    #[error("Address too short or long: {0}")]
    InvalidLength(String),

    #[error("Zero address cannot be traced")]
    ZeroAddress,
}

/// Canonical graph key for an address: trimmed and lower-cased.
///
/// No format check is applied; any non-empty string is a valid key.
pub fn canonical_address(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Whether `input` looks like a `0x`-prefixed 20-byte hex address.
pub fn is_hex_address(input: &str) -> bool {
    ADDRESS_PATTERN.is_match(input.trim())
}

/// Validated 20-byte address supplied by the user as a trace seed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedAddress(Address);

impl ValidatedAddress {
    /// Parse and validate an address string
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();

        // Normalize: add 0x prefix if missing
        let normalized = if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            format!("0x{}", &trimmed[2..])
        } else {
            format!("0x{}", trimmed)
        };

        if normalized.len() != 42 {
            return Err(AddressError::InvalidLength(input.to_string()));
        }

        if !is_hex_address(&normalized) {
            return Err(AddressError::InvalidFormat(input.to_string()));
        }

        // Lower-case first so mixed-case input is not rejected on checksum
        let address: Address = normalized
            .to_lowercase()
            .parse()
            .map_err(|_| AddressError::InvalidFormat(input.to_string()))?;

        if address.is_zero() {
            return Err(AddressError::ZeroAddress);
        }

        Ok(Self(address))
    }

    /// Canonical lower-case key used by the traversal engine
    pub fn canonical(&self) -> String {
        canonical_address(&self.to_checksum())
    }

    /// EIP-55 checksummed form, for display
    pub fn to_checksum(&self) -> String {
        self.0.to_checksum(None)
    }
}

impl std::fmt::Display for ValidatedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_checksum())
    }
}
