//! 128-bit globally unique attachment identifiers.
//!
//! Every attachment carries one GUID for its lifetime. The canonical form is
//! 32 lowercase hex characters; the *short* form (first 8 characters) is the
//! token used in peer exchanges and unique-name minting.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::status::Status;

/// A 128-bit globally unique identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid128(Uuid);

impl Guid128 {
    /// Number of hex characters in the short string form.
    pub const SHORT_LEN: usize = 8;

    /// Generates a fresh random GUID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a GUID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw 16 bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Canonical 32-hex-character string form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    /// Short string form used in peer exchanges and unique names.
    #[must_use]
    pub fn short(&self) -> String {
        self.to_hex()[..Self::SHORT_LEN].to_string()
    }

    /// Returns true if `s` parses as a GUID (32 hex characters, hyphens
    /// tolerated).
    #[must_use]
    pub fn is_guid(s: &str) -> bool {
        s.parse::<Self>().is_ok()
    }
}

impl FromStr for Guid128 {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != '-').collect();
        if compact.len() != 32 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Status::InvalidGuid);
        }
        Uuid::parse_str(&compact).map(Self).map_err(|_| Status::InvalidGuid)
    }
}

impl fmt::Display for Guid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
