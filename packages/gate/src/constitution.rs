//! ACGS-Gate: Constitutional Hash Guard
//!
//! Every governed artifact (message, audit record, security event) carries a
//! 16-character lowercase hex fingerprint of the constitution it was produced
//! under. The guard compares an observed fingerprint against the process-wide
//! expected value and fails closed on any mismatch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GateError;

/// Length of a constitutional fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 16;

/// A 16-character lowercase hexadecimal constitutional fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Parse a fingerprint, rejecting anything that is not exactly 16
    /// lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self, GateError> {
        let bytes = s.as_bytes();
        if bytes.len() != FINGERPRINT_LEN {
            return Err(GateError::MalformedFingerprint(s.to_string()));
        }
        let mut out = [0u8; FINGERPRINT_LEN];
        for (i, b) in bytes.iter().enumerate() {
            match b {
                b'0'..=b'9' | b'a'..=b'f' => out[i] = *b,
                _ => return Err(GateError::MalformedFingerprint(s.to_string())),
            }
        }
        Ok(Self(out))
    }

    /// The fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        // Invariant: only ASCII hex bytes are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("????????????????")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.as_str())
    }
}

impl FromStr for Fingerprint {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Guard holding the process-wide expected constitutional fingerprint.
#[derive(Debug, Clone)]
pub struct HashGuard {
    expected: Fingerprint,
}

impl HashGuard {
    /// Create a guard for the given expected fingerprint.
    pub fn new(expected: Fingerprint) -> Self {
        Self { expected }
    }

    /// The expected fingerprint.
    pub fn expected(&self) -> Fingerprint {
        self.expected
    }

    /// Constant-time comparison of an observed fingerprint against the
    /// expected one. Anything that is not 16 bytes long fails immediately;
    /// the 16-byte comparison itself never short-circuits.
    pub fn verify(&self, observed: &str) -> bool {
        let observed = observed.as_bytes();
        if observed.len() != FINGERPRINT_LEN {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in self.expected.0.iter().zip(observed.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Require a match, producing the terminal mismatch error otherwise.
    pub fn require(&self, observed: &str) -> Result<(), GateError> {
        if self.verify(observed) {
            Ok(())
        } else {
            Err(GateError::ConstitutionalHashMismatch {
                expected: self.expected.to_string(),
                observed: observed.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "cdd01ef066bc6cf2";

    #[test]
    fn parse_accepts_lowercase_hex() {
        let fp = Fingerprint::parse(HASH).unwrap();
        assert_eq!(fp.to_string(), HASH);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse("cdd01ef066bc6cf").is_err()); // too short
        assert!(Fingerprint::parse("cdd01ef066bc6cf2a").is_err()); // too long
        assert!(Fingerprint::parse("CDD01EF066BC6CF2").is_err()); // uppercase
        assert!(Fingerprint::parse("cdd01ef066bc6cfg").is_err()); // non-hex
    }

    #[test]
    fn verify_matches_expected() {
        let guard = HashGuard::new(Fingerprint::parse(HASH).unwrap());
        assert!(guard.verify(HASH));
        assert!(!guard.verify("0000000000000000"));
        assert!(!guard.verify(""));
        assert!(!guard.verify("cdd01ef066bc6cf2 "));
    }

    #[test]
    fn require_fails_closed() {
        let guard = HashGuard::new(Fingerprint::parse(HASH).unwrap());
        assert!(guard.require(HASH).is_ok());
        let err = guard.require("0000000000000000").unwrap_err();
        assert!(matches!(err, GateError::ConstitutionalHashMismatch { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn serde_round_trip() {
        let fp = Fingerprint::parse(HASH).unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{HASH}\""));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
