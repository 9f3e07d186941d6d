//! Protocol versioning.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the line protocol spoken by sensors, monitors and the daemon.
///
/// Peers are compatible when their major versions agree. Minor versions only
/// add optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version implemented by this crate.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Returns true if a peer speaking `other` can talk to us.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_follows_major() {
        let current = ProtocolVersion::CURRENT;
        assert!(current.is_compatible_with(&ProtocolVersion::new(1, 7)));
        assert!(!current.is_compatible_with(&ProtocolVersion::new(2, 0)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ProtocolVersion::new(1, 3).to_string(), "1.3");
    }
}
