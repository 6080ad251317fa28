//! Unique identifiers for RAMPART entities.
//!
//! Instance identities are opaque numbers handed out by the engine; the
//! bridge never derives meaning from their value.

use serde::{Deserialize, Serialize};

/// Instance identifier - identifies one live guest instance inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Create from a raw engine-assigned value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inst_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_roundtrip() {
        let id = InstanceId::from_raw(42);
        assert_eq!(id.as_raw(), 42);
    }

    #[test]
    fn test_instance_id_display() {
        let id = InstanceId::from_raw(7);
        assert_eq!(id.to_string(), "inst_7");
    }

    #[test]
    fn test_instance_id_ordering() {
        assert!(InstanceId::from_raw(1) < InstanceId::from_raw(2));
    }
}
