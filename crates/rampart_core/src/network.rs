//! Network tags for contract instantiation.

use serde::{Deserialize, Serialize};

/// Network a contract instance is bound to.
///
/// Passed to the engine at instantiation so guest code can select
/// network-dependent constants; the bridge itself only forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkTag {
    /// Production network
    Mainnet,
    /// Public test network
    Testnet,
    /// Local regression-test network
    Regtest,
}

impl NetworkTag {
    /// Wire name understood by the engine
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

impl Default for NetworkTag {
    fn default() -> Self {
        Self::Regtest
    }
}

impl std::fmt::Display for NetworkTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_tag_wire_names() {
        assert_eq!(NetworkTag::Mainnet.as_str(), "mainnet");
        assert_eq!(NetworkTag::Testnet.as_str(), "testnet");
        assert_eq!(NetworkTag::Regtest.as_str(), "regtest");
    }

    #[test]
    fn test_network_tag_default() {
        assert_eq!(NetworkTag::default(), NetworkTag::Regtest);
    }
}
