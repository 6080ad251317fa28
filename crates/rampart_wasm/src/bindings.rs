//! Host-side callback bindings the guest may invoke.
//!
//! The world-state simulator behind these callbacks is an external
//! collaborator; the bridge only registers a [`StateBindings`] set with the
//! engine at instantiation and unregisters it exactly once at disposal.

use serde::{Deserialize, Serialize};

/// Errors surfaced by host bindings back into the guest
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BindingError {
    /// State load/store failed
    #[error("storage: {0}")]
    Storage(String),

    /// Inter-contract call failed
    #[error("inter-contract call: {0}")]
    Call(String),

    /// Contract deployment failed
    #[error("deployment: {0}")]
    Deployment(String),

    /// ABI input/output accessor failed
    #[error("abi: {0}")]
    Abi(String),
}

/// Callbacks registered with the engine for one instance.
///
/// All methods are instance-scoped; implementations must not share mutable
/// state between instances.
pub trait StateBindings: Send + Sync {
    /// Load a value from world state
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BindingError>;

    /// Store a value into world state
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails
    fn store(&self, key: &[u8], value: &[u8]) -> Result<(), BindingError>;

    /// Smallest stored pointer key greater than `target` whose value is at
    /// least `value_at_least`
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails
    fn next_pointer_value_greater_than(
        &self,
        target: &[u8],
        value_at_least: &[u8],
    ) -> Result<Option<Vec<u8>>, BindingError>;

    /// Synchronous inter-contract call
    ///
    /// # Errors
    ///
    /// Returns error if the callee fails
    fn call_contract(&self, address: &[u8], calldata: &[u8]) -> Result<Vec<u8>, BindingError>;

    /// Deploy contract bytecode at a fixed address
    ///
    /// # Errors
    ///
    /// Returns error if deployment fails
    fn deploy_contract_at_address(
        &self,
        address: &[u8],
        bytecode: &[u8],
    ) -> Result<(), BindingError>;

    /// Guest log line
    fn log(&self, message: &str);

    /// Guest event emission
    fn emit(&self, event: &[u8]);

    /// ABI call inputs accessor
    ///
    /// # Errors
    ///
    /// Returns error if inputs are unavailable
    fn inputs(&self) -> Result<Vec<u8>, BindingError>;

    /// ABI call outputs accessor
    ///
    /// # Errors
    ///
    /// Returns error if outputs are unavailable
    fn outputs(&self) -> Result<Vec<u8>, BindingError>;
}

/// Bindings that answer every callback with an empty result.
///
/// Useful for contracts whose calls never touch world state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBindings;

impl StateBindings for NullBindings {
    fn load(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, BindingError> {
        Ok(None)
    }

    fn store(&self, _key: &[u8], _value: &[u8]) -> Result<(), BindingError> {
        Ok(())
    }

    fn next_pointer_value_greater_than(
        &self,
        _target: &[u8],
        _value_at_least: &[u8],
    ) -> Result<Option<Vec<u8>>, BindingError> {
        Ok(None)
    }

    fn call_contract(&self, _address: &[u8], _calldata: &[u8]) -> Result<Vec<u8>, BindingError> {
        Ok(Vec::new())
    }

    fn deploy_contract_at_address(
        &self,
        _address: &[u8],
        _bytecode: &[u8],
    ) -> Result<(), BindingError> {
        Ok(())
    }

    fn log(&self, message: &str) {
        tracing::debug!("guest log: {}", message);
    }

    fn emit(&self, _event: &[u8]) {}

    fn inputs(&self) -> Result<Vec<u8>, BindingError> {
        Ok(Vec::new())
    }

    fn outputs(&self) -> Result<Vec<u8>, BindingError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_bindings_empty_answers() {
        let b = NullBindings;
        assert_eq!(b.load(b"key").unwrap(), None);
        assert!(b.store(b"key", b"value").is_ok());
        assert_eq!(b.call_contract(b"addr", b"data").unwrap(), Vec::<u8>::new());
        assert_eq!(b.inputs().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_binding_error_display() {
        let err = BindingError::Storage("disk full".to_string());
        assert_eq!(err.to_string(), "storage: disk full");
    }
}
