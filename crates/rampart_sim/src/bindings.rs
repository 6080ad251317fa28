//! Recording host bindings for assertions.

use rampart_wasm::bindings::{BindingError, StateBindings};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// [`StateBindings`] implementation that captures every callback.
///
/// Storage is a plain ordered map, logs and events are append-only, and
/// the ABI input/output buffers are settable up front.
#[derive(Debug, Default)]
pub struct RecordingBindings {
    storage: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    logs: Mutex<Vec<String>>,
    events: Mutex<Vec<Vec<u8>>>,
    inputs: Mutex<Vec<u8>>,
    outputs: Mutex<Vec<u8>>,
}

impl RecordingBindings {
    /// Create empty bindings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured log lines
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Captured emitted events
    #[must_use]
    pub fn events(&self) -> Vec<Vec<u8>> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stored value for a key, if any
    #[must_use]
    pub fn stored(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.storage
            .lock()
            .ok()
            .and_then(|s| s.get(key).cloned())
    }

    /// Install the ABI inputs buffer
    pub fn set_inputs(&self, inputs: Vec<u8>) {
        if let Ok(mut guard) = self.inputs.lock() {
            *guard = inputs;
        }
    }

    /// Install the ABI outputs buffer
    pub fn set_outputs(&self, outputs: Vec<u8>) {
        if let Ok(mut guard) = self.outputs.lock() {
            *guard = outputs;
        }
    }
}

fn poisoned(what: &str) -> BindingError {
    BindingError::Storage(format!("{what} lock poisoned"))
}

impl StateBindings for RecordingBindings {
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BindingError> {
        Ok(self
            .storage
            .lock()
            .map_err(|_| poisoned("storage"))?
            .get(key)
            .cloned())
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<(), BindingError> {
        self.storage
            .lock()
            .map_err(|_| poisoned("storage"))?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn next_pointer_value_greater_than(
        &self,
        target: &[u8],
        value_at_least: &[u8],
    ) -> Result<Option<Vec<u8>>, BindingError> {
        let storage = self.storage.lock().map_err(|_| poisoned("storage"))?;
        Ok(storage
            .range(target.to_vec()..)
            .find(|(key, value)| key.as_slice() > target && value.as_slice() >= value_at_least)
            .map(|(key, _)| key.clone()))
    }

    fn call_contract(&self, _address: &[u8], calldata: &[u8]) -> Result<Vec<u8>, BindingError> {
        Ok(calldata.to_vec())
    }

    fn deploy_contract_at_address(
        &self,
        _address: &[u8],
        _bytecode: &[u8],
    ) -> Result<(), BindingError> {
        Ok(())
    }

    fn log(&self, message: &str) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(message.to_string());
        }
    }

    fn emit(&self, event: &[u8]) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.to_vec());
        }
    }

    fn inputs(&self) -> Result<Vec<u8>, BindingError> {
        Ok(self
            .inputs
            .lock()
            .map_err(|_| poisoned("inputs"))?
            .clone())
    }

    fn outputs(&self) -> Result<Vec<u8>, BindingError> {
        Ok(self
            .outputs
            .lock()
            .map_err(|_| poisoned("outputs"))?
            .clone())
    }
}
