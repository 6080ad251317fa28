//! Synchronous contract handle.
//!
//! A [`ContractHandle`] owns one guest instance end-to-end: lazy
//! instantiation, host binding registration, the gas-metered call surface,
//! pin/unpin reference tracking, and disposal. Guest exports run as plain
//! function calls; marshalling and gas bookkeeping happen inline with no
//! suspension.
//!
//! Single-flight per instance is enforced statically: every operation takes
//! `&mut self`, so a second call cannot be issued while one is in flight.

use crate::abort;
use crate::bindings::StateBindings;
use crate::codec::{self, CodecError};
use crate::engine::{CallOutcome, ContractEngine, EngineError, ExportValue, GuestExport};
use crate::error::{VmError, VmResult};
use crate::gas::{GasTracker, MeterFn};
use crate::memory;
use crate::refcount::RefTable;
use rampart_core::{GuestPtr, InstanceId, NetworkTag};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Instantiation parameters for one contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractParams {
    /// Contract bytecode; opaque to the bridge
    pub bytecode: Vec<u8>,
    /// Gas limit for the instance
    pub max_gas: u64,
    /// Network tag forwarded at instantiation
    pub network: NetworkTag,
}

impl ContractParams {
    /// Create params with default gas limit and network
    #[must_use]
    pub fn new(bytecode: Vec<u8>) -> Self {
        Self {
            bytecode,
            max_gas: 100_000_000,
            network: NetworkTag::default(),
        }
    }

    /// Set the gas limit
    #[must_use]
    pub fn with_max_gas(mut self, max_gas: u64) -> Self {
        self.max_gas = max_gas;
        self
    }

    /// Set the network tag
    #[must_use]
    pub fn with_network(mut self, network: NetworkTag) -> Self {
        self.network = network;
        self
    }
}

/// Lifecycle of a contract handle. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No guest instance exists yet
    Uninstantiated,
    /// Instance is live under the carried identity
    Instantiated(InstanceId),
    /// Instance has been torn down
    Disposed,
}

/// Owner of one guest instance's lifecycle and call surface
pub struct ContractHandle<E: ContractEngine> {
    engine: Arc<E>,
    params: ContractParams,
    bindings: Arc<dyn StateBindings>,
    state: LifecycleState,
    refs: RefTable,
    gas: GasTracker,
    meter: MeterFn,
    collected: bool,
    final_gas: Option<u64>,
}

impl<E: ContractEngine> ContractHandle<E> {
    /// Create a handle; the guest is instantiated lazily on first use
    #[must_use]
    pub fn new(engine: Arc<E>, params: ContractParams, bindings: Arc<dyn StateBindings>) -> Self {
        Self {
            engine,
            params,
            bindings,
            state: LifecycleState::Uninstantiated,
            refs: RefTable::new(),
            gas: GasTracker::new(),
            meter: Box::new(|_, _| {}),
            collected: false,
            final_gas: None,
        }
    }

    /// Install the metering callback receiving `(delta, export_name)`
    #[must_use]
    pub fn with_meter(mut self, meter: impl FnMut(u64, &str) + Send + 'static) -> Self {
        self.meter = Box::new(meter);
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Instance identity; instantiates the guest on first access
    ///
    /// # Errors
    ///
    /// Returns error if instantiation fails or the handle is disposed
    pub fn instance_id(&mut self) -> VmResult<InstanceId> {
        self.ensure_instantiated()
    }

    /// Gas reading snapshotted at disposal, if it succeeded
    #[must_use]
    pub fn final_gas(&self) -> Option<u64> {
        self.final_gas
    }

    /// Number of currently retained pointers
    #[must_use]
    pub fn tracked_pointers(&self) -> usize {
        self.refs.len()
    }

    // ---- lifecycle ------------------------------------------------------

    fn ensure_instantiated(&mut self) -> VmResult<InstanceId> {
        match self.state {
            LifecycleState::Disposed => Err(VmError::Disposed),
            LifecycleState::Instantiated(id) => Ok(id),
            LifecycleState::Uninstantiated => {
                let id = self.engine.reserve_instance()?;
                self.engine
                    .register_bindings(id, Arc::clone(&self.bindings))?;
                if let Err(err) = self.engine.instantiate(
                    id,
                    &self.params.bytecode,
                    self.params.max_gas,
                    self.params.network,
                ) {
                    // keep register/unregister balanced on the failure path
                    if let Err(unreg) = self.engine.unregister_bindings(id) {
                        tracing::warn!(instance = %id, error = %unreg, "binding cleanup failed");
                    }
                    return Err(err.into());
                }
                tracing::debug!(
                    instance = %id,
                    network = %self.params.network,
                    max_gas = self.params.max_gas,
                    "guest instantiated"
                );
                self.state = LifecycleState::Instantiated(id);
                Ok(id)
            }
        }
    }

    /// Tear the instance down. Idempotent; a no-op if never instantiated.
    ///
    /// The `gas_used` reading is snapshotted before teardown; if that read
    /// fails the failure is captured rather than propagated, and teardown
    /// always completes. A captured contention failure re-raises as
    /// [`VmError::Reentrancy`] afterwards; any other captured failure is
    /// logged and swallowed.
    ///
    /// # Errors
    ///
    /// Returns error only for the contention case above
    pub fn dispose(&mut self) -> VmResult<()> {
        let id = match self.state {
            LifecycleState::Instantiated(id) => id,
            _ => {
                self.state = LifecycleState::Disposed;
                return Ok(());
            }
        };
        let gas_failure = match self.engine.gas_used(id) {
            Ok(gas) => {
                self.final_gas = Some(gas);
                None
            }
            Err(err) => Some(err),
        };
        self.refs.clear();
        if let Err(err) = self.engine.unregister_bindings(id) {
            tracing::warn!(instance = %id, error = %err, "binding unregistration failed");
        }
        if let Err(err) = self.engine.destroy(id) {
            tracing::warn!(instance = %id, error = %err, "instance destruction failed");
        }
        self.gas.reset();
        self.collected = false;
        self.state = LifecycleState::Disposed;
        tracing::debug!(instance = %id, final_gas = ?self.final_gas, "guest disposed");
        match gas_failure {
            Some(EngineError::Contention(context)) => Err(VmError::Reentrancy { context }),
            Some(other) => {
                tracing::warn!(instance = %id, error = %other, "gas snapshot failed at disposal");
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ---- metered dispatch ----------------------------------------------

    fn dispatch(&mut self, export: GuestExport, args: &[ExportValue]) -> VmResult<CallOutcome> {
        let id = self.ensure_instantiated()?;
        let engine = Arc::clone(&self.engine);
        match engine.call(id, export, args) {
            Ok(outcome) => {
                let delta = self.gas.observe(outcome.gas_used);
                (self.meter)(delta, export.wire_name());
                Ok(outcome)
            }
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err))
            }
        }
    }

    fn engine_op<T>(
        &mut self,
        op: impl FnOnce(&E, InstanceId) -> Result<T, EngineError>,
    ) -> VmResult<T> {
        let id = self.ensure_instantiated()?;
        let engine = Arc::clone(&self.engine);
        match op(engine.as_ref(), id) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err))
            }
        }
    }

    fn translate_failure(&mut self, err: EngineError) -> VmError {
        match err {
            EngineError::AbortSignal => self.translate_abort(),
            other => VmError::Engine(other),
        }
    }

    /// Recover the abort diagnostics and dispose the instance; guest state
    /// after an uncaught abort is not assumed safely reusable.
    fn translate_abort(&mut self) -> VmError {
        let LifecycleState::Instantiated(id) = self.state else {
            return VmError::Engine(EngineError::AbortSignal);
        };
        let record = match self.engine.abort_record(id) {
            Ok(record) => record,
            Err(err) => return VmError::Engine(err),
        };
        let message = memory::lift_string(self.engine.as_ref(), id, record.message_ptr)
            .ok()
            .flatten();
        let file_name = memory::lift_string(self.engine.as_ref(), id, record.file_ptr)
            .ok()
            .flatten();
        let err = abort::aborted(message, file_name, &record);
        tracing::debug!(instance = %id, error = %err, "guest abort translated");
        if let Err(dispose_err) = self.dispose() {
            tracing::warn!(instance = %id, error = %dispose_err, "disposal after abort failed");
        }
        err
    }

    // ---- allocation and pinning primitives -----------------------------

    fn guest_new(&mut self, size: u32, class_id: u32) -> VmResult<GuestPtr> {
        let outcome = self.dispatch(
            GuestExport::New,
            &[ExportValue::U32(size), ExportValue::U32(class_id)],
        )?;
        outcome
            .first_ptr()
            .ok_or_else(|| EngineError::Runtime("__new returned no pointer".to_string()).into())
    }

    fn guest_pin(&mut self, ptr: GuestPtr) -> VmResult<GuestPtr> {
        let outcome = self.dispatch(GuestExport::Pin, &[ExportValue::U32(ptr.as_raw())])?;
        // __pin may hand back a canonical pointer
        Ok(outcome.first_ptr().unwrap_or(ptr))
    }

    fn guest_unpin(&mut self, ptr: GuestPtr) -> VmResult<()> {
        self.dispatch(GuestExport::Unpin, &[ExportValue::U32(ptr.as_raw())])?;
        Ok(())
    }

    /// Run a guest garbage-collection sweep
    ///
    /// # Errors
    ///
    /// Returns error if the sweep fails
    pub fn collect(&mut self) -> VmResult<()> {
        self.dispatch(GuestExport::Collect, &[])?;
        self.collected = true;
        Ok(())
    }

    // ---- reference tracking --------------------------------------------

    /// Retain a guest pointer, pinning it on first retain.
    ///
    /// Returns the canonical pointer to use for the call and the matching
    /// [`release`](Self::release). A no-op for the null pointer.
    ///
    /// # Errors
    ///
    /// Returns error if the pin call fails
    pub fn retain(&mut self, ptr: GuestPtr) -> VmResult<GuestPtr> {
        if ptr.is_null() {
            return Ok(ptr);
        }
        if self.refs.increment_if_tracked(ptr) {
            return Ok(ptr);
        }
        let canonical = self.guest_pin(ptr)?;
        self.refs.insert_new(canonical);
        Ok(canonical)
    }

    /// Release a previously retained pointer, unpinning at count zero.
    /// A no-op for the null pointer.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Refcount`] for an untracked pointer - a
    /// retain/release imbalance in the caller
    pub fn release(&mut self, ptr: GuestPtr) -> VmResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        match self.refs.count(ptr) {
            0 => Err(VmError::Refcount { pointer: ptr }),
            1 => {
                self.guest_unpin(ptr)?;
                self.refs.remove(ptr);
                Ok(())
            }
            _ => {
                self.refs.decrement(ptr);
                Ok(())
            }
        }
    }

    // ---- marshalling ----------------------------------------------------

    /// Lift a guest string; `None` for the null pointer
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn lift_string(&mut self, ptr: GuestPtr) -> VmResult<Option<String>> {
        let id = self.ensure_instantiated()?;
        memory::lift_string(self.engine.as_ref(), id, ptr)
    }

    /// Lift a guest byte array as an owned copy; `None` for the null pointer
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn lift_bytes(&mut self, ptr: GuestPtr) -> VmResult<Option<Vec<u8>>> {
        let id = self.ensure_instantiated()?;
        memory::lift_typed_array(self.engine.as_ref(), id, ptr)
    }

    /// Lower a byte array into guest memory and return its header pointer.
    ///
    /// `None` lowers to the null pointer without any allocation. The
    /// transient payload pin is released on both the success and failure
    /// path; the returned header is the caller's to retain/release.
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the writes fail
    pub fn lower_typed_array(
        &mut self,
        bytes: Option<&[u8]>,
        element_id: u32,
    ) -> VmResult<GuestPtr> {
        let Some(bytes) = bytes else {
            return Ok(GuestPtr::NULL);
        };
        let byte_len =
            u32::try_from(bytes.len()).map_err(|_| CodecError::Oversize { len: bytes.len() })?;
        // allocate -> pin -> write header/payload -> unpin transient buffer
        let payload = self.guest_new(byte_len, codec::ARRAY_BUFFER_ID)?;
        let payload = self.guest_pin(payload)?;
        let header = self.lower_array_body(payload, byte_len, bytes, element_id);
        let unpinned = self.guest_unpin(payload);
        let header = header?;
        unpinned?;
        Ok(header)
    }

    fn lower_array_body(
        &mut self,
        payload: GuestPtr,
        byte_len: u32,
        bytes: &[u8],
        element_id: u32,
    ) -> VmResult<GuestPtr> {
        let header = self.guest_new(codec::ARRAY_HEADER_BYTES, element_id)?;
        self.write_guest(header, &codec::encode_array_header(payload, byte_len))?;
        self.write_guest(payload, bytes)?;
        Ok(header)
    }

    /// Lower a byte buffer with the byte-array class id
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the writes fail
    pub fn lower_bytes(&mut self, bytes: &[u8]) -> VmResult<GuestPtr> {
        self.lower_typed_array(Some(bytes), codec::UINT8_ARRAY_ID)
    }

    /// Lower a host string as guest UTF-16LE; `None` lowers to null
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the write fails
    pub fn lower_string(&mut self, s: Option<&str>) -> VmResult<GuestPtr> {
        let Some(s) = s else {
            return Ok(GuestPtr::NULL);
        };
        let payload = codec::encode_utf16_le(s);
        let byte_len =
            u32::try_from(payload.len()).map_err(|_| CodecError::Oversize { len: payload.len() })?;
        let ptr = self.guest_new(byte_len, codec::STRING_ID)?;
        self.write_guest(ptr, &payload)?;
        Ok(ptr)
    }

    fn write_guest(&mut self, ptr: GuestPtr, bytes: &[u8]) -> VmResult<()> {
        self.engine_op(|engine, id| engine.write_memory(id, u64::from(ptr.as_raw()), bytes))
    }

    // ---- uniform call helpers ------------------------------------------

    fn call_with_buffer(&mut self, export: GuestExport, buffer: &[u8]) -> VmResult<CallOutcome> {
        let ptr = self.lower_bytes(buffer)?;
        let ptr = self.retain(ptr)?;
        let result = self.dispatch(export, &[ExportValue::U32(ptr.as_raw())]);
        let released = self.release(ptr);
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    fn call_buffer_out(&mut self, export: GuestExport, buffer: &[u8]) -> VmResult<Vec<u8>> {
        let outcome = self.call_with_buffer(export, buffer)?;
        self.lift_result(&outcome)
    }

    fn call_out(&mut self, export: GuestExport) -> VmResult<Vec<u8>> {
        let outcome = self.dispatch(export, &[])?;
        self.lift_result(&outcome)
    }

    fn lift_result(&mut self, outcome: &CallOutcome) -> VmResult<Vec<u8>> {
        let Some(ptr) = outcome.first_ptr() else {
            return Ok(Vec::new());
        };
        Ok(self.lift_bytes(ptr)?.unwrap_or_default())
    }

    // ---- contract export surface ---------------------------------------

    /// Execute a contract call with the given calldata
    ///
    /// # Errors
    ///
    /// Returns error if the call traps, aborts, or the handle is disposed
    pub fn execute(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.collected = false;
        self.call_buffer_out(GuestExport::Execute, calldata)
    }

    /// Install the execution environment buffer
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn set_environment(&mut self, buffer: &[u8]) -> VmResult<()> {
        self.call_with_buffer(GuestExport::SetEnvironment, buffer)?;
        Ok(())
    }

    /// Run the deployment hook with the given calldata
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn on_deploy(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.collected = false;
        self.call_buffer_out(GuestExport::OnDeploy, calldata)
    }

    /// Invoke a write method
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn read_method(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.collected = false;
        self.call_buffer_out(GuestExport::ReadMethod, calldata)
    }

    /// Invoke a view method
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn read_view(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.call_buffer_out(GuestExport::ReadView, calldata)
    }

    /// Fetch the view-method ABI blob
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn get_view_abi(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetViewAbi)
    }

    /// Fetch the method ABI blob
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn get_method_abi(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetMethodAbi)
    }

    /// Fetch the write-method selector list
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn get_write_methods(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetWriteMethods)
    }

    /// Fetch events emitted by the last call
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn get_events(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetEvents)
    }

    /// Fetch storage slots modified by the last call
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn get_modified_storage(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetModifiedStorage)
    }

    /// Fetch outstanding inter-contract call requests
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn get_calls(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetCalls)
    }

    /// Seed initial storage
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn initialize_storage(&mut self, buffer: &[u8]) -> VmResult<()> {
        self.call_with_buffer(GuestExport::InitializeStorage, buffer)?;
        Ok(())
    }

    /// Load persisted storage into the guest.
    ///
    /// Loading requires a fresh collection sweep; one is run first if none
    /// has happened since the last mutating call.
    ///
    /// # Errors
    ///
    /// Returns error if the sweep or the call fails
    pub fn load_storage(&mut self, buffer: &[u8]) -> VmResult<()> {
        if !self.collected {
            self.collect()?;
        }
        self.call_with_buffer(GuestExport::LoadStorage, buffer)?;
        Ok(())
    }

    /// Feed responses for outstanding inter-contract calls
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn load_calls_response(&mut self, buffer: &[u8]) -> VmResult<()> {
        self.call_with_buffer(GuestExport::LoadCallsResponse, buffer)?;
        Ok(())
    }

    /// Register method selectors
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub fn define_selectors(&mut self) -> VmResult<()> {
        self.dispatch(GuestExport::DefineSelectors, &[])?;
        Ok(())
    }

    // ---- gas accessors --------------------------------------------------

    /// Cumulative gas used by the instance
    ///
    /// # Errors
    ///
    /// Returns error if the reading fails
    pub fn used_gas(&mut self) -> VmResult<u64> {
        self.engine_op(|engine, id| engine.gas_used(id))
    }

    /// Overwrite the cumulative gas reading
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn set_used_gas(&mut self, gas: u64) -> VmResult<()> {
        self.engine_op(|engine, id| engine.set_gas_used(id, gas))
    }

    /// Charge gas against the remaining budget
    ///
    /// # Errors
    ///
    /// Returns error if the budget is exhausted
    pub fn use_gas(&mut self, amount: u64) -> VmResult<()> {
        self.engine_op(|engine, id| engine.use_gas(id, amount))
    }

    /// Gas remaining before the limit
    ///
    /// # Errors
    ///
    /// Returns error if the reading fails
    pub fn remaining_gas(&mut self) -> VmResult<u64> {
        self.engine_op(|engine, id| engine.remaining_gas(id))
    }

    /// Overwrite the remaining-gas budget
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn set_remaining_gas(&mut self, gas: u64) -> VmResult<()> {
        self.engine_op(|engine, id| engine.set_remaining_gas(id, gas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults() {
        let params = ContractParams::new(vec![0x00, 0x61, 0x73, 0x6D]);
        assert_eq!(params.max_gas, 100_000_000);
        assert_eq!(params.network, NetworkTag::Regtest);
    }

    #[test]
    fn test_params_builder() {
        let params = ContractParams::new(Vec::new())
            .with_max_gas(5_000)
            .with_network(NetworkTag::Testnet);
        assert_eq!(params.max_gas, 5_000);
        assert_eq!(params.network, NetworkTag::Testnet);
    }

    #[test]
    fn test_lifecycle_state_equality() {
        assert_eq!(
            LifecycleState::Instantiated(InstanceId::from_raw(3)),
            LifecycleState::Instantiated(InstanceId::from_raw(3))
        );
        assert_ne!(LifecycleState::Uninstantiated, LifecycleState::Disposed);
    }
}
