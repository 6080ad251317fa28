//! Asynchronous contract handle.
//!
//! Mirrors [`ContractHandle`](crate::handle::ContractHandle) for engines
//! whose calls must be awaited (remote or multi-threaded). Every
//! marshalling sub-step - allocate, pin, write, unpin - is individually
//! awaited, preserving ordering while letting unrelated host work
//! interleave at the suspension points. Concurrent guest calls on one
//! instance remain forbidden.
//!
//! Beyond the `&mut self` receiver, an in-flight guard survives a caller
//! abandoning an awaited call: the flag stays set, and every later call
//! fails with [`VmError::Reentrancy`] instead of silently interleaving
//! against a guest that is not proven reentrant-safe. `dispose` does not
//! dispatch and therefore still tears the instance down.

use crate::abort;
use crate::bindings::StateBindings;
use crate::codec::{self, CodecError};
use crate::engine::{AsyncContractEngine, CallOutcome, EngineError, ExportValue, GuestExport};
use crate::error::{VmError, VmResult};
use crate::gas::{GasTracker, MeterFn};
use crate::handle::{ContractParams, LifecycleState};
use crate::memory;
use crate::refcount::RefTable;
use rampart_core::{GuestPtr, InstanceId};
use std::sync::Arc;

/// Owner of one guest instance's lifecycle and call surface, asynchronous
/// shape
pub struct AsyncContractHandle<E: AsyncContractEngine> {
    engine: Arc<E>,
    params: ContractParams,
    bindings: Arc<dyn StateBindings>,
    state: LifecycleState,
    refs: RefTable,
    gas: GasTracker,
    meter: MeterFn,
    collected: bool,
    in_flight: bool,
    final_gas: Option<u64>,
}

impl<E: AsyncContractEngine> AsyncContractHandle<E> {
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
            in_flight: false,
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
    pub async fn instance_id(&mut self) -> VmResult<InstanceId> {
        self.ensure_instantiated().await
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

    async fn ensure_instantiated(&mut self) -> VmResult<InstanceId> {
        match self.state {
            LifecycleState::Disposed => Err(VmError::Disposed),
            LifecycleState::Instantiated(id) => Ok(id),
            LifecycleState::Uninstantiated => {
                let id = self.engine.reserve_instance().await?;
                self.engine
                    .register_bindings(id, Arc::clone(&self.bindings))
                    .await?;
                if let Err(err) = self
                    .engine
                    .instantiate(
                        id,
                        &self.params.bytecode,
                        self.params.max_gas,
                        self.params.network,
                    )
                    .await
                {
                    if let Err(unreg) = self.engine.unregister_bindings(id).await {
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
    /// Same contract as the synchronous shape: the gas snapshot failure is
    /// captured, teardown always completes, and a captured contention
    /// failure re-raises as [`VmError::Reentrancy`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns error only for the contention case above
    pub async fn dispose(&mut self) -> VmResult<()> {
        let id = match self.state {
            LifecycleState::Instantiated(id) => id,
            _ => {
                self.state = LifecycleState::Disposed;
                return Ok(());
            }
        };
        let gas_failure = match self.engine.gas_used(id).await {
            Ok(gas) => {
                self.final_gas = Some(gas);
                None
            }
            Err(err) => Some(err),
        };
        self.refs.clear();
        if let Err(err) = self.engine.unregister_bindings(id).await {
            tracing::warn!(instance = %id, error = %err, "binding unregistration failed");
        }
        if let Err(err) = self.engine.destroy(id).await {
            tracing::warn!(instance = %id, error = %err, "instance destruction failed");
        }
        self.gas.reset();
        self.collected = false;
        self.in_flight = false;
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

    async fn dispatch(
        &mut self,
        export: GuestExport,
        args: &[ExportValue],
    ) -> VmResult<CallOutcome> {
        if self.in_flight {
            return Err(VmError::Reentrancy {
                context: format!("{} issued while a call is in flight", export.wire_name()),
            });
        }
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        self.in_flight = true;
        let result = engine.call(id, export, args).await;
        self.in_flight = false;
        match result {
            Ok(outcome) => {
                let delta = self.gas.observe(outcome.gas_used);
                (self.meter)(delta, export.wire_name());
                Ok(outcome)
            }
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }

    async fn translate_failure(&mut self, err: EngineError) -> VmError {
        match err {
            EngineError::AbortSignal => self.translate_abort().await,
            other => VmError::Engine(other),
        }
    }

    async fn translate_abort(&mut self) -> VmError {
        let LifecycleState::Instantiated(id) = self.state else {
            return VmError::Engine(EngineError::AbortSignal);
        };
        let record = match self.engine.abort_record(id).await {
            Ok(record) => record,
            Err(err) => return VmError::Engine(err),
        };
        let message = memory::lift_string_async(self.engine.as_ref(), id, record.message_ptr)
            .await
            .ok()
            .flatten();
        let file_name = memory::lift_string_async(self.engine.as_ref(), id, record.file_ptr)
            .await
            .ok()
            .flatten();
        let err = abort::aborted(message, file_name, &record);
        tracing::debug!(instance = %id, error = %err, "guest abort translated");
        if let Err(dispose_err) = self.dispose().await {
            tracing::warn!(instance = %id, error = %dispose_err, "disposal after abort failed");
        }
        err
    }

    // ---- allocation and pinning primitives -----------------------------

    async fn guest_new(&mut self, size: u32, class_id: u32) -> VmResult<GuestPtr> {
        let outcome = self
            .dispatch(
                GuestExport::New,
                &[ExportValue::U32(size), ExportValue::U32(class_id)],
            )
            .await?;
        outcome
            .first_ptr()
            .ok_or_else(|| EngineError::Runtime("__new returned no pointer".to_string()).into())
    }

    async fn guest_pin(&mut self, ptr: GuestPtr) -> VmResult<GuestPtr> {
        let outcome = self
            .dispatch(GuestExport::Pin, &[ExportValue::U32(ptr.as_raw())])
            .await?;
        Ok(outcome.first_ptr().unwrap_or(ptr))
    }

    async fn guest_unpin(&mut self, ptr: GuestPtr) -> VmResult<()> {
        self.dispatch(GuestExport::Unpin, &[ExportValue::U32(ptr.as_raw())])
            .await?;
        Ok(())
    }

    /// Run a guest garbage-collection sweep
    ///
    /// # Errors
    ///
    /// Returns error if the sweep fails
    pub async fn collect(&mut self) -> VmResult<()> {
        self.dispatch(GuestExport::Collect, &[]).await?;
        self.collected = true;
        Ok(())
    }

    // ---- reference tracking --------------------------------------------

    /// Retain a guest pointer, pinning it on first retain
    ///
    /// # Errors
    ///
    /// Returns error if the pin call fails
    pub async fn retain(&mut self, ptr: GuestPtr) -> VmResult<GuestPtr> {
        if ptr.is_null() {
            return Ok(ptr);
        }
        if self.refs.increment_if_tracked(ptr) {
            return Ok(ptr);
        }
        let canonical = self.guest_pin(ptr).await?;
        self.refs.insert_new(canonical);
        Ok(canonical)
    }

    /// Release a previously retained pointer, unpinning at count zero
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Refcount`] for an untracked pointer
    pub async fn release(&mut self, ptr: GuestPtr) -> VmResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        match self.refs.count(ptr) {
            0 => Err(VmError::Refcount { pointer: ptr }),
            1 => {
                self.guest_unpin(ptr).await?;
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
    pub async fn lift_string(&mut self, ptr: GuestPtr) -> VmResult<Option<String>> {
        let id = self.ensure_instantiated().await?;
        memory::lift_string_async(self.engine.as_ref(), id, ptr).await
    }

    /// Lift a guest byte array as an owned copy; `None` for the null pointer
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub async fn lift_bytes(&mut self, ptr: GuestPtr) -> VmResult<Option<Vec<u8>>> {
        let id = self.ensure_instantiated().await?;
        memory::lift_typed_array_async(self.engine.as_ref(), id, ptr).await
    }

    /// Lower a byte array into guest memory and return its header pointer.
    ///
    /// Every sub-step is awaited in order: allocate, pin, write header and
    /// payload, unpin the transient buffer. The transient pin is released
    /// on both the success and failure path.
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the writes fail
    pub async fn lower_typed_array(
        &mut self,
        bytes: Option<&[u8]>,
        element_id: u32,
    ) -> VmResult<GuestPtr> {
        let Some(bytes) = bytes else {
            return Ok(GuestPtr::NULL);
        };
        let byte_len =
            u32::try_from(bytes.len()).map_err(|_| CodecError::Oversize { len: bytes.len() })?;
        let payload = self.guest_new(byte_len, codec::ARRAY_BUFFER_ID).await?;
        let payload = self.guest_pin(payload).await?;
        let header = self
            .lower_array_body(payload, byte_len, bytes, element_id)
            .await;
        let unpinned = self.guest_unpin(payload).await;
        let header = header?;
        unpinned?;
        Ok(header)
    }

    async fn lower_array_body(
        &mut self,
        payload: GuestPtr,
        byte_len: u32,
        bytes: &[u8],
        element_id: u32,
    ) -> VmResult<GuestPtr> {
        let header = self.guest_new(codec::ARRAY_HEADER_BYTES, element_id).await?;
        self.write_guest(header, &codec::encode_array_header(payload, byte_len))
            .await?;
        self.write_guest(payload, bytes).await?;
        Ok(header)
    }

    /// Lower a byte buffer with the byte-array class id
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the writes fail
    pub async fn lower_bytes(&mut self, bytes: &[u8]) -> VmResult<GuestPtr> {
        self.lower_typed_array(Some(bytes), codec::UINT8_ARRAY_ID)
            .await
    }

    /// Lower a host string as guest UTF-16LE; `None` lowers to null
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the write fails
    pub async fn lower_string(&mut self, s: Option<&str>) -> VmResult<GuestPtr> {
        let Some(s) = s else {
            return Ok(GuestPtr::NULL);
        };
        let payload = codec::encode_utf16_le(s);
        let byte_len =
            u32::try_from(payload.len()).map_err(|_| CodecError::Oversize { len: payload.len() })?;
        let ptr = self.guest_new(byte_len, codec::STRING_ID).await?;
        self.write_guest(ptr, &payload).await?;
        Ok(ptr)
    }

    async fn write_guest(&mut self, ptr: GuestPtr, bytes: &[u8]) -> VmResult<()> {
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        match engine
            .write_memory(id, u64::from(ptr.as_raw()), bytes)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }

    // ---- uniform call helpers ------------------------------------------

    async fn call_with_buffer(
        &mut self,
        export: GuestExport,
        buffer: &[u8],
    ) -> VmResult<CallOutcome> {
        let ptr = self.lower_bytes(buffer).await?;
        let ptr = self.retain(ptr).await?;
        let result = self
            .dispatch(export, &[ExportValue::U32(ptr.as_raw())])
            .await;
        let released = self.release(ptr).await;
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn call_buffer_out(&mut self, export: GuestExport, buffer: &[u8]) -> VmResult<Vec<u8>> {
        let outcome = self.call_with_buffer(export, buffer).await?;
        self.lift_result(&outcome).await
    }

    async fn call_out(&mut self, export: GuestExport) -> VmResult<Vec<u8>> {
        let outcome = self.dispatch(export, &[]).await?;
        self.lift_result(&outcome).await
    }

    async fn lift_result(&mut self, outcome: &CallOutcome) -> VmResult<Vec<u8>> {
        let Some(ptr) = outcome.first_ptr() else {
            return Ok(Vec::new());
        };
        Ok(self.lift_bytes(ptr).await?.unwrap_or_default())
    }

    // ---- contract export surface ---------------------------------------

    /// Execute a contract call with the given calldata
    ///
    /// # Errors
    ///
    /// Returns error if the call traps, aborts, or the handle is disposed
    pub async fn execute(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.collected = false;
        self.call_buffer_out(GuestExport::Execute, calldata).await
    }

    /// Install the execution environment buffer
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn set_environment(&mut self, buffer: &[u8]) -> VmResult<()> {
        self.call_with_buffer(GuestExport::SetEnvironment, buffer)
            .await?;
        Ok(())
    }

    /// Run the deployment hook with the given calldata
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn on_deploy(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.collected = false;
        self.call_buffer_out(GuestExport::OnDeploy, calldata).await
    }

    /// Invoke a write method
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn read_method(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.collected = false;
        self.call_buffer_out(GuestExport::ReadMethod, calldata).await
    }

    /// Invoke a view method
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn read_view(&mut self, calldata: &[u8]) -> VmResult<Vec<u8>> {
        self.call_buffer_out(GuestExport::ReadView, calldata).await
    }

    /// Fetch the view-method ABI blob
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn get_view_abi(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetViewAbi).await
    }

    /// Fetch the method ABI blob
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn get_method_abi(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetMethodAbi).await
    }

    /// Fetch the write-method selector list
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn get_write_methods(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetWriteMethods).await
    }

    /// Fetch events emitted by the last call
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn get_events(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetEvents).await
    }

    /// Fetch storage slots modified by the last call
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn get_modified_storage(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetModifiedStorage).await
    }

    /// Fetch outstanding inter-contract call requests
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn get_calls(&mut self) -> VmResult<Vec<u8>> {
        self.call_out(GuestExport::GetCalls).await
    }

    /// Seed initial storage
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn initialize_storage(&mut self, buffer: &[u8]) -> VmResult<()> {
        self.call_with_buffer(GuestExport::InitializeStorage, buffer)
            .await?;
        Ok(())
    }

    /// Load persisted storage into the guest, running a collection sweep
    /// first if none is fresh
    ///
    /// # Errors
    ///
    /// Returns error if the sweep or the call fails
    pub async fn load_storage(&mut self, buffer: &[u8]) -> VmResult<()> {
        if !self.collected {
            self.collect().await?;
        }
        self.call_with_buffer(GuestExport::LoadStorage, buffer)
            .await?;
        Ok(())
    }

    /// Feed responses for outstanding inter-contract calls
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn load_calls_response(&mut self, buffer: &[u8]) -> VmResult<()> {
        self.call_with_buffer(GuestExport::LoadCallsResponse, buffer)
            .await?;
        Ok(())
    }

    /// Register method selectors
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn define_selectors(&mut self) -> VmResult<()> {
        self.dispatch(GuestExport::DefineSelectors, &[]).await?;
        Ok(())
    }

    // ---- gas accessors --------------------------------------------------

    /// Cumulative gas used by the instance
    ///
    /// # Errors
    ///
    /// Returns error if the reading fails
    pub async fn used_gas(&mut self) -> VmResult<u64> {
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        match engine.gas_used(id).await {
            Ok(gas) => Ok(gas),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }

    /// Overwrite the cumulative gas reading
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub async fn set_used_gas(&mut self, gas: u64) -> VmResult<()> {
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        match engine.set_gas_used(id, gas).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }

    /// Charge gas against the remaining budget
    ///
    /// # Errors
    ///
    /// Returns error if the budget is exhausted
    pub async fn use_gas(&mut self, amount: u64) -> VmResult<()> {
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        match engine.use_gas(id, amount).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }

    /// Gas remaining before the limit
    ///
    /// # Errors
    ///
    /// Returns error if the reading fails
    pub async fn remaining_gas(&mut self) -> VmResult<u64> {
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        match engine.remaining_gas(id).await {
            Ok(gas) => Ok(gas),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }

    /// Overwrite the remaining-gas budget
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub async fn set_remaining_gas(&mut self, gas: u64) -> VmResult<()> {
        let id = self.ensure_instantiated().await?;
        let engine = Arc::clone(&self.engine);
        match engine.set_remaining_gas(id, gas).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.gas.reset();
                Err(self.translate_failure(err).await)
            }
        }
    }
}
