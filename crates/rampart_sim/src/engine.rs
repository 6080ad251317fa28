//! Deterministic engine double.
//!
//! [`SimEngine`] implements both bridge engine traits against an in-memory
//! guest: a bump-allocated heap with the real layout conventions, a pin
//! set, a cumulative gas counter, and just enough export semantics to
//! exercise every bridge path. Buffer-consuming exports echo their payload
//! back through a freshly allocated array, so round-trips observe real
//! allocation, pinning, and header traffic.
//!
//! Failure injection: one export can be configured to trip the guest abort
//! path (storing a properly laid out abort record before failing with the
//! abort signal), and gas reads can be made to report lock contention for
//! the disposal reentrancy path.

use crate::heap::GuestHeap;
use async_trait::async_trait;
use rampart_core::{GuestPtr, InstanceId, NetworkTag};
use rampart_wasm::bindings::StateBindings;
use rampart_wasm::codec;
use rampart_wasm::engine::{
    AbortRecord, AsyncContractEngine, CallOutcome, ContractEngine, EngineError, ExportValue,
    GuestExport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Gas charged for every export invocation
    pub base_call_cost: u64,
    /// Gas charged per allocated byte
    pub alloc_byte_cost: u64,
    /// Export that trips the guest abort path, if any
    pub abort_on: Option<GuestExport>,
    /// Abort message stored in guest memory when tripped
    pub abort_message: String,
    /// Abort file name stored in guest memory when tripped
    pub abort_file: String,
    /// Abort source line
    pub abort_line: u32,
    /// Abort source column
    pub abort_column: u32,
}

impl SimConfig {
    /// Create a config with default costs and no failure injection
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_call_cost: 250,
            alloc_byte_cost: 1,
            abort_on: None,
            abort_message: "aborted".to_string(),
            abort_file: "module.ts".to_string(),
            abort_line: 1,
            abort_column: 1,
        }
    }

    /// Set the per-call gas cost
    #[must_use]
    pub fn with_base_call_cost(mut self, cost: u64) -> Self {
        self.base_call_cost = cost;
        self
    }

    /// Arm abort injection on one export with the given diagnostics
    #[must_use]
    pub fn with_abort(
        mut self,
        export: GuestExport,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
    ) -> Self {
        self.abort_on = Some(export);
        self.abort_message = message.to_string();
        self.abort_file = file.to_string();
        self.abort_line = line;
        self.abort_column = column;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct SimInstance {
    heap: GuestHeap,
    gas_used: u64,
    gas_remaining: u64,
    instantiated: bool,
    destroyed: bool,
    collected: bool,
    bindings: Option<Arc<dyn StateBindings>>,
    abort: Option<AbortRecord>,
    environment: Option<Vec<u8>>,
}

impl SimInstance {
    fn new() -> Self {
        Self {
            heap: GuestHeap::new(),
            gas_used: 0,
            gas_remaining: 0,
            instantiated: false,
            destroyed: false,
            collected: false,
            bindings: None,
            abort: None,
            environment: None,
        }
    }

    /// Charge gas, keeping the cumulative counter monotonic even when the
    /// budget runs out
    fn charge(&mut self, amount: u64) -> Result<(), EngineError> {
        if amount > self.gas_remaining {
            self.gas_used += self.gas_remaining;
            self.gas_remaining = 0;
            return Err(EngineError::OutOfGas);
        }
        self.gas_used += amount;
        self.gas_remaining -= amount;
        Ok(())
    }

    fn read_array(&self, header: GuestPtr) -> Result<Vec<u8>, EngineError> {
        if header.is_null() {
            return Ok(Vec::new());
        }
        let view = self.heap.read(u64::from(header.as_raw()) + 4, 8)?;
        let (data_ptr, byte_len) =
            codec::decode_array_view(&view).map_err(|e| EngineError::Runtime(e.to_string()))?;
        self.heap
            .read(u64::from(data_ptr.as_raw()), u64::from(byte_len))
    }

    fn alloc_array(&mut self, payload: &[u8]) -> Result<u32, EngineError> {
        let byte_len = u32::try_from(payload.len())
            .map_err(|_| EngineError::Runtime("payload exceeds guest address space".to_string()))?;
        let data = self.heap.alloc(byte_len)?;
        self.heap.write(u64::from(data), payload)?;
        let header = self.heap.alloc(codec::ARRAY_HEADER_BYTES)?;
        self.heap.write(
            u64::from(header),
            &codec::encode_array_header(GuestPtr::from_raw(data), byte_len),
        )?;
        Ok(header)
    }

    fn alloc_string(&mut self, s: &str) -> Result<u32, EngineError> {
        let payload = codec::encode_utf16_le(s);
        let byte_len = u32::try_from(payload.len())
            .map_err(|_| EngineError::Runtime("string exceeds guest address space".to_string()))?;
        let ptr = self.heap.alloc(byte_len)?;
        self.heap.write(u64::from(ptr), &payload)?;
        Ok(ptr)
    }
}

struct SimInner {
    next_id: u64,
    instances: HashMap<InstanceId, SimInstance>,
}

/// Deterministic in-memory engine
pub struct SimEngine {
    config: SimConfig,
    inner: Mutex<SimInner>,
    contended: AtomicBool,
}

impl SimEngine {
    /// Create an engine with the given configuration
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SimInner {
                next_id: 0,
                instances: HashMap::new(),
            }),
            contended: AtomicBool::new(false),
        }
    }

    /// Create an engine with the default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::new(SimConfig::default())
    }

    /// Make gas reads report lock contention (disposal reentrancy path)
    pub fn set_contended(&self, contended: bool) {
        self.contended.store(contended, Ordering::SeqCst);
    }

    /// Pins currently held by an instance; 0 for unknown instances
    #[must_use]
    pub fn pin_count(&self, id: InstanceId) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .instances
                    .get(&id)
                    .map_or(0, |inst| inst.heap.pin_count())
            })
            .unwrap_or(0)
    }

    /// Whether bindings are currently registered for an instance
    #[must_use]
    pub fn bindings_registered(&self, id: InstanceId) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .instances
                    .get(&id)
                    .is_some_and(|inst| inst.bindings.is_some())
            })
            .unwrap_or(false)
    }

    /// Whether an instance has been destroyed
    #[must_use]
    pub fn is_destroyed(&self, id: InstanceId) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .instances
                    .get(&id)
                    .is_some_and(|inst| inst.destroyed)
            })
            .unwrap_or(false)
    }

    /// Environment buffer installed by `setEnvironment`, if any
    #[must_use]
    pub fn environment(&self, id: InstanceId) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.instances.get(&id).and_then(|i| i.environment.clone()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimInner>, EngineError> {
        // poisoning counts as contention: a writer died mid-operation
        self.inner
            .lock()
            .map_err(|_| EngineError::Contention("simulator state lock poisoned".to_string()))
    }

    fn trip_abort(inst: &mut SimInstance, config: &SimConfig) -> EngineError {
        let record = (|| -> Result<AbortRecord, EngineError> {
            let message_ptr = inst.alloc_string(&config.abort_message)?;
            let file_ptr = inst.alloc_string(&config.abort_file)?;
            Ok(AbortRecord {
                message_ptr: GuestPtr::from_raw(message_ptr),
                file_ptr: GuestPtr::from_raw(file_ptr),
                line: config.abort_line,
                column: config.abort_column,
            })
        })();
        match record {
            Ok(record) => {
                inst.abort = Some(record);
                EngineError::AbortSignal
            }
            Err(err) => err,
        }
    }

    fn call_inner(
        &self,
        id: InstanceId,
        export: GuestExport,
        args: &[ExportValue],
    ) -> Result<CallOutcome, EngineError> {
        let mut inner = self.lock()?;
        let inst = instance_mut(&mut inner, id)?;
        if !inst.instantiated {
            return Err(EngineError::Runtime(format!(
                "{} called before instantiation",
                export.wire_name()
            )));
        }
        if self.config.abort_on == Some(export) {
            inst.charge(self.config.base_call_cost)?;
            return Err(Self::trip_abort(inst, &self.config));
        }
        inst.charge(self.config.base_call_cost)?;
        let values = match export {
            GuestExport::New => {
                let size = arg_u32(args, 0)?;
                inst.charge(u64::from(size) * self.config.alloc_byte_cost)?;
                let ptr = inst.heap.alloc(size)?;
                vec![ExportValue::U32(ptr)]
            }
            GuestExport::Pin => {
                let ptr = arg_ptr(args)?;
                inst.heap.pin(ptr.as_raw());
                vec![ExportValue::U32(ptr.as_raw())]
            }
            GuestExport::Unpin => {
                let ptr = arg_ptr(args)?;
                if !inst.heap.unpin(ptr.as_raw()) {
                    return Err(EngineError::Runtime(format!(
                        "__unpin of pointer {ptr} that is not pinned"
                    )));
                }
                vec![ExportValue::U32(ptr.as_raw())]
            }
            GuestExport::Collect => {
                inst.collected = true;
                vec![ExportValue::Unit]
            }
            GuestExport::Execute
            | GuestExport::OnDeploy
            | GuestExport::ReadMethod
            | GuestExport::ReadView => {
                let calldata = inst.read_array(arg_ptr(args)?)?;
                inst.charge(calldata.len() as u64)?;
                if let Some(bindings) = &inst.bindings {
                    bindings.log(&format!(
                        "{} with {} bytes",
                        export.wire_name(),
                        calldata.len()
                    ));
                }
                let header = inst.alloc_array(&calldata)?;
                vec![ExportValue::U32(header)]
            }
            GuestExport::SetEnvironment => {
                let env = inst.read_array(arg_ptr(args)?)?;
                inst.environment = Some(env);
                vec![ExportValue::Unit]
            }
            GuestExport::LoadStorage => {
                if !inst.collected {
                    return Err(EngineError::Runtime(
                        "loadStorage requires a prior __collect".to_string(),
                    ));
                }
                inst.read_array(arg_ptr(args)?)?;
                vec![ExportValue::Unit]
            }
            GuestExport::InitializeStorage | GuestExport::LoadCallsResponse => {
                inst.read_array(arg_ptr(args)?)?;
                vec![ExportValue::Unit]
            }
            GuestExport::DefineSelectors => vec![ExportValue::Unit],
            GuestExport::GetViewAbi
            | GuestExport::GetEvents
            | GuestExport::GetMethodAbi
            | GuestExport::GetWriteMethods
            | GuestExport::GetModifiedStorage
            | GuestExport::GetCalls => {
                let header = inst.alloc_array(&[])?;
                vec![ExportValue::U32(header)]
            }
        };
        Ok(CallOutcome {
            values,
            gas_used: inst.gas_used,
            events: Vec::new(),
        })
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::default_config()
    }
}

fn instance_mut(
    inner: &mut SimInner,
    id: InstanceId,
) -> Result<&mut SimInstance, EngineError> {
    let inst = inner
        .instances
        .get_mut(&id)
        .ok_or_else(|| EngineError::Runtime(format!("unknown instance {id}")))?;
    if inst.destroyed {
        return Err(EngineError::Destroyed(id));
    }
    Ok(inst)
}

fn arg_ptr(args: &[ExportValue]) -> Result<GuestPtr, EngineError> {
    args.first()
        .and_then(ExportValue::as_ptr)
        .ok_or_else(|| EngineError::Runtime("missing pointer argument".to_string()))
}

fn arg_u32(args: &[ExportValue], at: usize) -> Result<u32, EngineError> {
    match args.get(at) {
        Some(ExportValue::U32(v)) => Ok(*v),
        _ => Err(EngineError::Runtime(format!(
            "missing u32 argument at position {at}"
        ))),
    }
}

impl ContractEngine for SimEngine {
    fn reserve_instance(&self) -> Result<InstanceId, EngineError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = InstanceId::from_raw(inner.next_id);
        inner.instances.insert(id, SimInstance::new());
        Ok(id)
    }

    fn instantiate(
        &self,
        id: InstanceId,
        bytecode: &[u8],
        gas_limit: u64,
        network: NetworkTag,
    ) -> Result<(), EngineError> {
        if bytecode.len() < 8 || bytecode[0..4] != WASM_MAGIC {
            return Err(EngineError::Instantiation(
                "bytecode is missing the wasm magic".to_string(),
            ));
        }
        let mut inner = self.lock()?;
        let inst = instance_mut(&mut inner, id)?;
        inst.instantiated = true;
        inst.gas_remaining = gas_limit;
        tracing::debug!(instance = %id, network = %network, gas_limit, "sim instance up");
        Ok(())
    }

    fn destroy(&self, id: InstanceId) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let inst = instance_mut(&mut inner, id)?;
        inst.destroyed = true;
        inst.bindings = None;
        tracing::debug!(instance = %id, "sim instance destroyed");
        Ok(())
    }

    fn call(
        &self,
        id: InstanceId,
        export: GuestExport,
        args: &[ExportValue],
    ) -> Result<CallOutcome, EngineError> {
        self.call_inner(id, export, args)
    }

    fn read_memory(&self, id: InstanceId, offset: u64, len: u64) -> Result<Vec<u8>, EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.heap.read(offset, len)
    }

    fn write_memory(&self, id: InstanceId, offset: u64, bytes: &[u8]) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.heap.write(offset, bytes)
    }

    fn gas_used(&self, id: InstanceId) -> Result<u64, EngineError> {
        if self.contended.load(Ordering::SeqCst) {
            return Err(EngineError::Contention(
                "instance mutex held by an in-flight operation".to_string(),
            ));
        }
        let mut inner = self.lock()?;
        Ok(instance_mut(&mut inner, id)?.gas_used)
    }

    fn set_gas_used(&self, id: InstanceId, gas: u64) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.gas_used = gas;
        Ok(())
    }

    fn use_gas(&self, id: InstanceId, amount: u64) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.charge(amount)
    }

    fn remaining_gas(&self, id: InstanceId) -> Result<u64, EngineError> {
        let mut inner = self.lock()?;
        Ok(instance_mut(&mut inner, id)?.gas_remaining)
    }

    fn set_remaining_gas(&self, id: InstanceId, gas: u64) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.gas_remaining = gas;
        Ok(())
    }

    fn abort_record(&self, id: InstanceId) -> Result<AbortRecord, EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?
            .abort
            .take()
            .ok_or_else(|| EngineError::Runtime("no abort record pending".to_string()))
    }

    fn register_bindings(
        &self,
        id: InstanceId,
        bindings: Arc<dyn StateBindings>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.bindings = Some(bindings);
        Ok(())
    }

    fn unregister_bindings(&self, id: InstanceId) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        instance_mut(&mut inner, id)?.bindings = None;
        Ok(())
    }
}

#[async_trait]
impl AsyncContractEngine for SimEngine {
    async fn reserve_instance(&self) -> Result<InstanceId, EngineError> {
        ContractEngine::reserve_instance(self)
    }

    async fn instantiate(
        &self,
        id: InstanceId,
        bytecode: &[u8],
        gas_limit: u64,
        network: NetworkTag,
    ) -> Result<(), EngineError> {
        ContractEngine::instantiate(self, id, bytecode, gas_limit, network)
    }

    async fn destroy(&self, id: InstanceId) -> Result<(), EngineError> {
        ContractEngine::destroy(self, id)
    }

    async fn call(
        &self,
        id: InstanceId,
        export: GuestExport,
        args: &[ExportValue],
    ) -> Result<CallOutcome, EngineError> {
        ContractEngine::call(self, id, export, args)
    }

    async fn read_memory(
        &self,
        id: InstanceId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, EngineError> {
        ContractEngine::read_memory(self, id, offset, len)
    }

    async fn write_memory(
        &self,
        id: InstanceId,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        ContractEngine::write_memory(self, id, offset, bytes)
    }

    async fn gas_used(&self, id: InstanceId) -> Result<u64, EngineError> {
        ContractEngine::gas_used(self, id)
    }

    async fn set_gas_used(&self, id: InstanceId, gas: u64) -> Result<(), EngineError> {
        ContractEngine::set_gas_used(self, id, gas)
    }

    async fn use_gas(&self, id: InstanceId, amount: u64) -> Result<(), EngineError> {
        ContractEngine::use_gas(self, id, amount)
    }

    async fn remaining_gas(&self, id: InstanceId) -> Result<u64, EngineError> {
        ContractEngine::remaining_gas(self, id)
    }

    async fn set_remaining_gas(&self, id: InstanceId, gas: u64) -> Result<(), EngineError> {
        ContractEngine::set_remaining_gas(self, id, gas)
    }

    async fn abort_record(&self, id: InstanceId) -> Result<AbortRecord, EngineError> {
        ContractEngine::abort_record(self, id)
    }

    async fn register_bindings(
        &self,
        id: InstanceId,
        bindings: Arc<dyn StateBindings>,
    ) -> Result<(), EngineError> {
        ContractEngine::register_bindings(self, id, bindings)
    }

    async fn unregister_bindings(&self, id: InstanceId) -> Result<(), EngineError> {
        ContractEngine::unregister_bindings(self, id)
    }
}
