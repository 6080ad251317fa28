//! Engine abstraction for guest execution.
//!
//! The WASM execution engine is a native component outside this crate; the
//! bridge drives it through [`ContractEngine`] (plain calls) or
//! [`AsyncContractEngine`] (awaited calls, for remote or multi-threaded
//! engines). The guest export surface is the closed [`GuestExport`] set, so
//! no free-form string dispatch crosses this boundary.

use crate::bindings::StateBindings;
use async_trait::async_trait;
use rampart_core::{GuestPtr, InstanceId, NetworkTag};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Guest exports the bridge may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestExport {
    /// Allocate a guest object: `__new(size, class_id) -> ptr`
    New,
    /// Mark a block uncollectible: `__pin(ptr) -> ptr`
    Pin,
    /// Undo a pin: `__unpin(ptr) -> ptr`
    Unpin,
    /// Run a guest garbage-collection sweep: `__collect()`
    Collect,
    /// Execute a contract call with lowered calldata
    Execute,
    /// Install the execution environment buffer
    SetEnvironment,
    /// Run the deployment hook with lowered calldata
    OnDeploy,
    /// Invoke a write method
    ReadMethod,
    /// Invoke a view method
    ReadView,
    /// Fetch the view-method ABI blob
    GetViewAbi,
    /// Fetch events emitted by the last call
    GetEvents,
    /// Fetch the method ABI blob
    GetMethodAbi,
    /// Fetch the write-method selector list
    GetWriteMethods,
    /// Fetch storage slots modified by the last call
    GetModifiedStorage,
    /// Seed initial storage
    InitializeStorage,
    /// Load persisted storage into the guest
    LoadStorage,
    /// Feed responses for outstanding inter-contract calls
    LoadCallsResponse,
    /// Fetch outstanding inter-contract call requests
    GetCalls,
    /// Register method selectors
    DefineSelectors,
}

impl GuestExport {
    /// Export name as it appears in the guest module
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::New => "__new",
            Self::Pin => "__pin",
            Self::Unpin => "__unpin",
            Self::Collect => "__collect",
            Self::Execute => "execute",
            Self::SetEnvironment => "setEnvironment",
            Self::OnDeploy => "onDeploy",
            Self::ReadMethod => "readMethod",
            Self::ReadView => "readView",
            Self::GetViewAbi => "getViewABI",
            Self::GetEvents => "getEvents",
            Self::GetMethodAbi => "getMethodABI",
            Self::GetWriteMethods => "getWriteMethods",
            Self::GetModifiedStorage => "getModifiedStorage",
            Self::InitializeStorage => "initializeStorage",
            Self::LoadStorage => "loadStorage",
            Self::LoadCallsResponse => "loadCallsResponse",
            Self::GetCalls => "getCalls",
            Self::DefineSelectors => "defineSelectors",
        }
    }
}

impl std::fmt::Display for GuestExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Value passed to or returned from a guest export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportValue {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Unsigned 32-bit integer (pointers)
    U32(u32),
    /// Explicit "no value" placeholder for void-returning exports
    Unit,
}

impl ExportValue {
    /// Interpret this value as a guest pointer, if it is one
    #[must_use]
    pub fn as_ptr(&self) -> Option<GuestPtr> {
        match self {
            Self::U32(v) => Some(GuestPtr::from_raw(*v)),
            #[allow(clippy::cast_sign_loss)]
            Self::I32(v) => Some(GuestPtr::from_raw(*v as u32)),
            _ => None,
        }
    }

    /// Whether this is the void placeholder
    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }
}

/// Event emitted by the guest during one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event kind tag
    pub kind: String,
    /// Raw event payload
    pub data: Vec<u8>,
}

/// Result of one guest export invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Returned values; may contain [`ExportValue::Unit`] placeholders
    pub values: Vec<ExportValue>,
    /// Cumulative gas used by the instance after this call
    pub gas_used: u64,
    /// Events emitted during the call
    pub events: Vec<EventRecord>,
}

impl CallOutcome {
    /// Returned values with the void placeholders filtered out
    pub fn returned(&self) -> impl Iterator<Item = &ExportValue> {
        self.values.iter().filter(|v| !v.is_unit())
    }

    /// First real returned value interpreted as a guest pointer
    #[must_use]
    pub fn first_ptr(&self) -> Option<GuestPtr> {
        self.returned().next().and_then(ExportValue::as_ptr)
    }
}

/// Guest abort diagnostics, valid only immediately after an abort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortRecord {
    /// Pointer to the abort message string
    pub message_ptr: GuestPtr,
    /// Pointer to the guest source file name string
    pub file_ptr: GuestPtr,
    /// Guest source line
    pub line: u32,
    /// Guest source column
    pub column: u32,
}

/// Structured failure kinds reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The guest ran its abort handler; an [`AbortRecord`] is pending
    #[error("guest abort raised")]
    AbortSignal,

    /// The instance lock was held by another operation
    #[error("instance lock contention: {0}")]
    Contention(String),

    /// Metering exhausted - the contract ran out of gas
    #[error("out of gas")]
    OutOfGas,

    /// Memory read or write outside the instance's linear memory
    #[error("memory access out of bounds: offset {offset}, len {len}")]
    MemoryAccess {
        /// Requested byte offset
        offset: u64,
        /// Requested byte length
        len: u64,
    },

    /// Requested export not present in the guest module
    #[error("export not found: {0}")]
    ExportNotFound(String),

    /// Instance creation failed
    #[error("instantiation: {0}")]
    Instantiation(String),

    /// Operation against a destroyed instance
    #[error("instance destroyed: {0}")]
    Destroyed(InstanceId),

    /// Any other guest trap or engine failure
    #[error("runtime: {0}")]
    Runtime(String),
}

/// Synchronous engine driving guest instances.
///
/// One engine owns many instances; everything keyed by [`InstanceId`] -
/// linear memory, gas counters, the pending abort record - is exclusive to
/// that instance and never shared across instances.
pub trait ContractEngine: Send + Sync {
    /// Reserve a fresh instance identity
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot allocate an instance
    fn reserve_instance(&self) -> Result<InstanceId, EngineError>;

    /// Instantiate the guest module under a reserved identity
    ///
    /// # Errors
    ///
    /// Returns error if instantiation fails
    fn instantiate(
        &self,
        id: InstanceId,
        bytecode: &[u8],
        gas_limit: u64,
        network: NetworkTag,
    ) -> Result<(), EngineError>;

    /// Destroy an instance and reclaim its resources
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    fn destroy(&self, id: InstanceId) -> Result<(), EngineError>;

    /// Invoke a guest export
    ///
    /// # Errors
    ///
    /// Returns error if the call traps, aborts, or runs out of gas
    fn call(
        &self,
        id: InstanceId,
        export: GuestExport,
        args: &[ExportValue],
    ) -> Result<CallOutcome, EngineError>;

    /// Read a byte range from the instance's linear memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    fn read_memory(&self, id: InstanceId, offset: u64, len: u64) -> Result<Vec<u8>, EngineError>;

    /// Write bytes into the instance's linear memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    fn write_memory(&self, id: InstanceId, offset: u64, bytes: &[u8]) -> Result<(), EngineError>;

    /// Cumulative gas used by the instance
    ///
    /// # Errors
    ///
    /// Returns error if the reading is unavailable
    fn gas_used(&self, id: InstanceId) -> Result<u64, EngineError>;

    /// Overwrite the cumulative gas reading
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    fn set_gas_used(&self, id: InstanceId, gas: u64) -> Result<(), EngineError>;

    /// Charge gas against the remaining budget
    ///
    /// # Errors
    ///
    /// Returns error if the budget is exhausted
    fn use_gas(&self, id: InstanceId, amount: u64) -> Result<(), EngineError>;

    /// Gas remaining before the limit
    ///
    /// # Errors
    ///
    /// Returns error if the reading is unavailable
    fn remaining_gas(&self, id: InstanceId) -> Result<u64, EngineError>;

    /// Overwrite the remaining-gas budget
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    fn set_remaining_gas(&self, id: InstanceId, gas: u64) -> Result<(), EngineError>;

    /// Fetch the pending abort record after an [`EngineError::AbortSignal`]
    ///
    /// # Errors
    ///
    /// Returns error if no abort is pending
    fn abort_record(&self, id: InstanceId) -> Result<AbortRecord, EngineError>;

    /// Register the host-side callback bindings for an instance
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    fn register_bindings(
        &self,
        id: InstanceId,
        bindings: Arc<dyn StateBindings>,
    ) -> Result<(), EngineError>;

    /// Unregister the host-side callback bindings for an instance
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    fn unregister_bindings(&self, id: InstanceId) -> Result<(), EngineError>;
}

/// Asynchronous engine driving guest instances.
///
/// Mirrors [`ContractEngine`] with awaited operations for engines that are
/// themselves remote or multi-threaded. Suspension points interleave other
/// host work only; concurrent guest calls on one instance stay forbidden.
#[async_trait]
pub trait AsyncContractEngine: Send + Sync {
    /// Reserve a fresh instance identity
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot allocate an instance
    async fn reserve_instance(&self) -> Result<InstanceId, EngineError>;

    /// Instantiate the guest module under a reserved identity
    ///
    /// # Errors
    ///
    /// Returns error if instantiation fails
    async fn instantiate(
        &self,
        id: InstanceId,
        bytecode: &[u8],
        gas_limit: u64,
        network: NetworkTag,
    ) -> Result<(), EngineError>;

    /// Destroy an instance and reclaim its resources
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    async fn destroy(&self, id: InstanceId) -> Result<(), EngineError>;

    /// Invoke a guest export
    ///
    /// # Errors
    ///
    /// Returns error if the call traps, aborts, or runs out of gas
    async fn call(
        &self,
        id: InstanceId,
        export: GuestExport,
        args: &[ExportValue],
    ) -> Result<CallOutcome, EngineError>;

    /// Read a byte range from the instance's linear memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    async fn read_memory(
        &self,
        id: InstanceId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, EngineError>;

    /// Write bytes into the instance's linear memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    async fn write_memory(
        &self,
        id: InstanceId,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), EngineError>;

    /// Cumulative gas used by the instance
    ///
    /// # Errors
    ///
    /// Returns error if the reading is unavailable
    async fn gas_used(&self, id: InstanceId) -> Result<u64, EngineError>;

    /// Overwrite the cumulative gas reading
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    async fn set_gas_used(&self, id: InstanceId, gas: u64) -> Result<(), EngineError>;

    /// Charge gas against the remaining budget
    ///
    /// # Errors
    ///
    /// Returns error if the budget is exhausted
    async fn use_gas(&self, id: InstanceId, amount: u64) -> Result<(), EngineError>;

    /// Gas remaining before the limit
    ///
    /// # Errors
    ///
    /// Returns error if the reading is unavailable
    async fn remaining_gas(&self, id: InstanceId) -> Result<u64, EngineError>;

    /// Overwrite the remaining-gas budget
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    async fn set_remaining_gas(&self, id: InstanceId, gas: u64) -> Result<(), EngineError>;

    /// Fetch the pending abort record after an [`EngineError::AbortSignal`]
    ///
    /// # Errors
    ///
    /// Returns error if no abort is pending
    async fn abort_record(&self, id: InstanceId) -> Result<AbortRecord, EngineError>;

    /// Register the host-side callback bindings for an instance
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    async fn register_bindings(
        &self,
        id: InstanceId,
        bindings: Arc<dyn StateBindings>,
    ) -> Result<(), EngineError>;

    /// Unregister the host-side callback bindings for an instance
    ///
    /// # Errors
    ///
    /// Returns error if the instance is unknown
    async fn unregister_bindings(&self, id: InstanceId) -> Result<(), EngineError>;
}
