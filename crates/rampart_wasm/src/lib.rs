//! RAMPART WASM Contract Bridge
//!
//! Host-side bridge for driving sandboxed, gas-metered WASM contract
//! modules: marshalling across the host/guest linear-memory boundary,
//! pin/unpin reference tracking, per-call gas deltas, and structured
//! translation of guest aborts. The bridge exists in a synchronous and an
//! asynchronous shape sharing one design; the execution engine itself sits
//! behind the [`engine`] traits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abort;
pub mod bindings;
pub mod codec;
pub mod engine;
pub mod error;
pub mod gas;
pub mod handle;
pub mod handle_async;
pub mod memory;
pub mod refcount;

pub use bindings::{BindingError, NullBindings, StateBindings};
pub use engine::{
    AbortRecord, AsyncContractEngine, CallOutcome, ContractEngine, EngineError, EventRecord,
    ExportValue, GuestExport,
};
pub use error::{VmError, VmResult};
pub use gas::{GasTracker, MeterFn};
pub use handle::{ContractHandle, ContractParams, LifecycleState};
pub use handle_async::AsyncContractHandle;
pub use refcount::RefTable;
