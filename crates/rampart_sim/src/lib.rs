//! RAMPART Guest Simulator
//!
//! Deterministic in-memory stand-in for the native execution engine,
//! reproducing the guest memory layout, pin semantics, cumulative gas, and
//! abort reporting the bridge depends on. Used to exercise both bridge
//! shapes without real bytecode.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bindings;
pub mod engine;
pub mod harness;
pub mod heap;

pub use bindings::RecordingBindings;
pub use engine::{SimConfig, SimEngine};
pub use harness::{TestBench, TEST_BYTECODE};
pub use heap::GuestHeap;
