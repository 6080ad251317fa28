//! RAMPART Core Types
//!
//! This crate contains pure types shared across the bridge with no I/O.
//! All types are serializable with stable, cross-platform encoding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod id;
pub mod network;
pub mod ptr;

// Re-exports
pub use id::InstanceId;
pub use network::NetworkTag;
pub use ptr::GuestPtr;
