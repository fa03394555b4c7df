//! Wire types for the telco control protocol.
//!
//! This crate contains the serde-serializable types exchanged between the
//! client object model and an instrumentation backend. These types represent
//! the "protocol layer": device and process descriptors, lifecycle options,
//! detach reasons, crash reports, and the value model carried by the RPC
//! bridge.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **Backend-neutral**: Any backend speaking the message envelope can use them
//! - **Stable**: Changes only when the control protocol changes
//!
//! Higher-level blocking APIs are built on top of these types in `telco`.

pub mod options;
pub mod rpc;
pub mod types;
pub mod value;

pub use options::*;
pub use rpc::*;
pub use types::*;
pub use value::*;
