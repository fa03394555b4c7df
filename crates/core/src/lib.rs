//! Blocking control plane for dynamic instrumentation.
//!
//! Discover devices, spawn/attach/resume/kill processes, open sessions and
//! load scripts whose exports are callable over an RPC bridge. Every
//! blocking call runs on a background [`Context`](telco_runtime::Context)
//! and can be cancelled from another thread through a [`Cancellable`].
//!
//! ```ignore
//! use telco::{DeviceManager, ScriptOptions, SessionOptions, Timeout};
//!
//! let manager = DeviceManager::start()?;
//! let device = manager.get_device("local", Timeout::NoWait)?;
//! let session = device.attach("Twitter", SessionOptions::default())?;
//! let script = session.create_script(SOURCE, ScriptOptions::default())?;
//! script.load()?;
//! let threads = script.exports_sync()?.call("list_threads", vec![])?;
//! ```
//!
//! Handlers registered with `on(name, ...)` run on a dedicated delivery
//! thread, never on the caller's thread or the connection task.

pub mod device;
pub mod events;
pub mod exports;
pub mod host;
pub mod manager;
pub mod options;
pub mod script;
pub mod session;

mod shared;

pub use device::Device;
pub use events::{DeviceEvent, ManagerEvent, ScriptEvent, SessionEvent};
pub use exports::{ExportTable, Exports, ExportsSync};
pub use manager::DeviceManager;
pub use options::ManagerOptions;
pub use script::{Script, ScriptState};
pub use session::Session;
pub use telco_protocol::{
	ApplicationInfo, Crash, DetachReason, DeviceInfo, DeviceKind, ExportSignature, LogLevel,
	ProcessInfo, ProcessTarget, Realm, RpcValue, ScriptMessage, ScriptOptions, SessionOptions,
	SpawnOptions, Stdio,
};
pub use telco_runtime::{Backend, Cancellable, Error, ErrorKind, HandlerId, Result, Timeout};
