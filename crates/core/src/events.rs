//! Event enums for every observable entity.
//!
//! Handlers are registered by name with `on(name, handler)`; the name of each
//! variant is what [`EventKind::name`] returns.

use telco_protocol::{Crash, DetachReason, ScriptMessage};
use telco_runtime::EventKind;

use crate::device::Device;

/// Emitted by a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone)]
pub enum ManagerEvent {
	/// `"added"`: a device was discovered
	Added(Device),
	/// `"removed"`: a device disconnected and is now lost
	Removed(Device),
	/// `"changed"`: the device set changed (after every add or remove)
	Changed,
}

impl EventKind for ManagerEvent {
	const NAMES: &'static [&'static str] = &["added", "removed", "changed"];

	fn name(&self) -> &'static str {
		match self {
			ManagerEvent::Added(_) => "added",
			ManagerEvent::Removed(_) => "removed",
			ManagerEvent::Changed => "changed",
		}
	}
}

/// Emitted by a [`Device`].
#[derive(Debug, Clone)]
pub enum DeviceEvent {
	/// `"process-crashed"`: a process on the device crashed
	ProcessCrashed(Crash),
	/// `"lost"`: the device disconnected
	Lost,
}

impl EventKind for DeviceEvent {
	const NAMES: &'static [&'static str] = &["process-crashed", "lost"];

	fn name(&self) -> &'static str {
		match self {
			DeviceEvent::ProcessCrashed(_) => "process-crashed",
			DeviceEvent::Lost => "lost",
		}
	}
}

/// Emitted by a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub enum SessionEvent {
	/// `"detached"`: emitted exactly once per session
	Detached {
		reason: DetachReason,
		crash: Option<Crash>,
	},
}

impl EventKind for SessionEvent {
	const NAMES: &'static [&'static str] = &["detached"];

	fn name(&self) -> &'static str {
		match self {
			SessionEvent::Detached { .. } => "detached",
		}
	}
}

/// Emitted by a [`Script`](crate::Script).
#[derive(Debug, Clone)]
pub enum ScriptEvent {
	/// `"message"`: a message from the script that is not an RPC reply
	Message {
		message: ScriptMessage,
		data: Option<Vec<u8>>,
	},
	/// `"destroyed"`: the script was unloaded
	Destroyed,
}

impl EventKind for ScriptEvent {
	const NAMES: &'static [&'static str] = &["message", "destroyed"];

	fn name(&self) -> &'static str {
		match self {
			ScriptEvent::Message { .. } => "message",
			ScriptEvent::Destroyed => "destroyed",
		}
	}
}
