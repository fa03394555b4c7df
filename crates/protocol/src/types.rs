//! Core protocol types used across the wire.
//!
//! These types describe devices, processes, crash reports and the reasons a
//! session can end. They are shared verbatim by the client and the backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of execution environment a device represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
	/// The host the client runs on (always present)
	Local,
	/// A device reachable over a network address
	Remote,
	/// A device connected over USB
	Usb,
}

impl DeviceKind {
	/// Returns the protocol name of this kind.
	pub fn as_str(&self) -> &'static str {
		match self {
			DeviceKind::Local => "local",
			DeviceKind::Remote => "remote",
			DeviceKind::Usb => "usb",
		}
	}
}

impl fmt::Display for DeviceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DeviceKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"local" => Ok(DeviceKind::Local),
			"remote" => Ok(DeviceKind::Remote),
			"usb" => Ok(DeviceKind::Usb),
			other => Err(format!("unknown device type '{other}'")),
		}
	}
}

/// Immutable identity of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
	/// Unique identifier (stable only if the backend guarantees it)
	pub id: String,
	/// Human-readable name
	pub name: String,
	/// Device kind
	#[serde(rename = "type")]
	pub kind: DeviceKind,
}

impl DeviceInfo {
	/// Creates a new device descriptor.
	pub fn new(id: impl Into<String>, name: impl Into<String>, kind: DeviceKind) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			kind,
		}
	}
}

/// A process running on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
	/// Process ID
	pub pid: u32,
	/// Human-readable process name
	pub name: String,
}

/// An installed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
	/// Bundle or package identifier
	pub identifier: String,
	pub name: String,
	/// Pid of the running instance
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pid: Option<u32>,
}

impl ApplicationInfo {
	pub fn is_running(&self) -> bool {
		self.pid.is_some()
	}
}

/// A process that was spawned and is waiting to be resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnInfo {
	/// Process ID
	pub pid: u32,
	/// Program or application identifier the process was spawned from
	pub identifier: String,
}

/// Crash report produced when the backend detects an abnormal process exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crash {
	/// Process ID
	pub pid: u32,
	/// Process name
	pub process_name: String,
	/// Human-readable one-line summary
	pub summary: String,
	/// Human-readable full report
	pub report: String,
	/// Backend-specific parameters
	#[serde(default)]
	pub parameters: BTreeMap<String, Value>,
}

impl fmt::Display for Crash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"Crash(pid={}, process_name=\"{}\", summary=\"{}\", report=<{} bytes>)",
			self.pid,
			self.process_name,
			self.summary,
			self.report.len()
		)
	}
}

/// Reason a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetachReason {
	/// The client called `detach()`
	ApplicationRequested,
	/// The process image was replaced (e.g. exec)
	ProcessReplaced,
	/// The process exited or crashed
	ProcessTerminated,
	/// The control connection to the backend went away
	ConnectionTerminated,
	/// The device hosting the process disconnected
	DeviceLost,
}

impl DetachReason {
	/// Returns the protocol name of this reason.
	pub fn as_str(&self) -> &'static str {
		match self {
			DetachReason::ApplicationRequested => "application-requested",
			DetachReason::ProcessReplaced => "process-replaced",
			DetachReason::ProcessTerminated => "process-terminated",
			DetachReason::ConnectionTerminated => "connection-terminated",
			DetachReason::DeviceLost => "device-lost",
		}
	}

	/// Returns true if this reason can carry a crash report.
	pub fn is_abnormal_exit(&self) -> bool {
		matches!(self, DetachReason::ProcessTerminated)
	}
}

impl fmt::Display for DetachReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// How a spawned process' standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stdio {
	/// Inherit the backend's streams
	#[default]
	Inherit,
	/// Pipe streams through the control channel (see `Device::input`)
	Pipe,
}

/// Realm a session attaches in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
	/// The process' native realm
	#[default]
	Native,
	/// An emulated realm (e.g. a translated ABI)
	Emulated,
}

/// Addresses a process either by PID or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessTarget {
	/// Numeric process ID
	Pid(u32),
	/// Process name, resolved against the device's process list
	Name(String),
}

impl From<u32> for ProcessTarget {
	fn from(pid: u32) -> Self {
		ProcessTarget::Pid(pid)
	}
}

impl From<&str> for ProcessTarget {
	fn from(name: &str) -> Self {
		ProcessTarget::Name(name.to_string())
	}
}

impl From<String> for ProcessTarget {
	fn from(name: String) -> Self {
		ProcessTarget::Name(name)
	}
}

impl fmt::Display for ProcessTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProcessTarget::Pid(pid) => write!(f, "{pid}"),
			ProcessTarget::Name(name) => write!(f, "'{name}'"),
		}
	}
}

/// Closed set of error conditions a control operation can fail with.
///
/// Serialized as a kebab-case code so backend failures keep their kind when
/// they cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
	ServerNotRunning,
	ExecutableNotFound,
	ExecutableNotSupported,
	ProcessNotFound,
	ProcessNotResponding,
	InvalidArgument,
	InvalidOperation,
	PermissionDenied,
	AddressInUse,
	TimedOut,
	NotSupported,
	Protocol,
	Transport,
	Cancelled,
	/// An exported function raised an error inside the script
	Rpc,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn device_info_uses_type_key() {
		let info = DeviceInfo::new("local", "Local System", DeviceKind::Local);
		let json = serde_json::to_value(&info).unwrap();
		assert_eq!(json["type"], "local");
		assert_eq!(json["name"], "Local System");
	}

	#[test]
	fn stopped_applications_omit_pid() {
		let app = ApplicationInfo {
			identifier: "com.example.mail".to_string(),
			name: "Mail".to_string(),
			pid: None,
		};
		let json = serde_json::to_value(&app).unwrap();
		assert_eq!(json, serde_json::json!({"identifier": "com.example.mail", "name": "Mail"}));
		let back: ApplicationInfo = serde_json::from_value(json).unwrap();
		assert!(!back.is_running());
	}

	#[test]
	fn detach_reason_wire_names() {
		let json = serde_json::to_value(DetachReason::ProcessTerminated).unwrap();
		assert_eq!(json, "process-terminated");
		assert_eq!(DetachReason::DeviceLost.to_string(), "device-lost");
		assert!(DetachReason::ProcessTerminated.is_abnormal_exit());
		assert!(!DetachReason::ApplicationRequested.is_abnormal_exit());
	}

	#[test]
	fn error_kind_codes() {
		let json = serde_json::to_value(ErrorKind::ProcessNotFound).unwrap();
		assert_eq!(json, "process-not-found");
		let kind: ErrorKind = serde_json::from_value(serde_json::json!("timed-out")).unwrap();
		assert_eq!(kind, ErrorKind::TimedOut);
	}

	#[test]
	fn device_kind_parses() {
		assert_eq!("usb".parse::<DeviceKind>().unwrap(), DeviceKind::Usb);
		assert!("lol".parse::<DeviceKind>().is_err());
	}

	#[test]
	fn crash_display_omits_report_body() {
		let crash = Crash {
			pid: 42,
			process_name: "Hello".to_string(),
			summary: "SIGSEGV".to_string(),
			report: "a very long report".to_string(),
			parameters: BTreeMap::new(),
		};
		let text = crash.to_string();
		assert!(text.contains("pid=42"));
		assert!(text.contains("<18 bytes>"));
	}
}
