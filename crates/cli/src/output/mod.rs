//! Result envelope printed by every command.
//!
//! With `-f json` each command prints one envelope on stdout:
//!
//! ```json
//! {
//!   "schemaVersion": 1,
//!   "ok": true,
//!   "command": "ps",
//!   "data": { ... },
//!   "timings": { "durationMs": 12 }
//! }
//! ```
//!
//! On failure `data` is replaced by
//! `"error": { "code": "PROCESS_NOT_FOUND", "message": "..." }`.
//! Text output prints the data for humans and errors on stderr.


use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use telco::{ApplicationInfo, DeviceInfo, ErrorKind, ProcessInfo};

/// Current schema version for command output.
pub const SCHEMA_VERSION: u32 = 1;

/// Output format for CLI results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text
	#[default]
	Text,
	/// JSON envelope
	Json,
}

impl std::str::FromStr for OutputFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"text" => Ok(OutputFormat::Text),
			"json" => Ok(OutputFormat::Json),
			_ => Err(format!("unknown format: {s}")),
		}
	}
}

impl fmt::Display for OutputFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OutputFormat::Text => write!(f, "text"),
			OutputFormat::Json => write!(f, "json"),
		}
	}
}

/// The result envelope returned by all commands.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T: Serialize> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub schema_version: Option<u32>,

	pub ok: bool,

	/// Command name ("devices", "ps", "spawn", ...)
	pub command: String,

	/// Device the command ran against
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device: Option<String>,

	/// Only present on success
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,

	/// Only present on failure
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub timings: Option<Timings>,
}

/// Error information for failed commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,
	pub message: String,
}

/// Standardized error codes for programmatic handling.
///
/// Library failures map one-to-one from [`ErrorKind`]; the rest are the
/// CLI's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	ServerNotRunning,
	ExecutableNotFound,
	ExecutableNotSupported,
	ProcessNotFound,
	ProcessNotResponding,
	InvalidArgument,
	InvalidOperation,
	PermissionDenied,
	AddressInUse,
	Timeout,
	NotSupported,
	ProtocolError,
	TransportError,
	Cancelled,
	ScriptError,
	/// Bad command-line input or fixture
	InvalidInput,
	IoError,
	InternalError,
}

impl From<ErrorKind> for ErrorCode {
	fn from(kind: ErrorKind) -> Self {
		match kind {
			ErrorKind::ServerNotRunning => ErrorCode::ServerNotRunning,
			ErrorKind::ExecutableNotFound => ErrorCode::ExecutableNotFound,
			ErrorKind::ExecutableNotSupported => ErrorCode::ExecutableNotSupported,
			ErrorKind::ProcessNotFound => ErrorCode::ProcessNotFound,
			ErrorKind::ProcessNotResponding => ErrorCode::ProcessNotResponding,
			ErrorKind::InvalidArgument => ErrorCode::InvalidArgument,
			ErrorKind::InvalidOperation => ErrorCode::InvalidOperation,
			ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
			ErrorKind::AddressInUse => ErrorCode::AddressInUse,
			ErrorKind::TimedOut => ErrorCode::Timeout,
			ErrorKind::NotSupported => ErrorCode::NotSupported,
			ErrorKind::Protocol => ErrorCode::ProtocolError,
			ErrorKind::Transport => ErrorCode::TransportError,
			ErrorKind::Cancelled => ErrorCode::Cancelled,
			ErrorKind::Rpc => ErrorCode::ScriptError,
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// same spelling as the serialized form
		let json = serde_json::to_value(self).map_err(|_| fmt::Error)?;
		f.write_str(json.as_str().unwrap_or("INTERNAL_ERROR"))
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
	pub duration_ms: u64,
}

impl From<Duration> for Timings {
	fn from(duration: Duration) -> Self {
		Timings {
			duration_ms: duration.as_millis() as u64,
		}
	}
}

/// Builder for constructing command results
pub struct ResultBuilder<T: Serialize> {
	command: String,
	device: Option<String>,
	data: Option<T>,
	error: Option<CommandError>,
	start_time: Instant,
}

impl<T: Serialize> ResultBuilder<T> {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			device: None,
			data: None,
			error: None,
			start_time: Instant::now(),
		}
	}

	pub fn device(mut self, id: impl Into<String>) -> Self {
		self.device = Some(id.into());
		self
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	pub fn error(mut self, code: ErrorCode, message: impl Into<String>) -> Self {
		self.error = Some(CommandError {
			code,
			message: message.into(),
		});
		self
	}

	pub fn build(self) -> CommandResult<T> {
		CommandResult {
			schema_version: Some(SCHEMA_VERSION),
			ok: self.error.is_none() && self.data.is_some(),
			command: self.command,
			device: self.device,
			data: self.data,
			error: self.error,
			timings: Some(Timings::from(self.start_time.elapsed())),
		}
	}
}

/// Data that knows how to print itself for humans.
pub trait Render {
	fn render(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Print a command result to stdout in the specified format
pub fn print_result<T: Serialize + Render>(result: &CommandResult<T>, format: OutputFormat) {
	match format {
		OutputFormat::Json => {
			if let Ok(json) = serde_json::to_string_pretty(result) {
				println!("{json}");
			}
		}
		OutputFormat::Text => {
			let mut stdout = io::stdout().lock();
			if let Some(data) = &result.data {
				if let Err(e) = data.render(&mut stdout) {
					tracing::debug!(error = %e, "stdout closed");
				}
			}
		}
	}
}

/// Print an error to stderr in human-readable format
pub fn print_error_stderr(error: &CommandError) {
	eprintln!("Error [{}]: {}", error.code, error.message);
}

impl Render for () {
	fn render(&self, _out: &mut dyn Write) -> io::Result<()> {
		Ok(())
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DevicesData {
	pub devices: Vec<DeviceInfo>,
}

impl Render for DevicesData {
	fn render(&self, out: &mut dyn Write) -> io::Result<()> {
		let width = self.devices.iter().map(|d| d.id.len()).max().unwrap_or(0).max(2);
		writeln!(out, "{:<width$}  {:<6}  Name", "Id", "Type")?;
		for device in &self.devices {
			writeln!(out, "{:<width$}  {:<6}  {}", device.id, device.kind.as_str(), device.name)?;
		}
		Ok(())
	}
}

impl Render for DeviceInfo {
	fn render(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "{} ({}, {})", self.name, self.id, self.kind.as_str())
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessesData {
	pub processes: Vec<ProcessInfo>,
}

impl Render for ProcessesData {
	fn render(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "{:>7}  Name", "PID")?;
		for process in &self.processes {
			writeln!(out, "{:>7}  {}", process.pid, process.name)?;
		}
		Ok(())
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplicationsData {
	pub applications: Vec<ApplicationInfo>,
}

impl Render for ApplicationsData {
	fn render(&self, out: &mut dyn Write) -> io::Result<()> {
		let width = self.applications.iter().map(|a| a.name.len()).max().unwrap_or(0).max(4);
		writeln!(out, "{:>7}  {:<width$}  Identifier", "PID", "Name")?;
		for app in &self.applications {
			let pid = app.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
			writeln!(out, "{pid:>7}  {:<width$}  {}", app.name, app.identifier)?;
		}
		Ok(())
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ParamsData(pub serde_json::Map<String, serde_json::Value>);

impl Render for ParamsData {
	fn render(&self, out: &mut dyn Write) -> io::Result<()> {
		for (key, value) in &self.0 {
			match value {
				serde_json::Value::String(s) => writeln!(out, "{key}: {s}")?,
				other => writeln!(out, "{key}: {other}")?,
			}
		}
		Ok(())
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidData {
	pub pid: u32,
	/// Set by `spawn`
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resumed: Option<bool>,
}

impl Render for PidData {
	fn render(&self, out: &mut dyn Write) -> io::Result<()> {
		match self.resumed {
			Some(true) => writeln!(out, "spawned {} (running)", self.pid),
			Some(false) => writeln!(out, "spawned {} (suspended)", self.pid),
			None => writeln!(out, "{}", self.pid),
		}
	}
}
