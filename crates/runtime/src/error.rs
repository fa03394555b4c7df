//! Error types shared by every telco crate.
//!
//! Each variant corresponds to one [`ErrorKind`], so a failure reported by a
//! backend keeps its kind when it crosses the connection. Messages are
//! lower-cased on construction to keep them stable for matching.

pub use telco_protocol::ErrorKind;
use thiserror::Error;

/// Result type alias for telco operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by control-plane operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
	/// The device manager is closed or its backend is gone.
	#[error("{0}")]
	ServerNotRunning(String),

	#[error("{0}")]
	ExecutableNotFound(String),

	#[error("{0}")]
	ExecutableNotSupported(String),

	#[error("{0}")]
	ProcessNotFound(String),

	#[error("{0}")]
	ProcessNotResponding(String),

	#[error("{0}")]
	InvalidArgument(String),

	/// The object is in the wrong state for the operation.
	#[error("{0}")]
	InvalidOperation(String),

	#[error("{0}")]
	PermissionDenied(String),

	#[error("{0}")]
	AddressInUse(String),

	/// A deadline elapsed before the operation completed.
	#[error("{0}")]
	TimedOut(String),

	#[error("{0}")]
	NotSupported(String),

	/// A message could not be decoded.
	#[error("{0}")]
	Protocol(String),

	/// The channel to the backend failed.
	#[error("{0}")]
	Transport(String),

	/// A [`Cancellable`](crate::Cancellable) fired before the operation completed.
	#[error("operation was cancelled")]
	Cancelled,

	/// An exported function raised an error inside the script.
	#[error("{0}")]
	Rpc(String),
}

impl Error {
	/// Builds an error of the given kind, lower-casing the first letter of the message.
	///
	/// Messages raised by scripts ([`ErrorKind::Rpc`]) are kept verbatim.
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		if kind == ErrorKind::Rpc {
			return Error::Rpc(message.into());
		}
		let message = lowercase_first(message.into());
		match kind {
			ErrorKind::ServerNotRunning => Error::ServerNotRunning(message),
			ErrorKind::ExecutableNotFound => Error::ExecutableNotFound(message),
			ErrorKind::ExecutableNotSupported => Error::ExecutableNotSupported(message),
			ErrorKind::ProcessNotFound => Error::ProcessNotFound(message),
			ErrorKind::ProcessNotResponding => Error::ProcessNotResponding(message),
			ErrorKind::InvalidArgument => Error::InvalidArgument(message),
			ErrorKind::InvalidOperation => Error::InvalidOperation(message),
			ErrorKind::PermissionDenied => Error::PermissionDenied(message),
			ErrorKind::AddressInUse => Error::AddressInUse(message),
			ErrorKind::TimedOut => Error::TimedOut(message),
			ErrorKind::NotSupported => Error::NotSupported(message),
			ErrorKind::Protocol => Error::Protocol(message),
			ErrorKind::Transport => Error::Transport(message),
			ErrorKind::Cancelled => Error::Cancelled,
			ErrorKind::Rpc => Error::Rpc(message),
		}
	}

	/// Returns the kind of this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::ServerNotRunning(_) => ErrorKind::ServerNotRunning,
			Error::ExecutableNotFound(_) => ErrorKind::ExecutableNotFound,
			Error::ExecutableNotSupported(_) => ErrorKind::ExecutableNotSupported,
			Error::ProcessNotFound(_) => ErrorKind::ProcessNotFound,
			Error::ProcessNotResponding(_) => ErrorKind::ProcessNotResponding,
			Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
			Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
			Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
			Error::AddressInUse(_) => ErrorKind::AddressInUse,
			Error::TimedOut(_) => ErrorKind::TimedOut,
			Error::NotSupported(_) => ErrorKind::NotSupported,
			Error::Protocol(_) => ErrorKind::Protocol,
			Error::Transport(_) => ErrorKind::Transport,
			Error::Cancelled => ErrorKind::Cancelled,
			Error::Rpc(_) => ErrorKind::Rpc,
		}
	}

	/// Returns true if this error was caused by cancellation.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled)
	}

	/// Returns true if this error was caused by an elapsed deadline.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::TimedOut(_))
	}

	/// The error a device lookup fails with when nothing matched.
	pub fn device_not_found() -> Self {
		Error::InvalidArgument("device not found".to_string())
	}

	/// The error pending requests fail with when the backend goes away.
	pub fn connection_closed() -> Self {
		Error::Transport("connection closed".to_string())
	}
}

fn lowercase_first(message: String) -> String {
	let mut chars = message.chars();
	match chars.next() {
		Some(first) if first.is_uppercase() => first.to_lowercase().chain(chars).collect(),
		_ => message,
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Protocol(format!("malformed message: {err}"))
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::new(ErrorKind::Transport, err.to_string())
	}
}
