//! Device manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`DeviceManager`](crate::DeviceManager).
///
/// Deserializes from camelCase with every field optional; durations are
/// given in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerOptions {
	/// Deadline for one RPC call through a script's exports
	#[serde(rename = "rpcTimeoutMs", with = "millis")]
	pub rpc_timeout: Duration,

	/// Deadline for one control request (attach, spawn, load, ...)
	#[serde(rename = "requestTimeoutMs", with = "millis")]
	pub request_timeout: Duration,

	/// Buffer size of each entity's event broadcast
	pub event_capacity: usize,

	/// Threads in the background runtime
	pub worker_threads: usize,
}

impl Default for ManagerOptions {
	fn default() -> Self {
		Self {
			rpc_timeout: Duration::from_secs(30),
			request_timeout: Duration::from_secs(30),
			event_capacity: 256,
			worker_threads: 2,
		}
	}
}

impl ManagerOptions {
	pub fn new() -> Self {
		Self::default()
	}

	/// Defaults overridden by `TELCO_RPC_TIMEOUT_MS`, `TELCO_REQUEST_TIMEOUT_MS`
	/// and `TELCO_WORKER_THREADS`. Unparseable values are ignored with a warning.
	pub fn from_env() -> Self {
		let mut options = Self::default();
		if let Some(ms) = env_u64("TELCO_RPC_TIMEOUT_MS") {
			options.rpc_timeout = Duration::from_millis(ms);
		}
		if let Some(ms) = env_u64("TELCO_REQUEST_TIMEOUT_MS") {
			options.request_timeout = Duration::from_millis(ms);
		}
		if let Some(threads) = env_u64("TELCO_WORKER_THREADS") {
			options.worker_threads = threads as usize;
		}
		options
	}

	pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
		self.rpc_timeout = timeout;
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	pub fn event_capacity(mut self, capacity: usize) -> Self {
		self.event_capacity = capacity;
		self
	}

	pub fn worker_threads(mut self, threads: usize) -> Self {
		self.worker_threads = threads;
		self
	}
}

fn env_u64(name: &str) -> Option<u64> {
	let raw = std::env::var(name).ok()?;
	match raw.trim().parse() {
		Ok(value) => Some(value),
		Err(_) => {
			tracing::warn!(target: "telco", var = name, value = %raw, "ignoring invalid environment override");
			None
		}
	}
}

mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
