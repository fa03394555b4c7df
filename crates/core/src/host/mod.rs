//! In-process host: a [`Backend`] with simulated devices, processes and agents.
//!
//! [`InProcessHost`] is what [`DeviceManager::start`](crate::DeviceManager::start)
//! connects to by default. It answers the control protocol on the context's
//! runtime and exposes a [`HostHandle`] for driving the simulation from the
//! outside: adding devices and processes, crashing processes, registering
//! agents for script sources, or dropping the connection.
//!
//! ```ignore
//! let host = InProcessHost::new();
//! let handle = host.handle();
//! let pid = handle.add_process("local", "Twitter")?;
//! let manager = DeviceManager::with_backend(ManagerOptions::default(), &host)?;
//! let session = manager.get_local_device()?.attach(pid, SessionOptions::default())?;
//! ```

mod agent;
mod fixture;
mod state;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use telco_protocol::{Crash, DetachReason, DeviceInfo, DeviceKind};
use telco_runtime::{
	Backend, Cancellable, ChannelTransport, Context, Error, Request, Response, Result,
	TransportParts,
};
use tokio::sync::mpsc;

pub use agent::{Agent, BYTECODE_MAGIC, FnAgent, compile, decompile};
pub use fixture::{DeviceFixture, HostFixture, ProcessFixture};
pub use state::{ExecutableKind, HostProcess};

use state::HostState;

/// Id of the device every host starts with.
pub const LOCAL_DEVICE_ID: &str = "local";

struct HostShared {
	state: Mutex<HostState>,
}

/// Backend serving the simulated world. Accepts one client at a time.
#[derive(Clone)]
pub struct InProcessHost {
	handle: HostHandle,
}

impl InProcessHost {
	/// Creates a host with only the local device.
	pub fn new() -> Self {
		Self {
			handle: HostHandle {
				shared: Arc::new(HostShared {
					state: Mutex::new(HostState::new()),
				}),
			},
		}
	}

	/// Creates a host populated from `fixture`.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidArgument`] if a device lists the same pid twice.
	pub fn from_fixture(fixture: &HostFixture) -> Result<Self> {
		let host = Self::new();
		fixture.apply(&mut host.handle.shared.state.lock())?;
		Ok(host)
	}

	/// Control surface for the simulation.
	pub fn handle(&self) -> HostHandle {
		self.handle.clone()
	}
}

impl Default for InProcessHost {
	fn default() -> Self {
		Self::new()
	}
}

impl Backend for InProcessHost {
	fn name(&self) -> &str {
		"in-process"
	}

	fn connect(&self, ctx: &Context) -> Result<TransportParts> {
		let (to_client, message_rx) = mpsc::unbounded_channel();
		let (to_host, host_rx) = mpsc::unbounded_channel();
		let stop = Cancellable::new();
		{
			let mut state = self.handle.shared.state.lock();
			if state.outbound.is_some() {
				return Err(Error::AddressInUse(
					"in-process host already has a client".to_string(),
				));
			}
			state.outbound = Some(to_client);
			state.stop = Some(stop.clone());
		}

		let shared = Arc::clone(&self.handle.shared);
		ctx.spawn(serve(shared, host_rx, stop));
		tracing::debug!(target: "telco::host", "client connected");

		Ok(TransportParts {
			sender: Box::new(ChannelTransport::new(to_host)),
			message_rx,
		})
	}
}

async fn serve(shared: Arc<HostShared>, mut rx: mpsc::UnboundedReceiver<Value>, stop: Cancellable) {
	loop {
		let value = tokio::select! {
			biased;
			_ = stop.cancelled() => break,
			value = rx.recv() => match value {
				Some(value) => value,
				None => break,
			},
		};

		let request: Request = match serde_json::from_value(value) {
			Ok(request) => request,
			Err(e) => {
				tracing::warn!(target: "telco::host", error = %e, "dropping malformed request");
				continue;
			}
		};
		tracing::debug!(target: "telco::host", id = request.id, guid = %request.guid, method = %request.method, "request");

		let deferred = {
			let mut state = shared.state.lock();
			let (result, deferred) = state.handle(&request);
			state.respond(Response::from_result(request.id, result));
			deferred
		};

		if let Some(deferred) = deferred {
			let shared = Arc::clone(&shared);
			tokio::task::spawn_blocking(move || {
				let script = deferred.script.clone();
				if let Some(payload) = deferred.run() {
					let state = shared.state.lock();
					if !state.script_send(&script, payload, None) {
						tracing::debug!(target: "telco::host", %script, "script gone; dropping agent output");
					}
				}
			});
		}
	}

	let mut state = shared.state.lock();
	if state.stop.as_ref() == Some(&stop) {
		state.reset_client_state();
	}
	tracing::debug!(target: "telco::host", "client disconnected");
}

/// Drives the simulation served by an [`InProcessHost`].
///
/// Every mutation that a connected client can observe is reported to it as
/// the matching protocol event.
#[derive(Clone)]
pub struct HostHandle {
	shared: Arc<HostShared>,
}

impl HostHandle {
	/// Adds a device and announces it. Adding an existing id does nothing.
	pub fn add_device(&self, id: &str, name: &str, kind: DeviceKind) -> DeviceInfo {
		let info = DeviceInfo::new(id, name, kind);
		self.shared.state.lock().add_device(info.clone());
		info
	}

	/// Disconnects a device. Sessions on it detach with `device-lost`.
	pub fn remove_device(&self, id: &str) -> bool {
		self.shared.state.lock().remove_device(id)
	}

	/// Starts a running process and returns its pid.
	pub fn add_process(&self, device: &str, name: &str) -> Result<u32> {
		Ok(self.shared.state.lock().device_mut(device)?.add_process(name))
	}

	/// Makes `path` spawnable on `device`.
	pub fn add_executable(&self, device: &str, path: &str, kind: ExecutableKind) -> Result<()> {
		self.shared
			.state
			.lock()
			.device_mut(device)?
			.executables
			.insert(path.to_string(), kind);
		Ok(())
	}

	/// Unresponsive processes fail attach with `ProcessNotResponding`.
	pub fn set_responsive(&self, device: &str, pid: u32, responsive: bool) -> Result<()> {
		self.with_process(device, pid, |p| p.responsive = responsive)
	}

	/// Protected processes fail attach with `PermissionDenied`.
	pub fn set_protected(&self, device: &str, pid: u32, protected: bool) -> Result<()> {
		self.with_process(device, pid, |p| p.protected = protected)
	}

	pub fn set_injection_supported(&self, device: &str, supported: bool) -> Result<()> {
		self.shared
			.state
			.lock()
			.device_mut(device)?
			.injection_supported = supported;
		Ok(())
	}

	/// Installs an application. It counts as running while a process named
	/// `name` exists.
	pub fn add_application(&self, device: &str, identifier: &str, name: &str) -> Result<()> {
		self.shared
			.state
			.lock()
			.device_mut(device)?
			.applications
			.insert(identifier.to_string(), name.to_string());
		Ok(())
	}

	/// Brings an installed application to the front, or clears the frontmost
	/// application with `None`.
	pub fn set_frontmost_application(&self, device: &str, identifier: Option<&str>) -> Result<()> {
		let mut state = self.shared.state.lock();
		let device = state.device_mut(device)?;
		if let Some(identifier) = identifier {
			if !device.applications.contains_key(identifier) {
				return Err(Error::InvalidArgument(format!(
					"application '{identifier}' is not installed"
				)));
			}
		}
		device.frontmost = identifier.map(str::to_string);
		Ok(())
	}

	/// Overrides one entry of `query_system_parameters`.
	pub fn set_system_parameter(&self, device: &str, key: &str, value: Value) -> Result<()> {
		self.shared
			.state
			.lock()
			.device_mut(device)?
			.parameters
			.insert(key.to_string(), value);
		Ok(())
	}

	/// Crashes a process: `processCrashed` on the device, then `detached`
	/// with the crash on every session attached to it.
	pub fn crash_process(&self, device: &str, pid: u32, summary: &str, report: &str) -> Result<Crash> {
		let mut state = self.shared.state.lock();
		let process_name = state
			.device_mut(device)?
			.processes
			.get(&pid)
			.map(|p| p.name.clone())
			.ok_or_else(|| Error::ProcessNotFound(format!("unable to find process with pid {pid}")))?;
		let crash = Crash {
			pid,
			process_name,
			summary: summary.to_string(),
			report: report.to_string(),
			parameters: Default::default(),
		};
		state.terminate(device, pid, DetachReason::ProcessTerminated, Some(crash.clone()));
		Ok(crash)
	}

	/// Ends a process normally.
	pub fn exit_process(&self, device: &str, pid: u32) -> Result<()> {
		self.end_process(device, pid, DetachReason::ProcessTerminated)
	}

	/// Replaces a process image (exec); the pid stays alive.
	pub fn replace_process(&self, device: &str, pid: u32) -> Result<()> {
		self.end_process(device, pid, DetachReason::ProcessReplaced)
	}

	fn end_process(&self, device: &str, pid: u32, reason: DetachReason) -> Result<()> {
		let mut state = self.shared.state.lock();
		if !state.device_mut(device)?.processes.contains_key(&pid) {
			return Err(Error::ProcessNotFound(format!(
				"unable to find process with pid {pid}"
			)));
		}
		state.terminate(device, pid, reason, None);
		Ok(())
	}

	fn with_process(&self, device: &str, pid: u32, f: impl FnOnce(&mut HostProcess)) -> Result<()> {
		let mut state = self.shared.state.lock();
		let process = state
			.device_mut(device)?
			.processes
			.get_mut(&pid)
			.ok_or_else(|| Error::ProcessNotFound(format!("unable to find process with pid {pid}")))?;
		f(process);
		Ok(())
	}

	/// Snapshot of a process, if it is still alive.
	pub fn process(&self, device: &str, pid: u32) -> Option<HostProcess> {
		let mut state = self.shared.state.lock();
		state.device_mut(device).ok()?.processes.get(&pid).cloned()
	}

	/// Scripts whose source equals `source` (directly or via compiled
	/// bytecode) run `agent` once loaded.
	pub fn register_agent(&self, source: &str, agent: impl Agent + 'static) {
		self.shared
			.state
			.lock()
			.agents
			.insert(source.to_string(), Arc::new(agent));
	}

	/// Guids of live scripts, oldest first.
	pub fn scripts(&self) -> Vec<String> {
		self.shared.state.lock().script_ids()
	}

	/// Delivers a raw `send` payload from a loaded script. Returns false if the
	/// script is not loaded.
	pub fn send_from_script(&self, script: &str, payload: Value, data: Option<&[u8]>) -> bool {
		self.shared.state.lock().script_send(script, payload, data)
	}

	/// Emits an arbitrary event to the client.
	pub fn emit(&self, guid: &str, method: &str, params: Value) {
		self.shared.state.lock().emit(guid, method, params);
	}

	pub fn session_count(&self) -> usize {
		self.shared.state.lock().session_count()
	}

	pub fn is_connected(&self) -> bool {
		self.shared.state.lock().outbound.is_some()
	}

	/// Drops the client connection as if the transport failed.
	pub fn disconnect(&self) {
		let mut state = self.shared.state.lock();
		if let Some(stop) = state.stop.take() {
			stop.cancel();
		}
		state.reset_client_state();
		tracing::debug!(target: "telco::host", "connection dropped by host");
	}
}
