//! Simulated world served by the in-process host.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use telco_protocol::{
	ApplicationInfo, Crash, DetachReason, DeviceInfo, DeviceKind, ProcessInfo, RpcCall, RpcValue,
	ScriptOptions, SessionOptions, SpawnOptions, Stdio, parse_call, reply_error, reply_ok,
};
use telco_runtime::{Cancellable, Error, Event, Request, Response, Result};
use tokio::sync::mpsc;

use super::agent::{self, Agent, NullAgent};

/// How the host treats a program path passed to `spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutableKind {
	/// Spawns normally
	#[default]
	Native,
	/// Exists but has a format the device cannot run
	Unsupported,
	/// Exists but the caller may not run it
	Restricted,
}

/// Snapshot of a simulated process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProcess {
	pub pid: u32,
	pub name: String,
	pub argv: Vec<String>,
	/// Spawned and not yet resumed
	pub suspended: bool,
	pub responsive: bool,
	/// Refuses attach and injection
	pub protected: bool,
	pub piped: bool,
	/// Everything written through `Device::input`
	pub stdin: Vec<u8>,
	/// Libraries injected so far, by injectee id
	pub injected: Vec<u32>,
	/// Scripts that outlive their session
	pub eternal_scripts: Vec<String>,
}

impl HostProcess {
	pub(crate) fn new(pid: u32, name: impl Into<String>) -> Self {
		Self {
			pid,
			name: name.into(),
			argv: Vec::new(),
			suspended: false,
			responsive: true,
			protected: false,
			piped: false,
			stdin: Vec::new(),
			injected: Vec::new(),
			eternal_scripts: Vec::new(),
		}
	}
}

pub(crate) struct SimDevice {
	pub(crate) info: DeviceInfo,
	pub(crate) parameters: Map<String, Value>,
	pub(crate) processes: BTreeMap<u32, HostProcess>,
	pub(crate) executables: BTreeMap<String, ExecutableKind>,
	pub(crate) injection_supported: bool,
	/// Installed applications: identifier to display name
	pub(crate) applications: IndexMap<String, String>,
	pub(crate) frontmost: Option<String>,
	next_pid: u32,
	next_injectee: u32,
}

impl SimDevice {
	pub(crate) fn new(info: DeviceInfo) -> Self {
		let mut parameters = Map::new();
		parameters.insert(
			"os".to_string(),
			json!({"id": std::env::consts::OS, "name": std::env::consts::OS}),
		);
		parameters.insert("arch".to_string(), json!(std::env::consts::ARCH));
		parameters.insert("platform".to_string(), json!(std::env::consts::FAMILY));
		parameters.insert("access".to_string(), json!("full"));
		parameters.insert("name".to_string(), json!(info.name));

		Self {
			info,
			parameters,
			processes: BTreeMap::new(),
			executables: BTreeMap::new(),
			injection_supported: true,
			applications: IndexMap::new(),
			frontmost: None,
			next_pid: 1000,
			next_injectee: 1,
		}
	}

	pub(crate) fn add_process(&mut self, name: &str) -> u32 {
		while self.processes.contains_key(&self.next_pid) {
			self.next_pid += 1;
		}
		let pid = self.next_pid;
		self.next_pid += 1;
		self.processes.insert(pid, HostProcess::new(pid, name));
		pid
	}

	/// An application is running while some process carries its name.
	fn application(&self, identifier: &str) -> Option<ApplicationInfo> {
		let name = self.applications.get(identifier)?;
		let pid = self
			.processes
			.values()
			.find(|p| p.name == *name)
			.map(|p| p.pid);
		Some(ApplicationInfo {
			identifier: identifier.to_string(),
			name: name.clone(),
			pid,
		})
	}

	fn process(&mut self, pid: u32) -> Result<&mut HostProcess> {
		self.processes
			.get_mut(&pid)
			.ok_or_else(|| Error::ProcessNotFound(format!("unable to find process with pid {pid}")))
	}

	/// Checks shared by attach and injection.
	fn accessible_process(&mut self, pid: u32) -> Result<&mut HostProcess> {
		let process = self.process(pid)?;
		if process.protected {
			return Err(Error::PermissionDenied(format!(
				"unable to access process with pid {pid}"
			)));
		}
		if !process.responsive {
			return Err(Error::ProcessNotResponding(format!(
				"process with pid {pid} is not responding"
			)));
		}
		Ok(process)
	}
}

struct SimSession {
	device: String,
	pid: u32,
	scripts: Vec<String>,
}

enum ScriptPayload {
	Source(String),
	Bytecode(Vec<u8>),
}

enum SimScriptState {
	Created,
	Loaded(Arc<dyn Agent>),
}

struct SimScript {
	session: String,
	payload: ScriptPayload,
	state: SimScriptState,
}

/// Blocking work handed to a worker thread after a request is answered.
pub(crate) struct Deferred {
	pub(crate) script: String,
	pub(crate) agent: Arc<dyn Agent>,
	pub(crate) work: DeferredWork,
}

pub(crate) enum DeferredWork {
	Call(RpcCall),
	Message(Value, Option<Vec<u8>>),
}

impl Deferred {
	/// Runs the agent and returns the payload to send back, if any.
	pub(crate) fn run(self) -> Option<Value> {
		match self.work {
			DeferredWork::Call(call) => Some(match self.agent.call(&call.method, call.args) {
				Ok(value) => reply_ok(call.id, &value),
				Err(message) => reply_error(call.id, &message),
			}),
			DeferredWork::Message(message, data) => self.agent.on_message(message, data),
		}
	}
}

pub(crate) struct HostState {
	pub(crate) outbound: Option<mpsc::UnboundedSender<Value>>,
	/// Stops the serve loop of the connected client
	pub(crate) stop: Option<Cancellable>,
	pub(crate) devices: IndexMap<String, SimDevice>,
	sessions: HashMap<String, SimSession>,
	scripts: HashMap<String, SimScript>,
	pub(crate) agents: HashMap<String, Arc<dyn Agent>>,
	next_session: u64,
	next_script: u64,
}

#[derive(Deserialize)]
struct PidParams {
	pid: u32,
}

#[derive(Deserialize)]
struct SpawnParams {
	program: String,
	#[serde(default)]
	options: SpawnOptions,
}

#[derive(Deserialize)]
struct InputParams {
	pid: u32,
	data: RpcValue,
}

#[derive(Deserialize)]
struct AttachParams {
	pid: u32,
	#[serde(default)]
	options: SessionOptions,
}

#[derive(Deserialize)]
struct InjectParams {
	pid: u32,
	#[serde(default)]
	path: Option<String>,
	#[serde(default)]
	blob: Option<RpcValue>,
	entrypoint: String,
	#[serde(default)]
	data: String,
}

#[derive(Deserialize)]
struct AddressParams {
	address: String,
}

#[derive(Deserialize)]
struct CreateScriptParams {
	#[serde(default)]
	source: Option<String>,
	#[serde(default)]
	bytes: Option<RpcValue>,
	#[serde(default)]
	options: ScriptOptions,
}

#[derive(Deserialize)]
struct CompileParams {
	source: String,
}

#[derive(Deserialize)]
struct PostParams {
	message: Value,
	#[serde(default)]
	data: Option<RpcValue>,
}

fn params<T: DeserializeOwned>(value: &Value) -> Result<T> {
	serde_json::from_value(value.clone())
		.map_err(|e| Error::InvalidArgument(format!("invalid parameters: {e}")))
}

fn device_lost() -> Error {
	Error::InvalidOperation("device is lost".to_string())
}

fn session_detached() -> Error {
	Error::InvalidOperation("session is detached".to_string())
}

fn script_destroyed() -> Error {
	Error::InvalidOperation("script is destroyed".to_string())
}

fn unknown_method(method: &str) -> Error {
	Error::NotSupported(format!("unsupported method '{method}'"))
}

impl HostState {
	pub(crate) fn new() -> Self {
		let local = DeviceInfo::new("local", "Local System", DeviceKind::Local);
		let mut devices = IndexMap::new();
		devices.insert(local.id.clone(), SimDevice::new(local));
		Self {
			outbound: None,
			stop: None,
			devices,
			sessions: HashMap::new(),
			scripts: HashMap::new(),
			agents: HashMap::new(),
			next_session: 1,
			next_script: 1,
		}
	}

	fn send(&self, message: Value) {
		if let Some(tx) = &self.outbound {
			let _ = tx.send(message);
		}
	}

	pub(crate) fn emit(&self, guid: &str, method: &str, params: Value) {
		match serde_json::to_value(Event::new(guid, method, params)) {
			Ok(event) => self.send(event),
			Err(e) => tracing::error!(error = %e, "failed to encode host event"),
		}
	}

	pub(crate) fn respond(&self, response: Response) {
		match serde_json::to_value(response) {
			Ok(response) => self.send(response),
			Err(e) => tracing::error!(error = %e, "failed to encode host response"),
		}
	}

	pub(crate) fn device_mut(&mut self, id: &str) -> Result<&mut SimDevice> {
		self.devices
			.get_mut(id)
			.ok_or_else(|| Error::InvalidArgument(format!("no device with id '{id}'")))
	}

	/// Handles one request. Agent work that may block is returned instead of run.
	pub(crate) fn handle(&mut self, request: &Request) -> (Result<Value>, Option<Deferred>) {
		let guid = request.guid.as_str();
		let method = request.method.as_str();
		let p = &request.params;

		if guid == "manager" {
			return (self.handle_manager(method, p), None);
		}
		if let Some(id) = guid.strip_prefix("device:") {
			return (self.handle_device(id, method, p), None);
		}
		if guid.starts_with("session:") {
			return (self.handle_session(guid, method, p), None);
		}
		if guid.starts_with("script:") {
			return match self.handle_script(guid, method, p) {
				Ok((value, deferred)) => (Ok(value), deferred),
				Err(e) => (Err(e), None),
			};
		}
		(
			Err(Error::InvalidArgument(format!("unknown object '{guid}'"))),
			None,
		)
	}

	fn handle_manager(&mut self, method: &str, p: &Value) -> Result<Value> {
		match method {
			"enumerateDevices" => {
				let infos: Vec<&DeviceInfo> = self.devices.values().map(|d| &d.info).collect();
				Ok(serde_json::to_value(infos)?)
			}
			"addRemoteDevice" => {
				let AddressParams { address } = params(p)?;
				if address.trim().is_empty() {
					return Err(Error::InvalidArgument("address must not be empty".to_string()));
				}
				let id = format!("socket@{address}");
				if let Some(existing) = self.devices.get(&id) {
					return Ok(serde_json::to_value(&existing.info)?);
				}
				let info = DeviceInfo::new(id, address, DeviceKind::Remote);
				self.add_device(info.clone());
				Ok(serde_json::to_value(info)?)
			}
			"removeRemoteDevice" => {
				let AddressParams { address } = params(p)?;
				let id = format!("socket@{address}");
				if !self.remove_device(&id) {
					return Err(Error::InvalidArgument(format!(
						"no remote device at '{address}'"
					)));
				}
				Ok(Value::Null)
			}
			_ => Err(unknown_method(method)),
		}
	}

	pub(crate) fn add_device(&mut self, info: DeviceInfo) {
		if self.devices.contains_key(&info.id) {
			return;
		}
		let params = serde_json::to_value(&info).unwrap_or(Value::Null);
		self.devices.insert(info.id.clone(), SimDevice::new(info));
		self.emit("manager", "deviceAdded", params);
	}

	/// Removes a device; its sessions end with it. Returns false if unknown.
	pub(crate) fn remove_device(&mut self, id: &str) -> bool {
		if self.devices.shift_remove(id).is_none() {
			return false;
		}
		let orphaned: Vec<String> = self
			.sessions
			.iter()
			.filter(|(_, s)| s.device == id)
			.map(|(guid, _)| guid.clone())
			.collect();
		for guid in orphaned {
			self.drop_session(&guid);
		}
		self.emit("manager", "deviceRemoved", json!({"id": id}));
		true
	}

	fn handle_device(&mut self, id: &str, method: &str, p: &Value) -> Result<Value> {
		let device = self.devices.get_mut(id).ok_or_else(device_lost)?;
		match method {
			"querySystemParameters" => Ok(Value::Object(device.parameters.clone())),
			"enumerateProcesses" => {
				let processes: Vec<ProcessInfo> = device
					.processes
					.values()
					.map(|process| ProcessInfo {
						pid: process.pid,
						name: process.name.clone(),
					})
					.collect();
				Ok(serde_json::to_value(processes)?)
			}
			"enumerateApplications" => {
				let applications: Vec<ApplicationInfo> = device
					.applications
					.keys()
					.filter_map(|identifier| device.application(identifier))
					.collect();
				Ok(serde_json::to_value(applications)?)
			}
			"getFrontmostApplication" => {
				let frontmost = device
					.frontmost
					.as_deref()
					.and_then(|identifier| device.application(identifier))
					.filter(ApplicationInfo::is_running);
				Ok(json!({"application": frontmost}))
			}
			"spawn" => {
				let SpawnParams { program, options } = params(p)?;
				match device.executables.get(&program) {
					None => {
						return Err(Error::ExecutableNotFound(format!(
							"unable to find executable at '{program}'"
						)));
					}
					Some(ExecutableKind::Unsupported) => {
						return Err(Error::ExecutableNotSupported(format!(
							"unable to spawn executable at '{program}': unsupported file format"
						)));
					}
					Some(ExecutableKind::Restricted) => {
						return Err(Error::PermissionDenied(format!(
							"unable to spawn executable at '{program}': permission denied"
						)));
					}
					Some(ExecutableKind::Native) => {}
				}
				let name = Path::new(&program)
					.file_name()
					.map(|n| n.to_string_lossy().into_owned())
					.unwrap_or_else(|| program.clone());
				let pid = device.add_process(&name);
				let process = device.process(pid)?;
				process.suspended = true;
				process.piped = options.stdio == Some(Stdio::Pipe);
				process.argv = options.argv.unwrap_or_else(|| vec![program.clone()]);
				tracing::debug!(pid, %program, "spawned suspended process");
				Ok(json!({"pid": pid}))
			}
			"resume" => {
				let PidParams { pid } = params(p)?;
				device.process(pid)?.suspended = false;
				Ok(Value::Null)
			}
			"input" => {
				let InputParams { pid, data } = params(p)?;
				let process = device.process(pid)?;
				if !process.piped {
					return Err(Error::InvalidOperation(format!(
						"process with pid {pid} was not spawned with piped stdio"
					)));
				}
				let bytes = data
					.as_bytes()
					.ok_or_else(|| Error::InvalidArgument("input data must be bytes".to_string()))?;
				process.stdin.extend_from_slice(bytes);
				Ok(Value::Null)
			}
			"kill" => {
				let PidParams { pid } = params(p)?;
				device.process(pid)?;
				self.terminate(id, pid, DetachReason::ProcessTerminated, None);
				Ok(Value::Null)
			}
			"attach" => {
				let AttachParams { pid, options } = params(p)?;
				device.accessible_process(pid)?;
				let guid = format!("session:{}", self.next_session);
				self.next_session += 1;
				tracing::debug!(pid, %guid, realm = ?options.realm, "attached");
				self.sessions.insert(
					guid.clone(),
					SimSession {
						device: id.to_string(),
						pid,
						scripts: Vec::new(),
					},
				);
				Ok(json!({"session": guid}))
			}
			"injectLibraryFile" | "injectLibraryBlob" => {
				let InjectParams {
					pid,
					path,
					blob,
					entrypoint,
					data,
				} = params(p)?;
				if !device.injection_supported {
					return Err(Error::NotSupported(
						"library injection is not supported on this device".to_string(),
					));
				}
				match (method, path, blob) {
					("injectLibraryFile", Some(path), _) if !path.is_empty() => {}
					("injectLibraryBlob", _, Some(blob)) if blob.as_bytes().is_some_and(|b| !b.is_empty()) => {}
					_ => return Err(Error::InvalidArgument("library is empty".to_string())),
				}
				if entrypoint.is_empty() {
					return Err(Error::InvalidArgument("entrypoint must not be empty".to_string()));
				}
				let injectee = device.next_injectee;
				device.accessible_process(pid)?.injected.push(injectee);
				device.next_injectee += 1;
				tracing::debug!(pid, injectee, %entrypoint, data_len = data.len(), "injected library");
				Ok(json!({"id": injectee}))
			}
			_ => Err(unknown_method(method)),
		}
	}

	/// Ends a process, detaching every session attached to it.
	pub(crate) fn terminate(
		&mut self,
		device: &str,
		pid: u32,
		reason: DetachReason,
		crash: Option<Crash>,
	) {
		if reason != DetachReason::ProcessReplaced {
			if let Some(d) = self.devices.get_mut(device) {
				d.processes.remove(&pid);
			}
		}
		if let Some(crash) = &crash {
			self.emit(
				&format!("device:{device}"),
				"processCrashed",
				serde_json::to_value(crash).unwrap_or(Value::Null),
			);
		}

		let mut attached: Vec<String> = self
			.sessions
			.iter()
			.filter(|(_, s)| s.device == device && s.pid == pid)
			.map(|(guid, _)| guid.clone())
			.collect();
		attached.sort();
		for guid in attached {
			self.drop_session(&guid);
			self.emit(&guid, "detached", json!({"reason": reason, "crash": crash}));
		}
	}

	fn drop_session(&mut self, guid: &str) {
		if let Some(session) = self.sessions.remove(guid) {
			for script in session.scripts {
				self.scripts.remove(&script);
			}
		}
	}

	fn handle_session(&mut self, guid: &str, method: &str, p: &Value) -> Result<Value> {
		if !self.sessions.contains_key(guid) {
			return Err(session_detached());
		}
		match method {
			"detach" => {
				self.drop_session(guid);
				Ok(Value::Null)
			}
			// sessions served in-process are never interrupted
			"resume" => Ok(Value::Null),
			"createScript" => {
				let CreateScriptParams {
					source,
					bytes,
					options,
				} = params(p)?;
				let payload = match (source, bytes) {
					(Some(source), None) => ScriptPayload::Source(source),
					(None, Some(RpcValue::Bytes(bytes))) => ScriptPayload::Bytecode(bytes),
					_ => {
						return Err(Error::InvalidArgument(
							"expected either script source or bytecode".to_string(),
						));
					}
				};
				let script = format!("script:{}", self.next_script);
				self.next_script += 1;
				tracing::debug!(%script, name = ?options.name, "created script");
				self.scripts.insert(
					script.clone(),
					SimScript {
						session: guid.to_string(),
						payload,
						state: SimScriptState::Created,
					},
				);
				if let Some(session) = self.sessions.get_mut(guid) {
					session.scripts.push(script.clone());
				}
				Ok(json!({"script": script}))
			}
			"compileScript" => {
				let CompileParams { source } = params(p)?;
				let bytecode = agent::compile(&source)?;
				Ok(json!({"bytecode": RpcValue::Bytes(bytecode).to_json()}))
			}
			_ => Err(unknown_method(method)),
		}
	}

	fn handle_script(
		&mut self,
		guid: &str,
		method: &str,
		p: &Value,
	) -> Result<(Value, Option<Deferred>)> {
		match method {
			"load" => {
				let script = self.scripts.get(guid).ok_or_else(script_destroyed)?;
				if matches!(script.state, SimScriptState::Loaded(_)) {
					return Err(Error::InvalidOperation("script is already loaded".to_string()));
				}
				let source = match &script.payload {
					ScriptPayload::Source(source) => source.clone(),
					ScriptPayload::Bytecode(bytes) => agent::decompile(bytes)?,
				};
				let agent: Arc<dyn Agent> = match self.agents.get(&source) {
					Some(agent) => Arc::clone(agent),
					None => Arc::new(NullAgent),
				};
				let exports = agent.exports();
				if let Some(script) = self.scripts.get_mut(guid) {
					script.state = SimScriptState::Loaded(agent);
				}
				Ok((json!({"exports": exports}), None))
			}
			"unload" => {
				let script = self.scripts.remove(guid).ok_or_else(script_destroyed)?;
				if let Some(session) = self.sessions.get_mut(&script.session) {
					session.scripts.retain(|s| s != guid);
				}
				Ok((Value::Null, None))
			}
			"eternalize" => {
				let script = self.scripts.get(guid).ok_or_else(script_destroyed)?;
				if !matches!(script.state, SimScriptState::Loaded(_)) {
					return Err(Error::InvalidOperation("script is not loaded".to_string()));
				}
				let session = script.session.clone();
				self.scripts.remove(guid);
				let owner = self.sessions.get_mut(&session).map(|session| {
					session.scripts.retain(|s| s != guid);
					(session.device.clone(), session.pid)
				});
				if let Some((device, pid)) = owner {
					if let Some(process) = self
						.devices
						.get_mut(&device)
						.and_then(|d| d.processes.get_mut(&pid))
					{
						process.eternal_scripts.push(guid.to_string());
					}
				}
				tracing::debug!(script = %guid, "eternalized script");
				Ok((Value::Null, None))
			}
			"post" => {
				let PostParams { message, data } = params(p)?;
				let script = self.scripts.get(guid).ok_or_else(script_destroyed)?;
				let SimScriptState::Loaded(agent) = &script.state else {
					return Err(Error::InvalidOperation("script is not loaded".to_string()));
				};
				let work = match parse_call(&message) {
					Some(Ok(call)) => DeferredWork::Call(call),
					Some(Err(reason)) => {
						return Err(Error::Protocol(format!("malformed rpc call: {reason}")));
					}
					None => DeferredWork::Message(
						message,
						data.and_then(|d| d.as_bytes().map(<[u8]>::to_vec)),
					),
				};
				let deferred = Deferred {
					script: guid.to_string(),
					agent: Arc::clone(agent),
					work,
				};
				Ok((Value::Null, Some(deferred)))
			}
			_ => Err(unknown_method(method)),
		}
	}

	pub(crate) fn is_script_loaded(&self, guid: &str) -> bool {
		self.scripts
			.get(guid)
			.is_some_and(|s| matches!(s.state, SimScriptState::Loaded(_)))
	}

	/// Sends a `send` message from a loaded script.
	pub(crate) fn script_send(&self, guid: &str, payload: Value, data: Option<&[u8]>) -> bool {
		if !self.is_script_loaded(guid) {
			return false;
		}
		let data = data.map_or(Value::Null, |d| RpcValue::from(d).to_json());
		self.emit(
			guid,
			"message",
			json!({"message": {"type": "send", "payload": payload}, "data": data}),
		);
		true
	}

	/// Guids of live scripts, in creation order.
	pub(crate) fn script_ids(&self) -> Vec<String> {
		let mut ids: Vec<(u64, String)> = self
			.scripts
			.keys()
			.filter_map(|guid| {
				let n = guid.strip_prefix("script:")?.parse().ok()?;
				Some((n, guid.clone()))
			})
			.collect();
		ids.sort();
		ids.into_iter().map(|(_, guid)| guid).collect()
	}

	pub(crate) fn session_count(&self) -> usize {
		self.sessions.len()
	}

	/// Forgets every session and script, as when the client goes away.
	pub(crate) fn reset_client_state(&mut self) {
		self.outbound = None;
		self.stop = None;
		self.sessions.clear();
		self.scripts.clear();
	}
}
