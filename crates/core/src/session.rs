//! [`Session`]: an attachment to one process on one device.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use telco_protocol::{Crash, DetachReason, RpcValue, ScriptOptions};
use telco_runtime::{Channel, Error, EventHub, EventTarget, HandlerId, Result};

use crate::events::SessionEvent;
use crate::script::{Script, ScriptInner};
use crate::shared::Shared;

/// Attachment to a process. Detaches exactly once.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

/// The detached flag and the script list share one lock so that a script
/// created concurrently with detach is either destroyed by it or born
/// unloaded.
#[derive(Default)]
struct SessionState {
	detached: Option<DetachReason>,
	scripts: Vec<Weak<ScriptInner>>,
}

pub(crate) struct SessionInner {
	pid: u32,
	shared: Arc<Shared>,
	channel: Channel,
	state: Mutex<SessionState>,
	events: EventHub<SessionEvent>,
}

#[derive(Deserialize)]
struct DetachedParams {
	reason: DetachReason,
	#[serde(default)]
	crash: Option<Crash>,
}

#[derive(Deserialize)]
struct CreatedScript {
	script: String,
}

#[derive(Deserialize)]
struct CompiledScript {
	bytecode: RpcValue,
}

fn session_detached() -> Error {
	Error::InvalidOperation("session is detached".to_string())
}

impl Session {
	pub(crate) fn new(shared: Arc<Shared>, channel: Channel, pid: u32) -> Self {
		let events = shared.hub();
		let inner = Arc::new(SessionInner {
			pid,
			shared,
			channel,
			state: Mutex::new(SessionState::default()),
			events,
		});
		inner
			.shared
			.register(inner.channel.guid(), &inner);
		Self { inner }
	}

	pub(crate) fn inner(&self) -> &Arc<SessionInner> {
		&self.inner
	}

	pub fn pid(&self) -> u32 {
		self.inner.pid
	}

	pub fn is_detached(&self) -> bool {
		self.inner.state.lock().detached.is_some()
	}

	/// Why the session ended, once it has.
	pub fn detach_reason(&self) -> Option<DetachReason> {
		self.inner.state.lock().detached
	}

	/// Detaches from the process. Detaching twice is a no-op.
	pub fn detach(&self) -> Result<()> {
		let inner = &self.inner;
		if self.is_detached() {
			return Ok(());
		}
		let result = inner
			.shared
			.request(inner.channel.send_no_result("detach", Value::Null));
		match result {
			Ok(()) => {
				inner.mark_detached(DetachReason::ApplicationRequested, None);
				Ok(())
			}
			// lost a race with a backend-initiated detach
			Err(_) if self.is_detached() => Ok(()),
			Err(err) => Err(err),
		}
	}

	/// Resumes a session after a transport interruption.
	///
	/// # Errors
	///
	/// [`Error::InvalidOperation`] once the session is detached.
	pub fn resume(&self) -> Result<()> {
		let inner = &self.inner;
		inner.ensure_attached()?;
		inner
			.shared
			.request(inner.channel.send_no_result("resume", Value::Null))
	}

	/// Creates a script from source. The script is not loaded.
	pub fn create_script(&self, source: &str, options: ScriptOptions) -> Result<Script> {
		let params = json!({"source": source, "options": options});
		self.inner.create_script(params, options)
	}

	/// Creates a script from bytecode produced by [`compile_script`](Self::compile_script).
	pub fn create_script_from_bytes(&self, bytecode: &[u8], options: ScriptOptions) -> Result<Script> {
		let params = json!({"bytes": RpcValue::from(bytecode).to_json(), "options": options});
		self.inner.create_script(params, options)
	}

	/// Compiles `source` to bytecode without creating a script.
	pub fn compile_script(&self, source: &str, options: ScriptOptions) -> Result<Vec<u8>> {
		let inner = &self.inner;
		inner.ensure_attached()?;
		let compiled: CompiledScript = inner.shared.request(
			inner
				.channel
				.send("compileScript", json!({"source": source, "options": options})),
		)?;
		match compiled.bytecode {
			RpcValue::Bytes(bytes) => Ok(bytes),
			_ => Err(Error::Protocol("malformed bytecode reply".to_string())),
		}
	}

	/// Registers a handler for `"detached"`.
	pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId>
	where
		F: Fn(&SessionEvent) + Send + Sync + 'static,
	{
		self.inner.events.on(event, handler)
	}

	pub fn off(&self, id: HandlerId) -> bool {
		self.inner.events.off(id)
	}
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.inner.channel.guid())
			.field("pid", &self.inner.pid)
			.field("detached", &self.detach_reason())
			.finish()
	}
}

impl SessionInner {
	fn ensure_attached(&self) -> Result<()> {
		self.shared.ensure_running()?;
		if self.state.lock().detached.is_some() {
			return Err(session_detached());
		}
		Ok(())
	}

	fn create_script(&self, params: Value, options: ScriptOptions) -> Result<Script> {
		self.ensure_attached()?;
		let created: CreatedScript = self
			.shared
			.request(self.channel.send("createScript", params))?;

		let mut state = self.state.lock();
		let born_unloaded = state.detached.is_some();
		let script = Script::new(
			Arc::clone(&self.shared),
			self.channel.sibling(created.script),
			options.name,
			born_unloaded,
		);
		if !born_unloaded {
			state.scripts.retain(|s| s.strong_count() > 0);
			state.scripts.push(Arc::downgrade(script.inner()));
		}
		Ok(script)
	}

	/// Moves to DETACHED, destroying every script. Returns false if already detached.
	pub(crate) fn mark_detached(&self, reason: DetachReason, crash: Option<Crash>) -> bool {
		let scripts = {
			let mut state = self.state.lock();
			if state.detached.is_some() {
				return false;
			}
			state.detached = Some(reason);
			mem::take(&mut state.scripts)
		};
		tracing::debug!(session = %self.channel.guid(), pid = self.pid, %reason, "session detached");

		self.shared.connection.unregister_object(self.channel.guid());
		for script in scripts.iter().filter_map(Weak::upgrade) {
			script.mark_destroyed();
		}
		self.events.emit(SessionEvent::Detached { reason, crash });
		true
	}
}

impl EventTarget for SessionInner {
	fn on_event(&self, method: &str, params: Value) {
		if method != "detached" {
			tracing::debug!(session = %self.channel.guid(), method, "ignoring session event");
			return;
		}
		match serde_json::from_value::<DetachedParams>(params) {
			Ok(DetachedParams { reason, crash }) => {
				self.mark_detached(reason, crash);
			}
			Err(e) => {
				tracing::warn!(session = %self.channel.guid(), error = %e, "malformed detached event");
			}
		}
	}

	fn on_connection_lost(&self) {
		self.mark_detached(DetachReason::ConnectionTerminated, None);
	}
}
