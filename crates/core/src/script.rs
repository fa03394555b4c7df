//! [`Script`]: an instrumentation payload bound to a session.
//!
//! A script moves CREATED → LOADED → UNLOADED and never goes back. While
//! loaded it carries the RPC bridge: a table of pending calls keyed by
//! request id. Replies are matched on the connection task; everything else
//! the script sends is emitted as a `message` event.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use telco_protocol::{ExportSignature, RpcReply, RpcValue, ScriptMessage, call_payload, parse_reply};
use telco_runtime::{Channel, Error, EventHub, EventTarget, HandlerId, Result};
use tokio::sync::oneshot;

use crate::events::ScriptEvent;
use crate::exports::{ExportTable, Exports, ExportsSync};
use crate::shared::Shared;

/// Lifecycle state of a [`Script`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
	Created,
	Loaded,
	Unloaded,
}

type PendingReply = oneshot::Sender<Result<RpcValue>>;

struct Bridge {
	exports: Arc<ExportTable>,
	pending: HashMap<u64, PendingReply>,
}

enum Lifecycle {
	Created,
	/// `load` is in flight
	Loading,
	Loaded(Bridge),
	Unloaded,
}

/// A script created through [`Session::create_script`](crate::Session::create_script).
#[derive(Clone)]
pub struct Script {
	inner: Arc<ScriptInner>,
}

pub(crate) struct ScriptInner {
	shared: Arc<Shared>,
	channel: Channel,
	name: Option<String>,
	state: Mutex<Lifecycle>,
	next_call_id: AtomicU64,
	events: EventHub<ScriptEvent>,
}

fn script_destroyed() -> Error {
	Error::InvalidOperation("script is destroyed".to_string())
}

fn script_not_loaded() -> Error {
	Error::InvalidOperation("script is not loaded".to_string())
}

#[derive(Deserialize)]
struct LoadReply {
	#[serde(default)]
	exports: Vec<ExportSignature>,
}

#[derive(Deserialize)]
struct MessageParams {
	message: ScriptMessage,
	#[serde(default)]
	data: Option<RpcValue>,
}

impl Script {
	/// A script born after its session detached starts out unloaded and is
	/// never routed any events.
	pub(crate) fn new(
		shared: Arc<Shared>,
		channel: Channel,
		name: Option<String>,
		born_unloaded: bool,
	) -> Self {
		let events = shared.hub();
		let state = if born_unloaded {
			Lifecycle::Unloaded
		} else {
			Lifecycle::Created
		};
		let inner = Arc::new(ScriptInner {
			shared,
			channel,
			name,
			state: Mutex::new(state),
			next_call_id: AtomicU64::new(1),
			events,
		});
		if !born_unloaded {
			inner
				.shared
				.register(inner.channel.guid(), &inner);
		}
		Self { inner }
	}

	pub(crate) fn inner(&self) -> &Arc<ScriptInner> {
		&self.inner
	}

	/// Backend object id.
	pub fn id(&self) -> &str {
		self.inner.channel.guid()
	}

	/// Name given through [`ScriptOptions`](crate::ScriptOptions).
	pub fn name(&self) -> Option<&str> {
		self.inner.name.as_deref()
	}

	pub fn state(&self) -> ScriptState {
		match &*self.inner.state.lock() {
			Lifecycle::Created | Lifecycle::Loading => ScriptState::Created,
			Lifecycle::Loaded(_) => ScriptState::Loaded,
			Lifecycle::Unloaded => ScriptState::Unloaded,
		}
	}

	pub fn is_destroyed(&self) -> bool {
		self.state() == ScriptState::Unloaded
	}

	/// Loads the script and negotiates its exports.
	///
	/// # Errors
	///
	/// - [`Error::InvalidOperation`] unless the script is freshly created
	/// - [`Error::Protocol`] if its bytecode is malformed
	/// - [`Error::Transport`] if the backend connection fails
	pub fn load(&self) -> Result<()> {
		let inner = &self.inner;
		inner.shared.ensure_running()?;
		{
			let mut state = inner.state.lock();
			match *state {
				Lifecycle::Created => *state = Lifecycle::Loading,
				Lifecycle::Loading => {
					return Err(Error::InvalidOperation("script is being loaded".to_string()));
				}
				Lifecycle::Loaded(_) => {
					return Err(Error::InvalidOperation("script is already loaded".to_string()));
				}
				Lifecycle::Unloaded => return Err(script_destroyed()),
			}
		}

		let result: Result<LoadReply> = inner.shared.request(inner.channel.send_no_params("load"));

		let mut state = inner.state.lock();
		match result {
			Ok(reply) => {
				if !matches!(*state, Lifecycle::Loading) {
					return Err(script_destroyed());
				}
				tracing::debug!(script = %inner.channel.guid(), exports = reply.exports.len(), "script loaded");
				*state = Lifecycle::Loaded(Bridge {
					exports: Arc::new(ExportTable::new(reply.exports)),
					pending: HashMap::new(),
				});
				Ok(())
			}
			Err(err) => {
				if matches!(*state, Lifecycle::Loading) {
					*state = Lifecycle::Created;
				}
				Err(err)
			}
		}
	}

	/// Unloads the script. In-flight calls fail with "script is destroyed".
	pub fn unload(&self) -> Result<()> {
		let inner = &self.inner;
		if matches!(*inner.state.lock(), Lifecycle::Unloaded) {
			return Err(script_destroyed());
		}
		inner
			.shared
			.request(inner.channel.send_no_result("unload", Value::Null))?;
		inner.mark_destroyed();
		Ok(())
	}

	/// Leaves the loaded script running in the process after this handle,
	/// and the session, go away. The handle is destroyed.
	pub fn eternalize(&self) -> Result<()> {
		let inner = &self.inner;
		inner.ensure_loaded()?;
		inner
			.shared
			.request(inner.channel.send_no_result("eternalize", Value::Null))?;
		tracing::debug!(script = %inner.channel.guid(), "script eternalized");
		inner.mark_destroyed();
		Ok(())
	}

	/// Posts a JSON message, with optional binary data, to the loaded script.
	pub fn post(&self, message: Value, data: Option<&[u8]>) -> Result<()> {
		let inner = &self.inner;
		inner.ensure_loaded()?;
		let data = data.map_or(Value::Null, |d| RpcValue::from(d).to_json());
		inner.shared.request(
			inner
				.channel
				.send_no_result("post", json!({"message": message, "data": data})),
		)
	}

	/// Async exports of the loaded script.
	pub fn exports(&self) -> Result<Exports> {
		let table = self.inner.export_table()?;
		Ok(Exports::new(self.clone(), table))
	}

	/// Blocking exports of the loaded script.
	pub fn exports_sync(&self) -> Result<ExportsSync> {
		self.exports().map(ExportsSync::new)
	}

	/// Registers a handler for `"message"` or `"destroyed"`.
	pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId>
	where
		F: Fn(&ScriptEvent) + Send + Sync + 'static,
	{
		self.inner.events.on(event, handler)
	}

	pub fn off(&self, id: HandlerId) -> bool {
		self.inner.events.off(id)
	}
}

impl fmt::Debug for Script {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Script")
			.field("id", &self.id())
			.field("name", &self.name())
			.field("state", &self.state())
			.finish()
	}
}

/// Removes a pending entry when its call returns or is dropped.
struct PendingCall<'a> {
	script: &'a ScriptInner,
	id: u64,
}

impl Drop for PendingCall<'_> {
	fn drop(&mut self) {
		if let Lifecycle::Loaded(bridge) = &mut *self.script.state.lock() {
			bridge.pending.remove(&self.id);
		}
	}
}

impl ScriptInner {
	pub(crate) fn shared(&self) -> &Shared {
		&self.shared
	}

	fn ensure_loaded(&self) -> Result<()> {
		self.shared.ensure_running()?;
		match &*self.state.lock() {
			Lifecycle::Loaded(_) => Ok(()),
			Lifecycle::Unloaded => Err(script_destroyed()),
			Lifecycle::Created | Lifecycle::Loading => Err(script_not_loaded()),
		}
	}

	fn export_table(&self) -> Result<Arc<ExportTable>> {
		match &*self.state.lock() {
			Lifecycle::Loaded(bridge) => Ok(Arc::clone(&bridge.exports)),
			Lifecycle::Unloaded => Err(script_destroyed()),
			Lifecycle::Created | Lifecycle::Loading => Err(script_not_loaded()),
		}
	}

	pub(crate) async fn call(&self, name: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
		self.shared.ensure_running()?;
		let (id, method, rx) = {
			let mut state = self.state.lock();
			let bridge = match &mut *state {
				Lifecycle::Loaded(bridge) => bridge,
				Lifecycle::Unloaded => return Err(script_destroyed()),
				Lifecycle::Created | Lifecycle::Loading => return Err(script_not_loaded()),
			};
			let method = bridge.exports.resolve(name, args.len())?.name.clone();
			let id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
			let (tx, rx) = oneshot::channel();
			bridge.pending.insert(id, tx);
			(id, method, rx)
		};
		let _pending = PendingCall { script: self, id };

		tracing::debug!(script = %self.channel.guid(), id, %method, "rpc call");
		let message = call_payload(id, &method, &args);
		self.channel
			.send_no_result("post", json!({"message": message, "data": null}))
			.await
			.map_err(|err| self.shared.translate(err))?;

		match tokio::time::timeout(self.shared.options.rpc_timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(script_destroyed()),
			Err(_) => Err(Error::TimedOut("timeout was reached".to_string())),
		}
	}

	fn resolve_reply(&self, reply: RpcReply) {
		let (id, outcome) = match reply {
			RpcReply::Ok { id, value } => (id, Ok(value)),
			RpcReply::Error { id, message } => (id, Err(Error::Rpc(message))),
			RpcReply::Malformed { id: Some(id), reason } => (
				id,
				Err(Error::Protocol(format!("malformed rpc reply: {reason}"))),
			),
			RpcReply::Malformed { id: None, reason } => {
				tracing::warn!(script = %self.channel.guid(), %reason, "dropping malformed rpc reply");
				return;
			}
		};

		let sender = match &mut *self.state.lock() {
			Lifecycle::Loaded(bridge) => bridge.pending.remove(&id),
			_ => None,
		};
		match sender {
			Some(tx) => {
				let _ = tx.send(outcome);
			}
			None => tracing::warn!(script = %self.channel.guid(), id, "rpc reply for unknown request"),
		}
	}

	/// Moves to UNLOADED, failing pending calls. Returns false if already there.
	pub(crate) fn mark_destroyed(&self) -> bool {
		let pending = match mem::replace(&mut *self.state.lock(), Lifecycle::Unloaded) {
			Lifecycle::Unloaded => return false,
			Lifecycle::Loaded(bridge) => bridge.pending,
			Lifecycle::Created | Lifecycle::Loading => HashMap::new(),
		};
		if !pending.is_empty() {
			tracing::debug!(script = %self.channel.guid(), count = pending.len(), "failing in-flight rpc calls");
		}
		for (_, tx) in pending {
			let _ = tx.send(Err(script_destroyed()));
		}
		self.shared.connection.unregister_object(self.channel.guid());
		self.events.emit(ScriptEvent::Destroyed);
		true
	}
}

impl EventTarget for ScriptInner {
	fn on_event(&self, method: &str, params: Value) {
		if method != "message" {
			tracing::debug!(script = %self.channel.guid(), method, "ignoring script event");
			return;
		}
		let MessageParams { message, data } = match serde_json::from_value(params) {
			Ok(params) => params,
			Err(e) => {
				tracing::warn!(script = %self.channel.guid(), error = %e, "malformed script message");
				return;
			}
		};

		if let ScriptMessage::Send { payload } = &message {
			if let Some(reply) = parse_reply(payload) {
				self.resolve_reply(reply);
				return;
			}
		}

		let data = data.and_then(|d| match d {
			RpcValue::Bytes(bytes) => Some(bytes),
			_ => None,
		});
		self.events.emit(ScriptEvent::Message { message, data });
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use telco_protocol::{reply_error, reply_ok};
	use telco_runtime::{ChannelTransport, Cancellable, Connection, Context};

	use crate::options::ManagerOptions;

	fn loaded_script() -> Script {
		let (client, _server) = ChannelTransport::pair();
		let connection = Connection::new(client);
		let shared = Arc::new(Shared {
			ctx: Context::new(1).unwrap(),
			connection: Arc::clone(&connection),
			options: ManagerOptions::default(),
			shutdown: Cancellable::new(),
		});
		let script = Script::new(shared, Channel::new("script:1", connection), None, false);
		*script.inner.state.lock() = Lifecycle::Loaded(Bridge {
			exports: Arc::new(ExportTable::new([ExportSignature::with_arity("ping", 0)])),
			pending: HashMap::new(),
		});
		script
	}

	fn pend(script: &Script, id: u64) -> oneshot::Receiver<Result<RpcValue>> {
		let (tx, rx) = oneshot::channel();
		if let Lifecycle::Loaded(bridge) = &mut *script.inner.state.lock() {
			bridge.pending.insert(id, tx);
		}
		rx
	}

	fn send(payload: Value) -> Value {
		json!({"message": {"type": "send", "payload": payload}, "data": null})
	}

	#[test]
	fn replies_resolve_pending_calls_by_id() {
		let script = loaded_script();
		let mut first = pend(&script, 1);
		let mut second = pend(&script, 2);

		script.inner.on_event("message", send(reply_error(2, "Boom")));
		script.inner.on_event("message", send(reply_ok(1, &RpcValue::from("pong"))));

		assert_eq!(first.try_recv().unwrap(), Ok(RpcValue::from("pong")));
		assert_eq!(second.try_recv().unwrap(), Err(Error::Rpc("Boom".to_string())));
	}

	#[test]
	fn malformed_reply_fails_the_call() {
		let script = loaded_script();
		let mut rx = pend(&script, 7);
		script
			.inner
			.on_event("message", send(json!(["telco:rpc", 7, "bogus"])));
		let err = rx.try_recv().unwrap().unwrap_err();
		assert!(matches!(err, Error::Protocol(_)));
	}

	#[test]
	fn destroy_fails_pending_and_is_one_shot() {
		let script = loaded_script();
		let mut rx = pend(&script, 3);

		assert!(script.inner.mark_destroyed());
		assert!(!script.inner.mark_destroyed());
		assert_eq!(rx.try_recv().unwrap(), Err(script_destroyed()));
		assert_eq!(script.state(), ScriptState::Unloaded);
		assert!(matches!(script.exports(), Err(Error::InvalidOperation(_))));
	}

	#[test]
	fn exports_require_a_loaded_script() {
		let script = loaded_script();
		*script.inner.state.lock() = Lifecycle::Created;
		let err = script.exports().err().unwrap();
		assert_eq!(err.to_string(), "script is not loaded");
	}
}
