//! JSON-RPC connection to a backend.
//!
//! This module implements request/response correlation on top of a
//! [`Transport`]. It handles:
//! - Generating unique request IDs
//! - Correlating responses with pending requests
//! - Distinguishing events from responses
//! - Dispatching events to registered objects by GUID
//! - Failing pending requests and notifying objects when the backend goes away
//!
//! # Message Flow
//!
//! 1. Caller invokes [`Connection::send_message`] with GUID, method, and params
//! 2. Connection allocates an ID and parks a oneshot sender under it
//! 3. The request is queued for the writer task
//! 4. The read loop receives the response and completes the oneshot
//! 5. Events are routed to the [`EventTarget`] registered under their GUID
//!
//! A backend may report on an object before the reply that creates it has been
//! turned into a registered target (a process exiting right after attach).
//! Such events are held per GUID and replayed, in order, when the GUID is
//! registered. The hold is bounded; the oldest GUIDs are evicted first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ErrorKind, Result};
use crate::transport::{Transport, TransportParts};

/// Receives events addressed to one GUID.
///
/// Called on the connection task; implementations must not block.
pub trait EventTarget: Send + Sync {
	fn on_event(&self, method: &str, params: Value);

	/// Called once when the backend connection ends.
	fn on_connection_lost(&self) {}
}

/// Request sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub id: u32,
	/// GUID of the target object
	pub guid: String,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

/// Failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub kind: ErrorKind,
	pub message: String,
}

impl From<&Error> for ErrorPayload {
	fn from(err: &Error) -> Self {
		Self {
			kind: err.kind(),
			message: err.to_string(),
		}
	}
}

/// Response to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	/// Request ID this response correlates to
	pub id: u32,
	/// Success result (mutually exclusive with error)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
}

impl Response {
	/// Builds a response from a handler outcome.
	pub fn from_result(id: u32, result: Result<Value>) -> Self {
		match result {
			Ok(value) => Self {
				id,
				result: Some(value),
				error: None,
			},
			Err(err) => Self {
				id,
				result: None,
				error: Some(ErrorPayload::from(&err)),
			},
		}
	}
}

/// Unsolicited message from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	/// GUID of the object that emitted the event
	pub guid: String,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl Event {
	pub fn new(guid: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
		Self {
			guid: guid.into(),
			method: method.into(),
			params,
		}
	}
}

/// Discriminated union of inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
	/// Has an `id` field
	Response(Response),
	/// Has a `guid` and `method` but no `id`
	Event(Event),
	/// Forward-compatible catch-all
	Unknown(Value),
}

/// GUIDs with held events, oldest first.
const MAX_HELD_OBJECTS: usize = 64;
/// Events held per GUID; later ones are dropped.
const MAX_HELD_EVENTS: usize = 32;

type HeldEvents = IndexMap<Arc<str>, Vec<(String, Value)>>;

type CallbackMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

type Parts = (
	Box<dyn Transport>,
	mpsc::UnboundedReceiver<Value>,
	mpsc::UnboundedReceiver<Value>,
);

/// Removes the pending callback if the response future is dropped early.
struct CancelGuard {
	id: u32,
	callbacks: CallbackMap,
	completed: bool,
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if !self.completed && self.callbacks.lock().remove(&self.id).is_some() {
			tracing::debug!(id = self.id, "removed orphaned callback");
		}
	}
}

struct ResponseFuture {
	rx: oneshot::Receiver<Result<Value>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.completed = true;
				Poll::Ready(result.map_err(|_| Error::connection_closed()).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Client end of the control connection.
pub struct Connection {
	last_id: AtomicU32,
	callbacks: CallbackMap,
	outbound_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
	parts: Mutex<Option<Parts>>,
	objects: DashMap<Arc<str>, Weak<dyn EventTarget>>,
	/// Events for GUIDs not registered yet. Also serializes the
	/// lookup-or-hold decision against registration.
	held: Mutex<HeldEvents>,
	closed: AtomicBool,
}

impl Connection {
	pub fn new(parts: TransportParts) -> Arc<Self> {
		let TransportParts { sender, message_rx } = parts;
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		Arc::new(Self {
			last_id: AtomicU32::new(1),
			callbacks: Arc::new(Mutex::new(HashMap::new())),
			outbound_tx: Mutex::new(Some(outbound_tx)),
			parts: Mutex::new(Some((sender, message_rx, outbound_rx))),
			objects: DashMap::new(),
			held: Mutex::new(IndexMap::new()),
			closed: AtomicBool::new(false),
		})
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Sends a request and waits for its response.
	///
	/// # Errors
	///
	/// Returns the backend's error, or [`Error::Transport`] if the connection
	/// is closed before the response arrives.
	pub async fn send_message(&self, guid: &str, method: &str, params: Value) -> Result<Value> {
		if self.is_closed() {
			return Err(Error::connection_closed());
		}

		let id = self.last_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		self.callbacks.lock().insert(id, tx);
		let guard = CancelGuard {
			id,
			callbacks: Arc::clone(&self.callbacks),
			completed: false,
		};

		// close() drains callbacks after raising the flag; re-check so a
		// request registered after the drain does not wait forever.
		if self.is_closed() {
			return Err(Error::connection_closed());
		}

		let request = serde_json::to_value(Request {
			id,
			guid: guid.to_string(),
			method: method.to_string(),
			params,
		})?;
		tracing::debug!(id, guid, method, "sending request");

		let queued = match self.outbound_tx.lock().as_ref() {
			Some(tx) => tx.send(request).is_ok(),
			None => false,
		};
		if !queued {
			tracing::debug!(id, "outbound channel closed");
			return Err(Error::connection_closed());
		}

		ResponseFuture { rx, guard }.await
	}

	/// Routes events for `guid` to `target` while it is alive.
	///
	/// Events that arrived for `guid` before this call are delivered first, on
	/// the calling thread, in arrival order.
	pub fn register_object(&self, guid: &str, target: Weak<dyn EventTarget>) {
		loop {
			let early = {
				let mut held = self.held.lock();
				match held.shift_remove(guid) {
					Some(early) => early,
					None => {
						self.objects.insert(Arc::from(guid), target);
						return;
					}
				}
			};
			let Some(live) = target.upgrade() else {
				return;
			};
			tracing::debug!(guid, count = early.len(), "replaying early events");
			for (method, params) in early {
				live.on_event(&method, params);
			}
		}
	}

	pub fn unregister_object(&self, guid: &str) {
		self.objects.remove(guid);
	}

	/// Drives the connection until the backend goes away.
	///
	/// Only the first call does anything.
	pub async fn run(self: Arc<Self>) {
		let Some((mut sender, mut message_rx, mut outbound_rx)) = self.parts.lock().take() else {
			tracing::warn!("connection is already running");
			return;
		};

		let writer = tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				if let Err(e) = sender.send(message).await {
					tracing::error!(error = %e, "transport write error");
					break;
				}
			}
		});

		while let Some(value) = message_rx.recv().await {
			match serde_json::from_value::<Message>(value) {
				Ok(message) => self.dispatch(message),
				Err(e) => tracing::error!(error = %e, "failed to parse message"),
			}
		}

		tracing::debug!("backend closed the connection");
		self.shut_down();
		let _ = writer.await;

		let targets: Vec<Arc<dyn EventTarget>> = self
			.objects
			.iter()
			.filter_map(|entry| entry.value().upgrade())
			.collect();
		self.objects.clear();
		self.held.lock().clear();
		for target in targets {
			target.on_connection_lost();
		}
	}

	/// Stops sending and fails every pending request.
	///
	/// The backend observes end-of-stream; [`run`](Self::run) then winds down.
	pub fn close(&self) {
		self.shut_down();
	}

	fn shut_down(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.outbound_tx.lock().take();

		let pending: Vec<_> = self.callbacks.lock().drain().collect();
		if !pending.is_empty() {
			tracing::debug!(count = pending.len(), "failing pending requests");
		}
		for (_, callback) in pending {
			let _ = callback.send(Err(Error::connection_closed()));
		}
	}

	pub(crate) fn dispatch(&self, message: Message) {
		match message {
			Message::Response(response) => {
				let Some(callback) = self.callbacks.lock().remove(&response.id) else {
					tracing::warn!(id = response.id, "response for unknown request");
					return;
				};
				let result = match response.error {
					Some(error) => Err(Error::new(error.kind, error.message)),
					None => Ok(response.result.unwrap_or(Value::Null)),
				};
				let _ = callback.send(result);
			}
			Message::Event(event) => self.dispatch_event(event),
			Message::Unknown(value) => {
				tracing::debug!(%value, "unknown message type");
			}
		}
	}

	fn dispatch_event(&self, event: Event) {
		let target = {
			let mut held = self.held.lock();
			let target = self
				.objects
				.get(event.guid.as_str())
				.map(|entry| entry.value().clone());
			match target {
				Some(target) => target,
				None => {
					hold(&mut held, event);
					return;
				}
			}
		};
		match target.upgrade() {
			Some(target) => target.on_event(&event.method, event.params),
			None => {
				self.objects.remove(event.guid.as_str());
				tracing::debug!(
					guid = %event.guid,
					method = %event.method,
					"event for dropped object"
				);
			}
		}
	}
}

fn hold(held: &mut HeldEvents, event: Event) {
	let Event {
		guid,
		method,
		params,
	} = event;
	if let Some(early) = held.get_mut(guid.as_str()) {
		if early.len() < MAX_HELD_EVENTS {
			early.push((method, params));
		} else {
			tracing::debug!(%guid, %method, "dropping event for unknown object");
		}
		return;
	}
	if held.len() >= MAX_HELD_OBJECTS {
		if let Some((evicted, _)) = held.shift_remove_index(0) {
			tracing::debug!(guid = %evicted, "evicting events for unknown object");
		}
	}
	tracing::debug!(%guid, %method, "holding event for unknown object");
	held.insert(Arc::from(guid.as_str()), vec![(method, params)]);
}
