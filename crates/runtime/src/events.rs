//! Typed event hubs.
//!
//! Every observable entity owns an [`EventHub`] over its own event enum.
//! User handlers are registered by event name and run on the context's
//! delivery thread, never on the thread that produced the event. Internal
//! waiters use [`EventHub::subscribe`] instead, which is a broadcast stream
//! consumed inside the runtime.
//!
//! # Example
//!
//! ```ignore
//! let id = device.on("process-crashed", |event| println!("{event:?}"))?;
//! device.off(id);
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::context::Dispatcher;
use crate::error::{Error, Result};

/// Unique identifier for registered handlers and callbacks.
pub type HandlerId = u64;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a new globally-unique handler ID.
pub fn next_handler_id() -> HandlerId {
	NEXT_HANDLER_ID.fetch_add(1, Ordering::SeqCst)
}

/// An event enum that can be routed by name.
pub trait EventKind: Clone + Send + Sync + 'static {
	/// Every name [`name`](Self::name) can return.
	const NAMES: &'static [&'static str];

	/// Conventional event name, e.g. `"detached"`.
	fn name(&self) -> &'static str;
}

type HandlerFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct HandlerEntry<E> {
	/// `None` matches every event
	name: Option<&'static str>,
	handler: HandlerFn<E>,
}

/// Handler registry plus broadcast channel for one entity.
pub struct EventHub<E: EventKind> {
	handlers: Mutex<IndexMap<HandlerId, HandlerEntry<E>>>,
	tx: broadcast::Sender<E>,
	dispatcher: Dispatcher,
}

impl<E: EventKind> EventHub<E> {
	pub fn new(dispatcher: Dispatcher, capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity.max(1));
		Self {
			handlers: Mutex::new(IndexMap::new()),
			tx,
			dispatcher,
		}
	}

	/// Registers a handler for events named `name`.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidArgument`] if the entity never emits `name`.
	pub fn on<F>(&self, name: &str, handler: F) -> Result<HandlerId>
	where
		F: Fn(&E) + Send + Sync + 'static,
	{
		let Some(name) = E::NAMES.iter().copied().find(|known| *known == name) else {
			return Err(Error::InvalidArgument(format!("unknown event '{name}'")));
		};
		Ok(self.insert(Some(name), Arc::new(handler)))
	}

	/// Registers a handler for every event.
	pub fn on_any<F>(&self, handler: F) -> HandlerId
	where
		F: Fn(&E) + Send + Sync + 'static,
	{
		self.insert(None, Arc::new(handler))
	}

	/// Removes a handler. Returns `false` if it was not registered.
	pub fn off(&self, id: HandlerId) -> bool {
		self.handlers.lock().shift_remove(&id).is_some()
	}

	/// Number of registered handlers.
	pub fn handler_count(&self) -> usize {
		self.handlers.lock().len()
	}

	/// Subscribes to the raw event stream.
	pub fn subscribe(&self) -> broadcast::Receiver<E> {
		self.tx.subscribe()
	}

	/// Publishes an event to subscribers and queues handler delivery.
	///
	/// Handlers registered after this call do not see the event.
	pub fn emit(&self, event: E) {
		let name = event.name();
		let handlers: Vec<HandlerFn<E>> = self
			.handlers
			.lock()
			.values()
			.filter(|entry| entry.name.is_none_or(|n| n == name))
			.map(|entry| Arc::clone(&entry.handler))
			.collect();

		tracing::debug!(event = name, handlers = handlers.len(), "emit");
		let _ = self.tx.send(event.clone());

		if handlers.is_empty() {
			return;
		}
		self.dispatcher.dispatch(move || {
			for handler in handlers {
				if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
					tracing::error!(event = name, "event handler panicked");
				}
			}
		});
	}

	fn insert(&self, name: Option<&'static str>, handler: HandlerFn<E>) -> HandlerId {
		let id = next_handler_id();
		self.handlers.lock().insert(id, HandlerEntry { name, handler });
		id
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Clone, PartialEq)]
	enum TestEvent {
		Ping(u32),
		Pong,
	}

	impl EventKind for TestEvent {
		const NAMES: &'static [&'static str] = &["ping", "pong"];

		fn name(&self) -> &'static str {
			match self {
				TestEvent::Ping(_) => "ping",
				TestEvent::Pong => "pong",
			}
		}
	}

	fn hub() -> (EventHub<TestEvent>, Dispatcher) {
		let dispatcher = Dispatcher::spawn().unwrap();
		(EventHub::new(dispatcher.clone(), 16), dispatcher)
	}

	#[test]
	fn handlers_run_in_registration_order() {
		let (hub, dispatcher) = hub();
		let seen = Arc::new(Mutex::new(Vec::new()));
		for tag in ["a", "b", "c"] {
			let seen = Arc::clone(&seen);
			hub.on("ping", move |event| {
				if let TestEvent::Ping(n) = event {
					seen.lock().push(format!("{tag}{n}"));
				}
			})
			.unwrap();
		}

		hub.emit(TestEvent::Ping(1));
		hub.emit(TestEvent::Pong);
		hub.emit(TestEvent::Ping(2));
		dispatcher.flush();

		assert_eq!(*seen.lock(), ["a1", "b1", "c1", "a2", "b2", "c2"]);
	}

	#[test]
	fn unknown_names_are_rejected() {
		let (hub, _) = hub();
		let err = hub.on("nope", |_| {}).unwrap_err();
		assert_eq!(err.to_string(), "unknown event 'nope'");
	}

	#[test]
	fn off_removes_handler() {
		let (hub, dispatcher) = hub();
		let hits = Arc::new(AtomicU64::new(0));
		let counter = Arc::clone(&hits);
		let id = hub.on_any(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});

		hub.emit(TestEvent::Pong);
		assert!(hub.off(id));
		assert!(!hub.off(id));
		hub.emit(TestEvent::Pong);
		dispatcher.flush();

		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert_eq!(hub.handler_count(), 0);
	}

	#[test]
	fn panicking_handler_does_not_stop_delivery() {
		let (hub, dispatcher) = hub();
		let hits = Arc::new(AtomicU64::new(0));
		hub.on("pong", |_| panic!("handler failure")).unwrap();
		let counter = Arc::clone(&hits);
		hub.on("pong", move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();

		hub.emit(TestEvent::Pong);
		dispatcher.flush();
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn handlers_run_off_the_emitting_thread() {
		let (hub, dispatcher) = hub();
		let on_delivery = Arc::new(Mutex::new(None));
		let slot = Arc::clone(&on_delivery);
		hub.on("ping", move |_| {
			*slot.lock() = Some(Dispatcher::is_delivery_thread());
		})
		.unwrap();

		hub.emit(TestEvent::Ping(0));
		dispatcher.flush();
		assert_eq!(*on_delivery.lock(), Some(true));
	}

	#[tokio::test]
	async fn subscribers_see_every_event() {
		let (hub, _) = hub();
		let mut rx = hub.subscribe();
		hub.emit(TestEvent::Ping(7));
		hub.emit(TestEvent::Pong);
		assert_eq!(rx.recv().await.unwrap(), TestEvent::Ping(7));
		assert_eq!(rx.recv().await.unwrap(), TestEvent::Pong);
	}
}
