//! Cooperative cancellation token.
//!
//! A [`Cancellable`] moves one way, from armed to cancelled. Clones share
//! identity: cancelling any clone cancels all of them. The flag and the
//! wakeups come from a [`CancellationToken`]; this type adds
//! connect/disconnect callbacks and a per-thread stack of current tokens.

use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{HandlerId, next_handler_id};

type Callback = Box<dyn FnOnce() + Send>;

struct Inner {
	token: CancellationToken,
	/// Held while the token flips so `connect` never misses a cancel.
	callbacks: Mutex<IndexMap<HandlerId, Callback>>,
}

/// Thread-safe, idempotent cancellation token.
#[derive(Clone)]
pub struct Cancellable {
	inner: Arc<Inner>,
}

thread_local! {
	static CURRENT: RefCell<Vec<Cancellable>> = const { RefCell::new(Vec::new()) };
}

impl Cancellable {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				token: CancellationToken::new(),
				callbacks: Mutex::new(IndexMap::new()),
			}),
		}
	}

	/// Cancels the token, waking every waiter and running connected callbacks.
	///
	/// Calling this more than once has no further effect.
	pub fn cancel(&self) {
		let callbacks = {
			let mut guard = self.inner.callbacks.lock();
			if self.inner.token.is_cancelled() {
				return;
			}
			self.inner.token.cancel();
			std::mem::take(&mut *guard)
		};

		tracing::debug!(callbacks = callbacks.len(), "cancellable fired");

		for (id, callback) in callbacks {
			if catch_unwind(AssertUnwindSafe(callback)).is_err() {
				tracing::error!(handler_id = id, "cancellation callback panicked");
			}
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.token.is_cancelled()
	}

	/// Fails with [`Error::Cancelled`] once the token has been cancelled.
	///
	/// # Errors
	///
	/// Returns [`Error::Cancelled`] if [`cancel`](Self::cancel) was called.
	pub fn raise_if_cancelled(&self) -> Result<()> {
		if self.is_cancelled() {
			Err(Error::Cancelled)
		} else {
			Ok(())
		}
	}

	/// Registers a callback that runs once when the token is cancelled.
	///
	/// If the token is already cancelled the callback runs immediately on the
	/// calling thread.
	pub fn connect<F>(&self, callback: F) -> HandlerId
	where
		F: FnOnce() + Send + 'static,
	{
		let id = next_handler_id();
		{
			let mut guard = self.inner.callbacks.lock();
			if !self.is_cancelled() {
				guard.insert(id, Box::new(callback));
				return id;
			}
		}
		callback();
		id
	}

	/// Removes a callback registered with [`connect`](Self::connect).
	///
	/// Returns `false` if the callback already ran or was never registered.
	pub fn disconnect(&self, id: HandlerId) -> bool {
		self.inner.callbacks.lock().shift_remove(&id).is_some()
	}

	/// Resolves once the token is cancelled, including when that happened
	/// before the first poll.
	pub async fn cancelled(&self) {
		self.inner.token.cancelled().await;
	}

	/// A token cancelled together with this one, for handing to spawned tasks.
	///
	/// Cancelling the child does not cancel this token or run its callbacks.
	pub fn child_token(&self) -> CancellationToken {
		self.inner.token.child_token()
	}

	/// Makes this token the current one for the calling thread.
	pub fn push_current(&self) {
		CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
	}

	/// Undoes the matching [`push_current`](Self::push_current).
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidOperation`] if this token is not on top of the
	/// calling thread's stack.
	pub fn pop_current(&self) -> Result<()> {
		CURRENT.with(|stack| {
			let mut stack = stack.borrow_mut();
			match stack.last() {
				Some(top) if top == self => {
					stack.pop();
					Ok(())
				}
				_ => Err(Error::InvalidOperation(
					"cancellable is not on top of the stack".to_string(),
				)),
			}
		})
	}

	/// Returns the calling thread's current token, if any.
	pub fn current() -> Option<Cancellable> {
		CURRENT.with(|stack| stack.borrow().last().cloned())
	}

	/// Picks an explicit token, falling back to the thread's current one.
	pub fn resolve(explicit: Option<&Cancellable>) -> Option<Cancellable> {
		explicit.cloned().or_else(Cancellable::current)
	}
}

/// Waits on an optional token; never resolves for `None`.
pub async fn cancelled(cancellable: Option<&Cancellable>) {
	match cancellable {
		Some(cancellable) => cancellable.cancelled().await,
		None => std::future::pending().await,
	}
}

impl Default for Cancellable {
	fn default() -> Self {
		Self::new()
	}
}

impl PartialEq for Cancellable {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Cancellable {}

impl fmt::Debug for Cancellable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Cancellable")
			.field("cancelled", &self.is_cancelled())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[test]
	fn cancel_is_idempotent() {
		let cancellable = Cancellable::new();
		let hits = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&hits);
		cancellable.connect(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});

		assert!(cancellable.raise_if_cancelled().is_ok());
		cancellable.cancel();
		cancellable.cancel();

		assert!(cancellable.is_cancelled());
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert_eq!(cancellable.raise_if_cancelled(), Err(Error::Cancelled));
	}

	#[test]
	fn clones_share_identity() {
		let a = Cancellable::new();
		let b = a.clone();
		b.cancel();
		assert!(a.is_cancelled());
		assert_eq!(a, b);
		assert_ne!(a, Cancellable::new());
	}

	#[test]
	fn connect_after_cancel_runs_immediately() {
		let cancellable = Cancellable::new();
		cancellable.cancel();
		let hits = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&hits);
		let id = cancellable.connect(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert!(!cancellable.disconnect(id));
	}

	#[test]
	fn disconnected_callbacks_do_not_run() {
		let cancellable = Cancellable::new();
		let hits = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&hits);
		let id = cancellable.connect(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		assert!(cancellable.disconnect(id));
		cancellable.cancel();
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn panicking_callback_does_not_block_others() {
		let cancellable = Cancellable::new();
		let hits = Arc::new(AtomicUsize::new(0));
		cancellable.connect(|| panic!("boom"));
		let counter = Arc::clone(&hits);
		cancellable.connect(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		cancellable.cancel();
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn current_stack_is_per_thread() {
		let outer = Cancellable::new();
		let inner = Cancellable::new();
		outer.push_current();
		inner.push_current();

		assert_eq!(Cancellable::current(), Some(inner.clone()));
		assert!(outer.pop_current().is_err());
		inner.pop_current().unwrap();
		assert_eq!(Cancellable::resolve(None), Some(outer.clone()));

		std::thread::spawn(|| assert!(Cancellable::current().is_none()))
			.join()
			.unwrap();

		outer.pop_current().unwrap();
		assert!(Cancellable::current().is_none());
	}

	#[tokio::test]
	async fn cancelled_wakes_waiters() {
		let cancellable = Cancellable::new();
		let waiter = {
			let cancellable = cancellable.clone();
			tokio::spawn(async move { cancellable.cancelled().await })
		};

		tokio::time::sleep(Duration::from_millis(20)).await;
		cancellable.cancel();

		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("waiter should wake")
			.unwrap();
	}

	#[tokio::test]
	async fn child_tokens_follow_the_parent_only() {
		let cancellable = Cancellable::new();
		let child = cancellable.child_token();
		child.cancel();
		assert!(!cancellable.is_cancelled());

		let child = cancellable.child_token();
		cancellable.cancel();
		tokio::time::timeout(Duration::from_millis(100), child.cancelled())
			.await
			.expect("child should follow parent");
	}

	#[test]
	fn cancel_racing_connect_runs_every_callback_once() {
		for _ in 0..100 {
			let cancellable = Cancellable::new();
			let hits = Arc::new(AtomicUsize::new(0));
			let canceller = {
				let cancellable = cancellable.clone();
				std::thread::spawn(move || cancellable.cancel())
			};
			for _ in 0..8 {
				let counter = Arc::clone(&hits);
				cancellable.connect(move || {
					counter.fetch_add(1, Ordering::SeqCst);
				});
			}
			canceller.join().unwrap();
			assert_eq!(hits.load(Ordering::SeqCst), 8);
		}
	}

	#[tokio::test]
	async fn cancelled_returns_immediately_when_already_cancelled() {
		let cancellable = Cancellable::new();
		cancellable.cancel();
		tokio::time::timeout(Duration::from_millis(100), cancellable.cancelled())
			.await
			.expect("should not wait");
	}
}
