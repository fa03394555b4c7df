//! Background execution context.
//!
//! A [`Context`] owns the tokio runtime that drives the connection and the
//! backend, plus a dedicated delivery thread for user event handlers. The
//! caller-facing API blocks on the runtime through [`Context::run`], which
//! also races the operation against a [`Cancellable`].

use std::cell::Cell;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancellable::{self, Cancellable};
use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send>;

thread_local! {
	static ON_DELIVERY_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Queue feeding the event delivery thread.
///
/// Jobs run one at a time in submission order. The thread exits once every
/// clone of the dispatcher is dropped.
#[derive(Clone)]
pub struct Dispatcher {
	tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
	/// Starts a delivery thread.
	///
	/// # Errors
	///
	/// Returns [`Error::Transport`] if the OS refuses to create the thread.
	pub fn spawn() -> Result<Self> {
		let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
		std::thread::Builder::new()
			.name("telco-events".to_string())
			.spawn(move || {
				ON_DELIVERY_THREAD.with(|flag| flag.set(true));
				while let Some(job) = rx.blocking_recv() {
					if catch_unwind(AssertUnwindSafe(job)).is_err() {
						tracing::error!("event delivery job panicked");
					}
				}
				tracing::debug!("event delivery thread exiting");
			})?;
		Ok(Self { tx })
	}

	/// Queues a job for the delivery thread.
	pub fn dispatch<F>(&self, job: F)
	where
		F: FnOnce() + Send + 'static,
	{
		if self.tx.send(Box::new(job)).is_err() {
			tracing::debug!("event delivery thread is gone, dropping job");
		}
	}

	/// Blocks until every job queued so far has run.
	///
	/// Returns immediately when called from the delivery thread itself.
	pub fn flush(&self) {
		if Self::is_delivery_thread() {
			return;
		}
		let (done_tx, done_rx) = std::sync::mpsc::channel();
		self.dispatch(move || {
			let _ = done_tx.send(());
		});
		let _ = done_rx.recv();
	}

	/// Returns true on the thread that runs event handlers.
	pub fn is_delivery_thread() -> bool {
		ON_DELIVERY_THREAD.with(Cell::get)
	}
}

/// Tokio runtime plus event delivery thread backing one device manager.
pub struct Context {
	runtime: Mutex<Option<Runtime>>,
	handle: Handle,
	dispatcher: Dispatcher,
}

impl Context {
	/// Builds a context with `worker_threads` runtime threads (at least one).
	///
	/// # Errors
	///
	/// Returns [`Error::Transport`] if the runtime or the delivery thread
	/// cannot be started.
	pub fn new(worker_threads: usize) -> Result<Self> {
		let runtime = Builder::new_multi_thread()
			.worker_threads(worker_threads.max(1))
			.thread_name("telco-context")
			.enable_all()
			.build()?;
		let handle = runtime.handle().clone();
		let dispatcher = Dispatcher::spawn()?;

		tracing::debug!(worker_threads, "context started");

		Ok(Self {
			runtime: Mutex::new(Some(runtime)),
			handle,
			dispatcher,
		})
	}

	pub fn handle(&self) -> &Handle {
		&self.handle
	}

	pub fn dispatcher(&self) -> &Dispatcher {
		&self.dispatcher
	}

	/// Spawns a task on the background runtime.
	pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.handle.spawn(future)
	}

	/// Blocks the calling thread on `future`.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidOperation`] when called from inside an async
	/// runtime, otherwise whatever `future` yields.
	pub fn block_on<F, T>(&self, future: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		if Handle::try_current().is_ok() {
			return Err(Error::InvalidOperation(
				"blocking call made from inside an async runtime".to_string(),
			));
		}
		self.handle.block_on(future)
	}

	/// Blocks on `future`, failing with [`Error::Cancelled`] if `cancellable`
	/// (or the thread's current cancellable) fires first.
	///
	/// # Errors
	///
	/// Returns [`Error::Cancelled`] on cancellation, otherwise whatever
	/// [`block_on`](Self::block_on) returns.
	pub fn run<F, T>(&self, future: F, cancellable: Option<&Cancellable>) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		let cancellable = Cancellable::resolve(cancellable);
		if let Some(cancellable) = &cancellable {
			cancellable.raise_if_cancelled()?;
		}
		self.block_on(async {
			tokio::select! {
				biased;
				_ = cancellable::cancelled(cancellable.as_ref()) => Err(Error::Cancelled),
				result = future => result,
			}
		})
	}
}

impl Drop for Context {
	fn drop(&mut self) {
		if let Some(runtime) = self.runtime.lock().take() {
			runtime.shutdown_background();
			tracing::debug!("context stopped");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::{Duration, Instant};

	#[test]
	fn run_returns_future_output() {
		let ctx = Context::new(1).unwrap();
		let value = ctx.run(async { Ok(41 + 1) }, None).unwrap();
		assert_eq!(value, 42);
	}

	#[test]
	fn run_is_cancelled_from_another_thread() {
		let ctx = Context::new(1).unwrap();
		let cancellable = Cancellable::new();
		let remote = cancellable.clone();
		std::thread::spawn(move || {
			std::thread::sleep(Duration::from_millis(50));
			remote.cancel();
		});

		let started = Instant::now();
		let result: Result<()> = ctx.run(
			async {
				tokio::time::sleep(Duration::from_secs(10)).await;
				Ok(())
			},
			Some(&cancellable),
		);
		assert_eq!(result, Err(Error::Cancelled));
		assert!(started.elapsed() < Duration::from_secs(2));
	}

	#[test]
	fn run_rejects_already_cancelled() {
		let ctx = Context::new(1).unwrap();
		let cancellable = Cancellable::new();
		cancellable.cancel();
		let result = ctx.run(async { Ok(()) }, Some(&cancellable));
		assert_eq!(result, Err(Error::Cancelled));
	}

	#[tokio::test]
	async fn block_on_inside_runtime_is_rejected() {
		let ctx = Context::new(1).unwrap();
		let result = ctx.block_on(async { Ok(()) });
		assert!(matches!(result, Err(Error::InvalidOperation(_))));
	}

	#[test]
	fn dispatcher_runs_jobs_in_order() {
		let dispatcher = Dispatcher::spawn().unwrap();
		let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
		for i in 0..10 {
			let seen = Arc::clone(&seen);
			dispatcher.dispatch(move || {
				assert!(Dispatcher::is_delivery_thread());
				seen.lock().push(i);
			});
		}
		dispatcher.flush();
		assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
		assert!(!Dispatcher::is_delivery_thread());
	}

	#[test]
	fn dispatcher_survives_panics() {
		let dispatcher = Dispatcher::spawn().unwrap();
		let hits = Arc::new(AtomicUsize::new(0));
		dispatcher.dispatch(|| panic!("boom"));
		let counter = Arc::clone(&hits);
		dispatcher.dispatch(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		dispatcher.flush();
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}
}
