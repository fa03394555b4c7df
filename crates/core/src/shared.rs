//! State shared by every object spawned from one device manager.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use telco_runtime::{
	Cancellable, Connection, Context, Error, ErrorKind, EventHub, EventKind, EventTarget, Result,
};

use crate::options::ManagerOptions;

pub(crate) struct Shared {
	pub(crate) ctx: Context,
	pub(crate) connection: Arc<Connection>,
	pub(crate) options: ManagerOptions,
	/// Fired by `DeviceManager::close`
	pub(crate) shutdown: Cancellable,
}

impl Shared {
	pub(crate) fn ensure_running(&self) -> Result<()> {
		if self.shutdown.is_cancelled() || self.connection.is_closed() {
			return Err(server_not_running());
		}
		Ok(())
	}

	/// Runs a control request on the background runtime, bounded by the
	/// request timeout and cancellable through the thread's current cancellable.
	pub(crate) fn request<F, T>(&self, future: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		self.request_with(future, None)
	}

	pub(crate) fn request_with<F, T>(&self, future: F, cancellable: Option<&Cancellable>) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		self.ensure_running()?;
		let timeout = self.options.request_timeout;
		self.ctx
			.run(with_deadline(timeout, future), cancellable)
			.map_err(|err| self.translate(err))
	}

	/// Pending requests fail with a transport error when the connection is
	/// torn down; after `close()` report that as the manager not running.
	pub(crate) fn translate(&self, err: Error) -> Error {
		if err.kind() == ErrorKind::Transport && self.shutdown.is_cancelled() {
			server_not_running()
		} else {
			err
		}
	}

	pub(crate) fn hub<E: EventKind>(&self) -> EventHub<E> {
		EventHub::new(self.ctx.dispatcher().clone(), self.options.event_capacity)
	}

	/// Routes events for `guid` to `target`. Events the backend sent for
	/// `guid` before now are delivered first, on this thread.
	pub(crate) fn register<T: EventTarget + 'static>(&self, guid: &str, target: &Arc<T>) {
		let target: Weak<dyn EventTarget> = Arc::downgrade(target) as Weak<T>;
		self.connection.register_object(guid, target);
	}
}

/// The last object of a manager to go away closes the backend connection.
impl Drop for Shared {
	fn drop(&mut self) {
		self.connection.close();
	}
}

pub(crate) fn server_not_running() -> Error {
	Error::ServerNotRunning("device manager is not running".to_string())
}

pub(crate) async fn with_deadline<F, T>(timeout: Duration, future: F) -> Result<T>
where
	F: Future<Output = Result<T>>,
{
	match tokio::time::timeout(timeout, future).await {
		Ok(result) => result,
		Err(_) => Err(Error::TimedOut("timeout was reached".to_string())),
	}
}
