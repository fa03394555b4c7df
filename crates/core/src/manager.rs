//! [`DeviceManager`]: the device registry and owner of the background context.
//!
//! The manager keeps the live device set in sync with the backend's
//! `deviceAdded`/`deviceRemoved` events. Lookups check a snapshot first and,
//! if allowed to wait, subscribe to additions before re-checking so that a
//! device appearing in between is never missed.

use std::fmt;
use std::mem;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use telco_protocol::{DetachReason, DeviceInfo, DeviceKind};
use telco_runtime::{
	Backend, Cancellable, Channel, Connection, Context, Error, EventHub, EventTarget, HandlerId,
	Result, Timeout,
};
use tokio::sync::broadcast::error::RecvError;

use crate::device::Device;
use crate::events::ManagerEvent;
use crate::host::InProcessHost;
use crate::options::ManagerOptions;
use crate::shared::{Shared, server_not_running};

/// Registry of devices reachable through one backend.
///
/// Cloning shares the same registry. Call [`close`](Self::close) to release
/// the backend; every operation afterwards fails with
/// [`Error::ServerNotRunning`].
#[derive(Clone)]
pub struct DeviceManager {
	inner: Arc<ManagerInner>,
}

struct ManagerInner {
	shared: Arc<Shared>,
	channel: Channel,
	devices: RwLock<IndexMap<String, Device>>,
	events: EventHub<ManagerEvent>,
}

/// Why a waiting lookup woke up.
enum Wake {
	Added(Device),
	/// Additions were missed; check the live set again
	Rescan,
}

#[derive(Deserialize)]
struct RemovedParams {
	id: String,
}

impl DeviceManager {
	/// Starts a manager on a fresh in-process host, configured from the environment.
	pub fn start() -> Result<Self> {
		Self::with_options(ManagerOptions::from_env())
	}

	/// Starts a manager on a fresh in-process host.
	pub fn with_options(options: ManagerOptions) -> Result<Self> {
		Self::with_backend(options, &InProcessHost::new())
	}

	/// Starts a manager on `backend` and loads the initial device set.
	///
	/// # Errors
	///
	/// Fails if the backend refuses the connection, or with
	/// [`Error::InvalidOperation`] when called from inside a tokio runtime.
	pub fn with_backend(options: ManagerOptions, backend: &dyn Backend) -> Result<Self> {
		let ctx = Context::new(options.worker_threads)?;
		let parts = backend.connect(&ctx)?;
		let connection = Connection::new(parts);
		ctx.spawn(Arc::clone(&connection).run());

		let shared = Arc::new(Shared {
			ctx,
			connection: Arc::clone(&connection),
			options,
			shutdown: Cancellable::new(),
		});
		let inner = Arc::new(ManagerInner {
			events: shared.hub(),
			channel: Channel::new("manager", connection),
			devices: RwLock::new(IndexMap::new()),
			shared,
		});
		inner.shared.register("manager", &inner);

		let infos: Vec<DeviceInfo> = inner
			.shared
			.request(inner.channel.send_no_params("enumerateDevices"))?;
		for info in infos {
			inner.add_device(info, false);
		}
		tracing::debug!(
			backend = backend.name(),
			devices = inner.devices.read().len(),
			"device manager started"
		);

		Ok(Self { inner })
	}

	pub fn options(&self) -> &ManagerOptions {
		&self.inner.shared.options
	}

	/// True after [`close`](Self::close) or once the backend went away.
	pub fn is_closed(&self) -> bool {
		self.inner.shared.ensure_running().is_err()
	}

	/// Snapshot of the live devices, in discovery order.
	pub fn enumerate_devices(&self) -> Result<Vec<Device>> {
		self.inner.shared.ensure_running()?;
		Ok(self.inner.devices.read().values().cloned().collect())
	}

	/// Returns the first device matching `predicate`, waiting up to `timeout`
	/// for one to be added.
	///
	/// `predicate` runs on the calling thread and may call blocking methods
	/// such as [`Device::query_system_parameters`].
	///
	/// # Errors
	///
	/// - [`Error::InvalidArgument`] "device not found" when nothing matched in time
	/// - [`Error::Cancelled`] if `cancellable` (or the thread's current one) fires
	/// - [`Error::ServerNotRunning`] if the manager closes while waiting
	pub fn get_device_matching<P>(
		&self,
		predicate: P,
		timeout: impl Into<Timeout>,
		cancellable: Option<&Cancellable>,
	) -> Result<Device>
	where
		P: Fn(&Device) -> bool,
	{
		let inner = &self.inner;
		inner.shared.ensure_running()?;
		let timeout = timeout.into();

		let mut added = inner.events.subscribe();
		if let Some(device) = inner.find(&predicate) {
			return Ok(device);
		}
		if timeout == Timeout::NoWait {
			return Err(Error::device_not_found());
		}

		let deadline = timeout.deadline();
		let shutdown = inner.shared.shutdown.clone();
		loop {
			let wake = inner.shared.ctx.run(
				async {
					loop {
						tokio::select! {
							biased;
							_ = shutdown.cancelled() => return Err(server_not_running()),
							_ = Timeout::elapsed(deadline) => return Err(Error::device_not_found()),
							event = added.recv() => match event {
								Ok(ManagerEvent::Added(device)) => return Ok(Wake::Added(device)),
								Ok(_) => {}
								Err(RecvError::Lagged(skipped)) => {
									tracing::warn!(skipped, "device events lagged; rescanning");
									return Ok(Wake::Rescan);
								}
								Err(RecvError::Closed) => return Err(server_not_running()),
							},
						}
					}
				},
				cancellable,
			)?;

			// the predicate runs here, off the runtime, so it may block
			let found = match wake {
				Wake::Added(device) => predicate(&device).then_some(device),
				Wake::Rescan => inner.find(&predicate),
			};
			if let Some(device) = found {
				return Ok(device);
			}
		}
	}

	/// Returns the device with `id`, waiting up to `timeout` for it.
	pub fn get_device(&self, id: &str, timeout: impl Into<Timeout>) -> Result<Device> {
		self.get_device_matching(|d| d.id() == id, timeout, None)
	}

	/// The local device. Always present.
	pub fn get_local_device(&self) -> Result<Device> {
		self.get_device_matching(|d| d.kind() == DeviceKind::Local, Timeout::NoWait, None)
	}

	/// The first USB device, waiting up to `timeout` for one.
	pub fn get_usb_device(&self, timeout: impl Into<Timeout>) -> Result<Device> {
		self.get_device_matching(|d| d.kind() == DeviceKind::Usb, timeout, None)
	}

	/// The first remote device, if one is already known.
	pub fn get_remote_device(&self) -> Result<Device> {
		self.get_device_matching(|d| d.kind() == DeviceKind::Remote, Timeout::NoWait, None)
	}

	/// Registers a remote device reachable at `address`.
	pub fn add_remote_device(&self, address: &str) -> Result<Device> {
		let inner = &self.inner;
		let info: DeviceInfo = inner.shared.request(
			inner
				.channel
				.send("addRemoteDevice", json!({"address": address})),
		)?;
		let id = info.id.clone();
		inner.add_device(info, true);
		inner
			.devices
			.read()
			.get(&id)
			.cloned()
			.ok_or_else(Error::device_not_found)
	}

	/// Forgets the remote device at `address`; it is marked lost.
	pub fn remove_remote_device(&self, address: &str) -> Result<()> {
		let inner = &self.inner;
		inner.shared.request(
			inner
				.channel
				.send_no_result("removeRemoteDevice", json!({"address": address})),
		)?;
		inner.remove_device(&format!("socket@{address}"), DetachReason::DeviceLost);
		Ok(())
	}

	/// Registers a handler for `"added"`, `"removed"` or `"changed"`.
	pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId>
	where
		F: Fn(&ManagerEvent) + Send + Sync + 'static,
	{
		self.inner.events.on(event, handler)
	}

	pub fn off(&self, id: HandlerId) -> bool {
		self.inner.events.off(id)
	}

	/// Blocks until every handler invocation queued so far has run.
	///
	/// Returns immediately when called from a handler.
	pub fn flush_events(&self) {
		self.inner.shared.ctx.dispatcher().flush();
	}

	/// Shuts the manager down. Devices are marked lost, sessions detach, and
	/// waiting lookups fail with [`Error::ServerNotRunning`]. Idempotent.
	pub fn close(&self) {
		let inner = &self.inner;
		if inner.shared.shutdown.is_cancelled() {
			return;
		}
		inner.shared.shutdown.cancel();
		inner.drain_devices(DetachReason::ApplicationRequested);
		inner.shared.connection.close();
		tracing::debug!("device manager closed");
	}
}

impl fmt::Debug for DeviceManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeviceManager")
			.field("devices", &self.inner.devices.read().len())
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl ManagerInner {
	/// Evaluates `predicate` against a snapshot, without holding the lock.
	fn find<P: Fn(&Device) -> bool>(&self, predicate: &P) -> Option<Device> {
		let snapshot: Vec<Device> = self.devices.read().values().cloned().collect();
		snapshot.into_iter().find(|d| predicate(d))
	}

	fn add_device(&self, info: DeviceInfo, notify: bool) {
		let device = {
			let mut devices = self.devices.write();
			if devices.contains_key(&info.id) {
				return;
			}
			let channel = self.channel.sibling(format!("device:{}", info.id));
			let device = Device::new(Arc::clone(&self.shared), channel, info);
			devices.insert(device.id().to_string(), device.clone());
			device
		};
		tracing::debug!(device = %device.id(), kind = %device.kind(), "device added");
		if notify {
			self.events.emit(ManagerEvent::Added(device));
			self.events.emit(ManagerEvent::Changed);
		}
	}

	fn remove_device(&self, id: &str, reason: DetachReason) {
		let Some(device) = self.devices.write().shift_remove(id) else {
			return;
		};
		device.inner().mark_lost(reason);
		self.events.emit(ManagerEvent::Removed(device));
		self.events.emit(ManagerEvent::Changed);
	}

	fn drain_devices(&self, reason: DetachReason) {
		let devices = mem::take(&mut *self.devices.write());
		if devices.is_empty() {
			return;
		}
		for device in devices.into_values() {
			device.inner().mark_lost(reason);
			self.events.emit(ManagerEvent::Removed(device));
		}
		self.events.emit(ManagerEvent::Changed);
	}
}

impl EventTarget for ManagerInner {
	fn on_event(&self, method: &str, params: Value) {
		match method {
			"deviceAdded" => match serde_json::from_value::<DeviceInfo>(params) {
				Ok(info) => self.add_device(info, true),
				Err(e) => tracing::warn!(error = %e, "malformed deviceAdded event"),
			},
			"deviceRemoved" => match serde_json::from_value::<RemovedParams>(params) {
				Ok(RemovedParams { id }) => self.remove_device(&id, DetachReason::DeviceLost),
				Err(e) => tracing::warn!(error = %e, "malformed deviceRemoved event"),
			},
			_ => tracing::debug!(method, "ignoring manager event"),
		}
	}

	fn on_connection_lost(&self) {
		if self.shared.shutdown.is_cancelled() {
			return;
		}
		tracing::warn!("connection to backend lost");
		self.drain_devices(DetachReason::ConnectionTerminated);
		self.shared.shutdown.cancel();
	}
}
