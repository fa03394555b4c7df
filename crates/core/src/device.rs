//! [`Device`]: process lifecycle on one execution environment.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use glob::{MatchOptions, Pattern};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use telco_protocol::{
	ApplicationInfo, Crash, DetachReason, DeviceInfo, DeviceKind, ProcessInfo, ProcessTarget,
	RpcValue, SessionOptions, SpawnOptions,
};
use telco_runtime::{Channel, Error, EventHub, EventTarget, HandlerId, Result};

use crate::events::DeviceEvent;
use crate::session::{Session, SessionInner};
use crate::shared::Shared;

/// A local, USB or remote device. Once lost it stays lost.
#[derive(Clone)]
pub struct Device {
	inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
	info: DeviceInfo,
	shared: Arc<Shared>,
	channel: Channel,
	lost: AtomicBool,
	events: EventHub<DeviceEvent>,
	sessions: Mutex<Vec<Weak<SessionInner>>>,
}

#[derive(Deserialize)]
struct Spawned {
	pid: u32,
}

#[derive(Deserialize)]
struct Attached {
	session: String,
}

#[derive(Deserialize)]
struct Frontmost {
	application: Option<ApplicationInfo>,
}

#[derive(Deserialize)]
struct Injected {
	id: u32,
}

const NAME_MATCH: MatchOptions = MatchOptions {
	case_sensitive: false,
	require_literal_separator: false,
	require_literal_leading_dot: false,
};

fn name_matches(pattern: Option<&Pattern>, query: &str, name: &str) -> bool {
	match pattern {
		Some(pattern) => pattern.matches_with(name, NAME_MATCH),
		None => name.eq_ignore_ascii_case(query),
	}
}

impl Device {
	pub(crate) fn new(shared: Arc<Shared>, channel: Channel, info: DeviceInfo) -> Self {
		let events = shared.hub();
		let inner = Arc::new(DeviceInner {
			info,
			shared,
			channel,
			lost: AtomicBool::new(false),
			events,
			sessions: Mutex::new(Vec::new()),
		});
		inner
			.shared
			.register(inner.channel.guid(), &inner);
		Self { inner }
	}

	pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
		&self.inner
	}

	pub fn id(&self) -> &str {
		&self.inner.info.id
	}

	pub fn name(&self) -> &str {
		&self.inner.info.name
	}

	pub fn kind(&self) -> DeviceKind {
		self.inner.info.kind
	}

	pub fn info(&self) -> &DeviceInfo {
		&self.inner.info
	}

	pub fn is_lost(&self) -> bool {
		self.inner.lost.load(Ordering::SeqCst)
	}

	/// OS, architecture and access level of the device.
	pub fn query_system_parameters(&self) -> Result<Map<String, Value>> {
		self.inner.ensure_usable()?;
		self.inner
			.request(self.inner.channel.send_no_params("querySystemParameters"))
	}

	/// Running processes, ordered by pid.
	pub fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
		self.inner.ensure_usable()?;
		self.inner
			.request(self.inner.channel.send_no_params("enumerateProcesses"))
	}

	/// Installed applications; running ones carry a pid.
	pub fn enumerate_applications(&self) -> Result<Vec<ApplicationInfo>> {
		self.inner.ensure_usable()?;
		self.inner
			.request(self.inner.channel.send_no_params("enumerateApplications"))
	}

	/// The application in the foreground, if one is running there.
	pub fn get_frontmost_application(&self) -> Result<Option<ApplicationInfo>> {
		self.inner.ensure_usable()?;
		let frontmost: Frontmost = self
			.inner
			.request(self.inner.channel.send_no_params("getFrontmostApplication"))?;
		Ok(frontmost.application)
	}

	/// Finds the single process whose name matches `name`.
	///
	/// Matching ignores case and accepts glob wildcards.
	///
	/// # Errors
	///
	/// [`Error::ProcessNotFound`] if nothing matches, [`Error::InvalidArgument`]
	/// if several processes do.
	pub fn get_process(&self, name: &str) -> Result<ProcessInfo> {
		let pattern = Pattern::new(name).ok();
		let mut matches: Vec<ProcessInfo> = self
			.enumerate_processes()?
			.into_iter()
			.filter(|p| name_matches(pattern.as_ref(), name, &p.name))
			.collect();

		match matches.len() {
			0 => Err(Error::ProcessNotFound(format!(
				"unable to find process with name '{name}'"
			))),
			1 => Ok(matches.remove(0)),
			_ => {
				let listing = matches
					.iter()
					.map(|p| format!("{} (pid: {})", p.name, p.pid))
					.collect::<Vec<_>>()
					.join(", ");
				Err(Error::InvalidArgument(format!(
					"ambiguous name; it matches: {listing}"
				)))
			}
		}
	}

	fn resolve(&self, target: ProcessTarget) -> Result<u32> {
		match target {
			ProcessTarget::Pid(pid) => Ok(pid),
			ProcessTarget::Name(name) => self.get_process(&name).map(|p| p.pid),
		}
	}

	/// Spawns `program` suspended and returns its pid.
	///
	/// # Errors
	///
	/// [`Error::ExecutableNotFound`], [`Error::ExecutableNotSupported`] or
	/// [`Error::PermissionDenied`].
	pub fn spawn(&self, program: &str, options: SpawnOptions) -> Result<u32> {
		self.inner.ensure_usable()?;
		let spawned: Spawned = self.inner.request(
			self.inner
				.channel
				.send("spawn", json!({"program": program, "options": options})),
		)?;
		tracing::debug!(device = %self.id(), pid = spawned.pid, program, "spawned");
		Ok(spawned.pid)
	}

	pub fn resume(&self, target: impl Into<ProcessTarget>) -> Result<()> {
		self.inner.ensure_usable()?;
		let pid = self.resolve(target.into())?;
		self.inner
			.request(self.inner.channel.send_no_result("resume", json!({"pid": pid})))
	}

	/// Kills a process. Sessions attached to it detach with `process-terminated`.
	pub fn kill(&self, target: impl Into<ProcessTarget>) -> Result<()> {
		self.inner.ensure_usable()?;
		let pid = self.resolve(target.into())?;
		self.inner
			.request(self.inner.channel.send_no_result("kill", json!({"pid": pid})))
	}

	/// Writes to the stdin of a process spawned with [`Stdio::Pipe`](crate::Stdio::Pipe).
	pub fn input(&self, pid: u32, data: &[u8]) -> Result<()> {
		self.inner.ensure_usable()?;
		let params = json!({"pid": pid, "data": RpcValue::from(data).to_json()});
		self.inner
			.request(self.inner.channel.send_no_result("input", params))
	}

	/// Attaches to a process.
	///
	/// # Errors
	///
	/// [`Error::ProcessNotFound`], [`Error::ProcessNotResponding`] or
	/// [`Error::PermissionDenied`].
	pub fn attach(&self, target: impl Into<ProcessTarget>, options: SessionOptions) -> Result<Session> {
		let inner = &self.inner;
		inner.ensure_usable()?;
		let pid = self.resolve(target.into())?;
		let attached: Attached = inner.request(
			inner
				.channel
				.send("attach", json!({"pid": pid, "options": options})),
		)?;

		let session = Session::new(
			Arc::clone(&inner.shared),
			inner.channel.sibling(attached.session),
			pid,
		);
		let mut sessions = inner.sessions.lock();
		if inner.lost.load(Ordering::SeqCst) {
			drop(sessions);
			session
				.inner()
				.mark_detached(DetachReason::DeviceLost, None);
		} else {
			sessions.retain(|s| s.strong_count() > 0);
			sessions.push(Arc::downgrade(session.inner()));
		}
		tracing::debug!(device = %self.id(), pid, "attached");
		Ok(session)
	}

	/// Injects a shared library from a path on the device and runs `entrypoint`.
	/// Returns the injectee id.
	pub fn inject_library_file(
		&self,
		target: impl Into<ProcessTarget>,
		path: &str,
		entrypoint: &str,
		data: &str,
	) -> Result<u32> {
		self.inner.ensure_usable()?;
		let pid = self.resolve(target.into())?;
		let params = json!({"pid": pid, "path": path, "entrypoint": entrypoint, "data": data});
		let injected: Injected = self
			.inner
			.request(self.inner.channel.send("injectLibraryFile", params))?;
		Ok(injected.id)
	}

	/// Injects a shared library from memory. See [`inject_library_file`](Self::inject_library_file).
	pub fn inject_library_blob(
		&self,
		target: impl Into<ProcessTarget>,
		blob: &[u8],
		entrypoint: &str,
		data: &str,
	) -> Result<u32> {
		self.inner.ensure_usable()?;
		let pid = self.resolve(target.into())?;
		let params = json!({
			"pid": pid,
			"blob": RpcValue::from(blob).to_json(),
			"entrypoint": entrypoint,
			"data": data,
		});
		let injected: Injected = self
			.inner
			.request(self.inner.channel.send("injectLibraryBlob", params))?;
		Ok(injected.id)
	}

	/// Registers a handler for `"lost"` or `"process-crashed"`.
	pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId>
	where
		F: Fn(&DeviceEvent) + Send + Sync + 'static,
	{
		self.inner.events.on(event, handler)
	}

	pub fn off(&self, id: HandlerId) -> bool {
		self.inner.events.off(id)
	}
}

impl PartialEq for Device {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Device")
			.field("id", &self.id())
			.field("name", &self.name())
			.field("kind", &self.kind())
			.field("lost", &self.is_lost())
			.finish()
	}
}

impl DeviceInner {
	fn ensure_usable(&self) -> Result<()> {
		self.shared.ensure_running()?;
		if self.lost.load(Ordering::SeqCst) {
			return Err(Error::InvalidOperation("device is lost".to_string()));
		}
		Ok(())
	}

	fn request<F, T>(&self, future: F) -> Result<T>
	where
		F: std::future::Future<Output = Result<T>>,
	{
		self.shared.request(future)
	}

	/// Marks the device lost and detaches its sessions. Returns false if it
	/// already was.
	pub(crate) fn mark_lost(&self, reason: DetachReason) -> bool {
		if self.lost.swap(true, Ordering::SeqCst) {
			return false;
		}
		let sessions = mem::take(&mut *self.sessions.lock());
		tracing::debug!(device = %self.info.id, %reason, sessions = sessions.len(), "device lost");
		for session in sessions.iter().filter_map(Weak::upgrade) {
			session.mark_detached(reason, None);
		}
		self.shared.connection.unregister_object(self.channel.guid());
		self.events.emit(DeviceEvent::Lost);
		true
	}
}

impl EventTarget for DeviceInner {
	fn on_event(&self, method: &str, params: Value) {
		match method {
			"processCrashed" => match serde_json::from_value::<Crash>(params) {
				Ok(crash) => self.events.emit(DeviceEvent::ProcessCrashed(crash)),
				Err(e) => tracing::warn!(device = %self.info.id, error = %e, "malformed crash report"),
			},
			_ => tracing::debug!(device = %self.info.id, method, "ignoring device event"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn names_match_case_insensitively_with_wildcards() {
		let pattern = Pattern::new("twit*").ok();
		assert!(name_matches(pattern.as_ref(), "twit*", "Twitter"));
		assert!(!name_matches(pattern.as_ref(), "twit*", "Mail"));

		let exact = Pattern::new("Mail").ok();
		assert!(name_matches(exact.as_ref(), "Mail", "mail"));
		assert!(!name_matches(exact.as_ref(), "Mail", "MailCompose"));
	}

	#[test]
	fn invalid_patterns_fall_back_to_exact_names() {
		assert!(Pattern::new("[").is_err());
		assert!(name_matches(None, "[", "["));
		assert!(!name_matches(None, "[", "x"));
	}
}
