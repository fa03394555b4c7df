// Shared fixture for the integration tests: a device manager wired to an
// in-process host that the test drives through its handle.

#![allow(dead_code)]

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use telco::host::{FnAgent, HostHandle, InProcessHost, LOCAL_DEVICE_ID};
use telco::{Device, DeviceManager, ManagerOptions, RpcValue, Script, ScriptOptions, Session, SessionOptions};

pub const AGENT_SOURCE: &str = "rpc.exports = { echo, listThreads, add, fail, sleep };";

/// How long a test waits for an event before giving up.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

pub struct Fixture {
	pub host: InProcessHost,
	pub handle: HostHandle,
	pub manager: DeviceManager,
}

impl Fixture {
	pub fn start() -> Self {
		Self::with_options(ManagerOptions::default())
	}

	pub fn with_options(options: ManagerOptions) -> Self {
		let host = InProcessHost::new();
		let handle = host.handle();
		handle.register_agent(AGENT_SOURCE, agent());
		let manager = DeviceManager::with_backend(options, &host).expect("Failed to start device manager");
		Self {
			host,
			handle,
			manager,
		}
	}

	pub fn local(&self) -> Device {
		self.manager
			.get_local_device()
			.expect("Failed to get local device")
	}

	/// Starts a process on the local device and attaches to it.
	pub fn attach(&self, name: &str) -> (u32, Session) {
		let pid = self
			.handle
			.add_process(LOCAL_DEVICE_ID, name)
			.expect("Failed to add process");
		let session = self
			.local()
			.attach(pid, SessionOptions::default())
			.expect("Failed to attach");
		(pid, session)
	}

	/// Attaches to a fresh process and loads the test agent into it.
	pub fn loaded_script(&self) -> (u32, Session, Script) {
		let (pid, session) = self.attach("target");
		let script = session
			.create_script(AGENT_SOURCE, ScriptOptions::default())
			.expect("Failed to create script");
		script.load().expect("Failed to load script");
		(pid, session, script)
	}
}

/// Agent behind [`AGENT_SOURCE`].
pub fn agent() -> FnAgent {
	FnAgent::new()
		.export("echo", 1, |mut args| Ok(args.remove(0)))
		.export("listThreads", 0, |_| {
			Ok(RpcValue::Array(vec![RpcValue::Int(1), RpcValue::Int(2)]))
		})
		.export("add", 2, |args| {
			let a = args[0].as_i64().ok_or("a must be an integer")?;
			let b = args[1].as_i64().ok_or("b must be an integer")?;
			Ok(RpcValue::Int(a + b))
		})
		.export("fail", 0, |_| Err("Nope: something broke".to_string()))
		.export("sleep", 1, |args| {
			let ms = args[0].as_i64().unwrap_or_default();
			thread::sleep(Duration::from_millis(ms as u64));
			Ok(RpcValue::Null)
		})
		.on_message(|message, data| {
			Some(serde_json::json!({"echo": message, "dataLen": data.map(|d| d.len())}))
		})
}

/// Handler that forwards every event into a channel.
pub fn collect<E: Clone + Send + 'static>() -> (impl Fn(&E) + Send + Sync + 'static, mpsc::Receiver<E>) {
	let (tx, rx) = mpsc::channel();
	(move |event: &E| drop(tx.send(event.clone())), rx)
}
