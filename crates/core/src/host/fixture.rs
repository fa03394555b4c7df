//! Declarative host setup, loadable from JSON.
//!
//! ```json
//! {
//!   "devices": [
//!     { "id": "local", "processes": [{ "name": "init", "pid": 1 }] },
//!     { "id": "usb-1", "name": "Pixel", "type": "usb",
//!       "executables": { "/bin/cat": "native" },
//!       "applications": { "com.example.mail": "Mail" }, "frontmost": "com.example.mail" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use telco_protocol::{DeviceInfo, DeviceKind};
use telco_runtime::{Error, Result};

use super::state::{ExecutableKind, HostProcess, HostState, SimDevice};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostFixture {
	pub devices: Vec<DeviceFixture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceFixture {
	pub id: String,
	/// Defaults to the id
	#[serde(default)]
	pub name: Option<String>,
	#[serde(rename = "type", default = "remote")]
	pub kind: DeviceKind,
	#[serde(default)]
	pub processes: Vec<ProcessFixture>,
	#[serde(default)]
	pub executables: BTreeMap<String, ExecutableKind>,
	#[serde(default = "yes")]
	pub injection_supported: bool,
	/// Identifier to display name
	#[serde(default)]
	pub applications: BTreeMap<String, String>,
	#[serde(default)]
	pub frontmost: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessFixture {
	pub name: String,
	/// Allocated by the device when absent
	#[serde(default)]
	pub pid: Option<u32>,
	#[serde(default)]
	pub protected: bool,
	#[serde(default = "yes")]
	pub responsive: bool,
}

fn remote() -> DeviceKind {
	DeviceKind::Remote
}

fn yes() -> bool {
	true
}

impl HostFixture {
	pub fn from_json(text: &str) -> Result<Self> {
		serde_json::from_str(text).map_err(|e| Error::InvalidArgument(format!("invalid host fixture: {e}")))
	}

	pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|e| {
			Error::InvalidArgument(format!("unable to read host fixture '{}': {e}", path.display()))
		})?;
		Self::from_json(&text)
	}

	pub(crate) fn apply(&self, state: &mut HostState) -> Result<()> {
		for fixture in &self.devices {
			let device = state.devices.entry(fixture.id.clone()).or_insert_with(|| {
				let name = fixture.name.clone().unwrap_or_else(|| fixture.id.clone());
				SimDevice::new(DeviceInfo::new(fixture.id.clone(), name, fixture.kind))
			});
			device.injection_supported = fixture.injection_supported;
			device
				.executables
				.extend(fixture.executables.iter().map(|(k, v)| (k.clone(), *v)));
			device
				.applications
				.extend(fixture.applications.iter().map(|(k, v)| (k.clone(), v.clone())));
			if let Some(frontmost) = &fixture.frontmost {
				if !device.applications.contains_key(frontmost) {
					return Err(Error::InvalidArgument(format!(
						"frontmost application '{frontmost}' is not installed on '{}'",
						fixture.id
					)));
				}
				device.frontmost = Some(frontmost.clone());
			}

			for process in &fixture.processes {
				let pid = match process.pid {
					Some(pid) if device.processes.contains_key(&pid) => {
						return Err(Error::InvalidArgument(format!(
							"duplicate pid {pid} on device '{}'",
							fixture.id
						)));
					}
					Some(pid) => {
						device.processes.insert(pid, HostProcess::new(pid, &process.name));
						pid
					}
					None => device.add_process(&process.name),
				};
				if let Some(p) = device.processes.get_mut(&pid) {
					p.protected = process.protected;
					p.responsive = process.responsive;
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_and_applies() {
		let fixture = HostFixture::from_json(
			r#"{"devices": [
				{"id": "local", "processes": [{"name": "init", "pid": 1}, {"name": "sh"}]},
				{"id": "usb-1", "name": "Pixel", "type": "usb",
				 "executables": {"/bin/cat": "unsupported"}, "injectionSupported": false,
				 "applications": {"com.example.mail": "Mail"}, "frontmost": "com.example.mail"}
			]}"#,
		)
		.unwrap();

		let mut state = HostState::new();
		fixture.apply(&mut state).unwrap();

		let local = &state.devices["local"];
		assert_eq!(local.info.name, "Local System");
		assert_eq!(local.processes[&1].name, "init");
		assert_eq!(local.processes.len(), 2);

		let usb = &state.devices["usb-1"];
		assert_eq!(usb.info.kind, DeviceKind::Usb);
		assert_eq!(usb.executables["/bin/cat"], ExecutableKind::Unsupported);
		assert!(!usb.injection_supported);
		assert_eq!(usb.applications["com.example.mail"], "Mail");
		assert_eq!(usb.frontmost.as_deref(), Some("com.example.mail"));
	}

	#[test]
	fn rejects_duplicate_pids_and_unknown_keys() {
		let dup = HostFixture::from_json(
			r#"{"devices": [{"id": "local", "processes": [{"name": "a", "pid": 5}, {"name": "b", "pid": 5}]}]}"#,
		)
		.unwrap();
		assert!(dup.apply(&mut HostState::new()).is_err());

		let stray = HostFixture::from_json(r#"{"devices": [{"id": "local", "frontmost": "com.example.gone"}]}"#)
			.unwrap();
		assert!(stray.apply(&mut HostState::new()).is_err());

		let err = HostFixture::from_json(r#"{"devize": []}"#).unwrap_err();
		assert!(err.to_string().contains("invalid host fixture"));
	}

	#[test]
	fn reads_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("host.json");
		std::fs::write(&path, r#"{"devices": [{"id": "socket@10.0.0.2:27042"}]}"#).unwrap();

		let fixture = HostFixture::from_path(&path).unwrap();
		assert_eq!(fixture.devices[0].kind, DeviceKind::Remote);
		assert!(HostFixture::from_path(dir.path().join("missing.json")).is_err());
	}
}
