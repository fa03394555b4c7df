//! Integration tests driving the `telco` binary against a host fixture.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::{Value, json};
use tempfile::TempDir;

fn telco_binary() -> PathBuf {
	PathBuf::from(env!("CARGO_BIN_EXE_telco"))
}

/// Writes a fixture with a USB device and a few processes.
fn write_fixture(dir: &TempDir) -> PathBuf {
	let fixture = json!({
		"devices": [
			{
				"id": "local",
				"processes": [
					{ "name": "init", "pid": 1, "protected": true },
					{ "name": "Twitter", "pid": 300 },
					{ "name": "worker", "pid": 301 },
					{ "name": "worker", "pid": 302 }
				],
				"executables": { "/bin/cat": "native", "/bin/weird": "unsupported" },
				"applications": { "com.twitter.app": "Twitter", "com.example.mail": "Mail" }
			},
			{ "id": "usb-1", "name": "Pixel", "type": "usb" }
		]
	});
	let path = dir.path().join("host.json");
	std::fs::write(&path, fixture.to_string()).expect("failed to write fixture");
	path
}

fn run_json(fixture: &Path, args: &[&str]) -> (bool, Value, String) {
	let output = Command::new(telco_binary())
		.args(["-f", "json", "--fixture"])
		.arg(fixture)
		.args(args)
		.env_remove("TELCO_LOG")
		.env_remove("RUST_LOG")
		.output()
		.expect("failed to execute telco");

	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	let parsed = serde_json::from_str::<Value>(&stdout).unwrap_or_else(|_| json!({ "raw": stdout }));
	(output.status.success(), parsed, stderr)
}

#[test]
fn devices_lists_local_and_fixture_devices() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["devices"]);
	assert!(success, "devices failed: {stderr}");
	assert_eq!(json["ok"], true);
	assert_eq!(json["command"], "devices");

	let devices = json["data"]["devices"].as_array().unwrap();
	let ids: Vec<&str> = devices.iter().filter_map(|d| d["id"].as_str()).collect();
	assert_eq!(ids, ["local", "usb-1"]);
	assert_eq!(devices[1]["type"], "usb");
}

#[test]
fn ps_applications_marks_running_ones() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["ps", "--applications"]);
	assert!(success, "ps --applications failed: {stderr}");
	let apps = json["data"]["applications"].as_array().unwrap();
	assert_eq!(apps.len(), 2);
	let twitter = apps.iter().find(|a| a["name"] == "Twitter").unwrap();
	assert_eq!(twitter["pid"], 300);
	let mail = apps.iter().find(|a| a["name"] == "Mail").unwrap();
	assert!(mail.get("pid").is_none());
}

#[test]
fn ps_filters_by_pattern_on_selected_device() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["ps", "work*"]);
	assert!(success, "ps failed: {stderr}");
	assert_eq!(json["device"], "local");
	let pids: Vec<u64> = json["data"]["processes"]
		.as_array()
		.unwrap()
		.iter()
		.filter_map(|p| p["pid"].as_u64())
		.collect();
	assert_eq!(pids, [301, 302]);

	let (success, json, _) = run_json(&fixture, &["ps", "--usb"]);
	assert!(success);
	assert_eq!(json["device"], "usb-1");
}

#[test]
fn wait_times_out_for_missing_device() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["wait", "-D", "nope", "--timeout", "0.2"]);
	assert!(!success);
	assert_eq!(json["ok"], false);
	assert_eq!(json["error"]["code"], "INVALID_ARGUMENT");
	assert!(stderr.contains("device not found"), "stderr: {stderr}");
}

#[test]
fn spawn_reports_pid_and_failures() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["spawn", "/bin/cat", "-n"]);
	assert!(success, "spawn failed: {stderr}");
	assert!(json["data"]["pid"].as_u64().is_some());
	assert_eq!(json["data"]["resumed"], false);

	let (success, json, _) = run_json(&fixture, &["spawn", "/bin/weird"]);
	assert!(!success);
	assert_eq!(json["error"]["code"], "EXECUTABLE_NOT_SUPPORTED");

	let (_, json, _) = run_json(&fixture, &["spawn", "/bin/missing"]);
	assert_eq!(json["error"]["code"], "EXECUTABLE_NOT_FOUND");
	assert_eq!(json["error"]["message"], "unable to find executable at '/bin/missing'");
}

#[test]
fn kill_by_name_and_missing_pid() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["kill", "twitter"]);
	assert!(success, "kill failed: {stderr}");
	assert_eq!(json["data"]["pid"], 300);

	let (success, json, _) = run_json(&fixture, &["kill", "999999"]);
	assert!(!success);
	assert_eq!(json["error"]["code"], "PROCESS_NOT_FOUND");

	let (_, json, _) = run_json(&fixture, &["kill", "worker"]);
	assert_eq!(json["error"]["code"], "INVALID_ARGUMENT");
	assert!(json["error"]["message"].as_str().unwrap().starts_with("ambiguous name"));
}

#[test]
fn params_include_os_and_arch() {
	let dir = TempDir::new().unwrap();
	let fixture = write_fixture(&dir);

	let (success, json, stderr) = run_json(&fixture, &["params"]);
	assert!(success, "params failed: {stderr}");
	assert!(json["data"]["os"].is_object() || json["data"]["os"].is_string());
	assert!(json["data"].get("arch").is_some());
}

#[test]
fn bad_fixture_is_reported() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("broken.json");
	std::fs::write(&path, r#"{"devices": [{"id": "x", "bogus": 1}]}"#).unwrap();

	let (success, json, _) = run_json(&path, &["devices"]);
	assert!(!success);
	assert_eq!(json["error"]["code"], "INVALID_ARGUMENT");
	assert!(json["error"]["message"].as_str().unwrap().contains("loading fixture"));
}
