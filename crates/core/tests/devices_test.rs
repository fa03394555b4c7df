// Integration tests for the device registry
//
// Tests cover:
// - enumerate_devices() always includes exactly one local device
// - lookups with no wait, a short wait, and a wait satisfied by a late device
// - added/removed/changed events
// - remote device registration
// - lookups that fall behind a burst of additions
// - predicates that block or read the registry themselves

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{EVENT_WAIT, Fixture, collect};
use telco::{DeviceKind, Error, ErrorKind, ManagerEvent, ManagerOptions, Timeout};

#[test]
fn test_enumerate_includes_exactly_one_local_device() {
	let fx = Fixture::start();
	fx.handle.add_device("usb-1", "Pixel", DeviceKind::Usb);
	fx.handle.add_device("socket@10.0.0.2", "10.0.0.2", DeviceKind::Remote);

	// added devices arrive as events, in order; wait for the last one
	fx.manager
		.get_device("socket@10.0.0.2", 5.0)
		.expect("Failed to see remote device");

	let devices = fx.manager.enumerate_devices().expect("Failed to enumerate");
	assert!(!devices.is_empty());
	let locals: Vec<_> = devices.iter().filter(|d| d.kind() == DeviceKind::Local).collect();
	assert_eq!(locals.len(), 1);
	assert_eq!(locals[0].id(), "local");
	assert_eq!(locals[0].name(), "Local System");
}

#[test]
fn test_no_wait_lookup_fails_immediately() {
	let fx = Fixture::start();

	let started = Instant::now();
	let err = fx
		.manager
		.get_device_matching(|d| d.id() == "nope", 0, None)
		.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::InvalidArgument);
	assert!(err.to_string().contains("device not found"));
	assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_short_timeout_fails_after_the_timeout() {
	let fx = Fixture::start();

	let started = Instant::now();
	let err = fx
		.manager
		.get_device_matching(|d| d.id() == "nope", 0.1, None)
		.unwrap_err();
	let elapsed = started.elapsed();

	assert_eq!(err.kind(), ErrorKind::InvalidArgument);
	assert!(err.to_string().contains("device not found"));
	assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
	assert!(elapsed < Duration::from_secs(2), "returned late: {elapsed:?}");
}

#[test]
fn test_lookup_sees_device_added_while_waiting() {
	let fx = Fixture::start();
	let handle = fx.handle.clone();

	let adder = thread::spawn(move || {
		thread::sleep(Duration::from_millis(100));
		handle.add_device("usb-7", "Pixel 7", DeviceKind::Usb);
	});

	let device = fx
		.manager
		.get_usb_device(Timeout::Forever)
		.expect("Failed to find usb device");
	adder.join().unwrap();

	assert_eq!(device.id(), "usb-7");
	assert_eq!(device.name(), "Pixel 7");
	assert!(!device.is_lost());
}

#[test]
fn test_local_and_missing_remote_lookups() {
	let fx = Fixture::start();

	assert_eq!(fx.manager.get_local_device().unwrap().kind(), DeviceKind::Local);
	let err = fx.manager.get_remote_device().unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_added_removed_and_changed_events() {
	let fx = Fixture::start();
	let (on_added, added) = collect::<ManagerEvent>();
	let (on_removed, removed) = collect::<ManagerEvent>();
	let (on_changed, changed) = collect::<ManagerEvent>();
	fx.manager.on("added", on_added).unwrap();
	fx.manager.on("removed", on_removed).unwrap();
	fx.manager.on("changed", on_changed).unwrap();

	fx.handle.add_device("usb-1", "Pixel", DeviceKind::Usb);
	let ManagerEvent::Added(device) = added.recv_timeout(EVENT_WAIT).unwrap() else {
		panic!("expected an added event");
	};
	assert_eq!(device.id(), "usb-1");
	assert!(matches!(changed.recv_timeout(EVENT_WAIT).unwrap(), ManagerEvent::Changed));

	assert!(fx.handle.remove_device("usb-1"));
	let ManagerEvent::Removed(gone) = removed.recv_timeout(EVENT_WAIT).unwrap() else {
		panic!("expected a removed event");
	};
	assert_eq!(gone, device);
	assert!(device.is_lost());
	assert!(matches!(changed.recv_timeout(EVENT_WAIT).unwrap(), ManagerEvent::Changed));

	let err = device.enumerate_processes().unwrap_err();
	assert_eq!(err.to_string(), "device is lost");
}

#[test]
fn test_unknown_event_names_are_rejected() {
	let fx = Fixture::start();
	let err = fx.manager.on("detached", |_| {}).unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)));

	let id = fx.manager.on("changed", |_| {}).unwrap();
	assert!(fx.manager.off(id));
	assert!(!fx.manager.off(id));
}

#[test]
fn test_add_and_remove_remote_device() {
	let fx = Fixture::start();

	let device = fx
		.manager
		.add_remote_device("10.0.0.2:27042")
		.expect("Failed to add remote device");
	assert_eq!(device.id(), "socket@10.0.0.2:27042");
	assert_eq!(device.kind(), DeviceKind::Remote);
	assert_eq!(fx.manager.get_remote_device().unwrap(), device);

	// adding twice yields the same device
	let again = fx.manager.add_remote_device("10.0.0.2:27042").unwrap();
	assert_eq!(again, device);

	fx.manager
		.remove_remote_device("10.0.0.2:27042")
		.expect("Failed to remove remote device");
	assert!(device.is_lost());
	assert!(fx.manager.get_remote_device().is_err());

	let err = fx.manager.remove_remote_device("10.0.0.2:27042").unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_lookup_survives_a_burst_larger_than_the_event_buffer() {
	let fx = Fixture::with_options(ManagerOptions::new().event_capacity(1));
	let handle = fx.handle.clone();

	let adder = thread::spawn(move || {
		thread::sleep(Duration::from_millis(50));
		for i in 0..50 {
			handle.add_device(&format!("usb-{i}"), "Pixel", DeviceKind::Usb);
		}
	});

	let device = fx
		.manager
		.get_device_matching(|d| d.id() == "usb-49", 10.0, None)
		.expect("Failed to find the last device of the burst");
	adder.join().unwrap();

	assert_eq!(device.id(), "usb-49");
	assert_eq!(fx.manager.enumerate_devices().unwrap().len(), 51);
}

#[test]
fn test_predicate_may_call_blocking_device_methods() {
	let fx = Fixture::start();
	let handle = fx.handle.clone();

	let adder = thread::spawn(move || {
		thread::sleep(Duration::from_millis(50));
		handle.add_device("usb-1", "Pixel", DeviceKind::Usb);
		handle.add_device("usb-2", "Pixel 2", DeviceKind::Usb);
	});

	let device = fx
		.manager
		.get_device_matching(
			|d| {
				d.kind() == DeviceKind::Usb
					&& d.id() == "usb-2"
					&& d.query_system_parameters()
						.is_ok_and(|params| params.get("access") == Some(&serde_json::json!("full")))
			},
			EVENT_WAIT,
			None,
		)
		.expect("Failed to match on system parameters");
	adder.join().unwrap();
	assert_eq!(device.id(), "usb-2");
}

#[test]
fn test_predicate_may_read_the_registry() {
	let fx = Fixture::start();
	let handle = fx.handle.clone();
	let adder = thread::spawn(move || {
		for i in 0..20 {
			handle.add_device(&format!("usb-{i}"), "Pixel", DeviceKind::Usb);
		}
	});

	let manager = fx.manager.clone();
	let device = fx
		.manager
		.get_device_matching(
			move |d| {
				let count = manager.enumerate_devices().map_or(0, |devices| devices.len());
				count > 0 && d.id() == "usb-19"
			},
			EVENT_WAIT,
			None,
		)
		.expect("Failed to find usb-19");
	adder.join().unwrap();
	assert_eq!(device.id(), "usb-19");
}
