// Integration tests for cancelling blocking calls
//
// Tests cover:
// - cancel() from another thread interrupts a wait promptly
// - cancel() is idempotent
// - the thread's current cancellable applies when none is passed
// - close() wakes waiters with server-not-running
// - bounds too large to represent wait until cancelled

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::Fixture;
use telco::{Cancellable, Error, ErrorKind, Timeout};

#[test]
fn test_cancel_from_another_thread_interrupts_wait() {
	let fx = Fixture::start();
	let cancellable = Cancellable::new();

	let canceller = {
		let cancellable = cancellable.clone();
		thread::spawn(move || {
			thread::sleep(Duration::from_millis(100));
			let cancelled_at = Instant::now();
			cancellable.cancel();
			cancelled_at
		})
	};

	let err = fx
		.manager
		.get_device_matching(|d| d.id() == "never", -1, Some(&cancellable))
		.unwrap_err();
	let returned_at = Instant::now();
	let cancelled_at = canceller.join().unwrap();

	assert_eq!(err.kind(), ErrorKind::Cancelled);
	assert!(err.to_string().contains("operation was cancelled"));
	assert!(
		returned_at.duration_since(cancelled_at) < Duration::from_millis(500),
		"cancellation was not prompt"
	);
}

#[test]
fn test_cancel_is_idempotent() {
	let cancellable = Cancellable::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&calls);
	cancellable.connect(move || {
		counter.fetch_add(1, Ordering::SeqCst);
	});

	cancellable.cancel();
	cancellable.cancel();

	assert!(cancellable.is_cancelled());
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(cancellable.raise_if_cancelled(), Err(Error::Cancelled));
}

#[test]
fn test_already_cancelled_fails_without_waiting() {
	let fx = Fixture::start();
	let cancellable = Cancellable::new();
	cancellable.cancel();

	let started = Instant::now();
	let err = fx
		.manager
		.get_device_matching(|d| d.id() == "never", Timeout::Forever, Some(&cancellable))
		.unwrap_err();

	assert!(err.is_cancelled());
	assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_current_cancellable_applies_to_blocking_calls() {
	let fx = Fixture::start();
	let cancellable = Cancellable::new();
	cancellable.push_current();

	let canceller = {
		let cancellable = cancellable.clone();
		thread::spawn(move || {
			thread::sleep(Duration::from_millis(50));
			cancellable.cancel();
		})
	};

	let err = fx.manager.get_usb_device(Timeout::Forever).unwrap_err();
	canceller.join().unwrap();
	cancellable.pop_current().expect("Failed to pop cancellable");

	assert!(err.is_cancelled());
	assert!(Cancellable::current().is_none());
}

#[test]
fn test_close_wakes_waiters() {
	let fx = Fixture::start();
	let manager = fx.manager.clone();

	let waiter = thread::spawn(move || manager.get_usb_device(Timeout::Forever));
	thread::sleep(Duration::from_millis(100));
	fx.manager.close();

	let err = waiter.join().unwrap().unwrap_err();
	assert_eq!(err.kind(), ErrorKind::ServerNotRunning);
	assert_eq!(err.to_string(), "device manager is not running");
}

#[test]
fn test_unrepresentable_timeouts_wait_until_cancelled() {
	let fx = Fixture::start();

	for timeout in [Timeout::After(Duration::MAX), Timeout::from(1e20)] {
		let cancellable = Cancellable::new();
		let canceller = {
			let cancellable = cancellable.clone();
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(50));
				cancellable.cancel();
			})
		};

		let err = fx
			.manager
			.get_device_matching(|d| d.id() == "never", timeout, Some(&cancellable))
			.unwrap_err();
		canceller.join().unwrap();
		assert_eq!(err.kind(), ErrorKind::Cancelled);
	}
}
