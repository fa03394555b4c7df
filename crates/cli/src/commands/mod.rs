mod devices;
mod processes;

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use telco::host::{HostFixture, InProcessHost};
use telco::{Backend, Device, DeviceKind, DeviceManager, ManagerOptions, Timeout};

use crate::cli::{Cli, Commands, DeviceSelector};
use crate::error::Result;
use crate::output::{self, OutputFormat, Render, ResultBuilder};

/// Runs one command against a fresh device manager, closing it afterwards.
pub fn dispatch(cli: Cli) -> Result<()> {
	let manager = connect(cli.fixture.as_deref())?;
	let result = dispatch_command(&cli, &manager);
	manager.close();
	result
}

fn dispatch_command(cli: &Cli, manager: &DeviceManager) -> Result<()> {
	let name = cli.command.name();
	tracing::info!(command = name, "running command");

	match &cli.command {
		Commands::Devices => devices::list(manager, cli.format),
		Commands::Wait => devices::wait(cli, manager),
		Commands::Params => devices::params(cli, manager),
		Commands::Ps(args) => processes::ps(cli, manager, args),
		Commands::Spawn(args) => processes::spawn(cli, manager, args),
		Commands::Resume(args) => processes::resume(cli, manager, args),
		Commands::Kill(args) => processes::kill(cli, manager, args),
	}
}

fn connect(fixture: Option<&Path>) -> Result<DeviceManager> {
	let host = match fixture {
		Some(path) => {
			let fixture = HostFixture::from_path(path)
				.with_context(|| format!("loading fixture '{}'", path.display()))?;
			InProcessHost::from_fixture(&fixture)
				.with_context(|| format!("applying fixture '{}'", path.display()))?
		}
		None => InProcessHost::new(),
	};

	let options = ManagerOptions::from_env();
	tracing::debug!(backend = host.name(), ?options, "starting device manager");
	Ok(DeviceManager::with_backend(options, &host)?)
}

/// Resolves the device picked by `--device`, `--usb` or `--remote`.
///
/// `--timeout` overrides `default_timeout` for lookups that can wait.
pub(crate) fn select_device(cli: &Cli, manager: &DeviceManager, default_timeout: Timeout) -> Result<Device> {
	let timeout = cli.timeout.map_or(default_timeout, Timeout::from);
	let device = match cli.device_selector() {
		DeviceSelector::Local => manager.get_local_device()?,
		DeviceSelector::Usb => manager.get_usb_device(timeout)?,
		DeviceSelector::Remote => {
			manager.get_device_matching(|d| d.kind() == DeviceKind::Remote, timeout, None)?
		}
		DeviceSelector::Id(id) => manager.get_device(&id, timeout)?,
	};
	tracing::debug!(device = device.id(), "selected device");
	Ok(device)
}

pub(crate) fn emit<T: Serialize + Render>(
	command: &str,
	device: Option<&Device>,
	data: T,
	format: OutputFormat,
) {
	let mut builder = ResultBuilder::new(command).data(data);
	if let Some(device) = device {
		builder = builder.device(device.id());
	}
	output::print_result(&builder.build(), format);
}
