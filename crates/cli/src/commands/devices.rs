use telco::{DeviceManager, Timeout};

use super::{emit, select_device};
use crate::cli::Cli;
use crate::error::Result;
use crate::output::{DevicesData, OutputFormat, ParamsData};

pub fn list(manager: &DeviceManager, format: OutputFormat) -> Result<()> {
	let devices = manager
		.enumerate_devices()?
		.iter()
		.map(|d| d.info().clone())
		.collect();
	emit("devices", None, DevicesData { devices }, format);
	Ok(())
}

/// Waits forever unless `--timeout` says otherwise.
pub fn wait(cli: &Cli, manager: &DeviceManager) -> Result<()> {
	let device = select_device(cli, manager, Timeout::Forever)?;
	emit("wait", Some(&device), device.info().clone(), cli.format);
	Ok(())
}

pub fn params(cli: &Cli, manager: &DeviceManager) -> Result<()> {
	let device = select_device(cli, manager, Timeout::NoWait)?;
	let params = device.query_system_parameters()?;
	emit("params", Some(&device), ParamsData(params), cli.format);
	Ok(())
}
