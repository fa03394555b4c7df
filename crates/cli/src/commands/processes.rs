use glob::{MatchOptions, Pattern};
use telco::{DeviceManager, SpawnOptions, Timeout};

use super::{emit, select_device};
use crate::cli::{Cli, PsArgs, SpawnArgs, TargetArgs};
use crate::error::{CliError, Result};
use crate::output::{ApplicationsData, PidData, ProcessesData};

pub fn ps(cli: &Cli, manager: &DeviceManager, args: &PsArgs) -> Result<()> {
	let device = select_device(cli, manager, Timeout::NoWait)?;
	let filter = name_filter(args.pattern.as_deref())?;

	if args.applications {
		let mut applications = device.enumerate_applications()?;
		applications.retain(|a| filter(&a.name));
		emit("ps", Some(&device), ApplicationsData { applications }, cli.format);
	} else {
		let mut processes = device.enumerate_processes()?;
		processes.retain(|p| filter(&p.name));
		emit("ps", Some(&device), ProcessesData { processes }, cli.format);
	}
	Ok(())
}

/// Case-insensitive glob over names; everything passes without a pattern.
fn name_filter(pattern: Option<&str>) -> Result<impl Fn(&str) -> bool> {
	let pattern = pattern
		.map(|p| Pattern::new(p).map_err(|e| CliError::InvalidInput(format!("bad pattern '{p}': {e}"))))
		.transpose()?;
	let options = MatchOptions {
		case_sensitive: false,
		..MatchOptions::new()
	};
	Ok(move |name: &str| pattern.as_ref().is_none_or(|p| p.matches_with(name, options)))
}

pub fn spawn(cli: &Cli, manager: &DeviceManager, args: &SpawnArgs) -> Result<()> {
	let device = select_device(cli, manager, Timeout::NoWait)?;

	let mut options = SpawnOptions::new().stdio(args.stdio.into());
	if !args.args.is_empty() {
		let argv = std::iter::once(args.program.clone()).chain(args.args.iter().cloned());
		options = options.argv(argv);
	}
	if !args.env.is_empty() {
		options = options.env(args.env.iter().cloned());
	}
	if let Some(cwd) = &args.cwd {
		options = options.cwd(cwd);
	}

	let pid = device.spawn(&args.program, options)?;
	tracing::info!(pid, program = %args.program, "spawned");
	if args.resume {
		device.resume(pid)?;
	}

	let data = PidData {
		pid,
		resumed: Some(args.resume),
	};
	emit("spawn", Some(&device), data, cli.format);
	Ok(())
}

pub fn resume(cli: &Cli, manager: &DeviceManager, args: &TargetArgs) -> Result<()> {
	let device = select_device(cli, manager, Timeout::NoWait)?;
	let pid = resolve_pid(&device, args)?;
	device.resume(pid)?;
	emit("resume", Some(&device), PidData { pid, resumed: None }, cli.format);
	Ok(())
}

pub fn kill(cli: &Cli, manager: &DeviceManager, args: &TargetArgs) -> Result<()> {
	let device = select_device(cli, manager, Timeout::NoWait)?;
	let pid = resolve_pid(&device, args)?;
	device.kill(pid)?;
	emit("kill", Some(&device), PidData { pid, resumed: None }, cli.format);
	Ok(())
}

/// Names resolve against the process list so the output can report the PID.
fn resolve_pid(device: &telco::Device, args: &TargetArgs) -> Result<u32> {
	match args.process_target() {
		telco::ProcessTarget::Pid(pid) => Ok(pid),
		telco::ProcessTarget::Name(name) => Ok(device.get_process(&name)?.pid),
	}
}
