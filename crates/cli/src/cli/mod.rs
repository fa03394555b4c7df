
use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Args, Parser, Subcommand, ValueEnum};
use telco::{ProcessTarget, Stdio};

use crate::output::OutputFormat;

/// Help colors in cargo's palette.
fn cli_styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default().bold())
		.usage(AnsiColor::Green.on_default().bold())
		.literal(AnsiColor::Cyan.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
		.valid(AnsiColor::Cyan.on_default())
}

/// Root CLI for telco.
#[derive(Parser, Debug)]
#[command(name = "telco")]
#[command(about = "Discover devices and control processes on them")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format: text (default) or json
	#[arg(short = 'f', long, global = true, value_enum, default_value = "text")]
	pub format: OutputFormat,

	/// Device id to operate on (defaults to the local device)
	#[arg(short = 'D', long, global = true, value_name = "ID", conflicts_with_all = ["usb", "remote"])]
	pub device: Option<String>,

	/// Operate on the first USB device
	#[arg(short = 'U', long, global = true, conflicts_with = "remote")]
	pub usb: bool,

	/// Operate on the first remote device
	#[arg(short = 'R', long, global = true)]
	pub remote: bool,

	/// Seconds to wait for the device to appear (negative waits forever)
	#[arg(long, global = true, value_name = "SECONDS", allow_negative_numbers = true)]
	pub timeout: Option<f64>,

	/// Host fixture (JSON) describing the devices and processes to serve
	#[arg(long, global = true, value_name = "FILE")]
	pub fixture: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// List connected devices.
	Devices,
	/// Wait until the selected device is present.
	Wait,
	/// Show the selected device's system parameters.
	Params,
	/// List processes (or applications) on the selected device.
	Ps(PsArgs),
	/// Spawn a program suspended.
	Spawn(SpawnArgs),
	/// Resume a spawned process.
	Resume(TargetArgs),
	/// Kill a process.
	Kill(TargetArgs),
}

impl Commands {
	/// Name used in the result envelope.
	pub fn name(&self) -> &'static str {
		match self {
			Commands::Devices => "devices",
			Commands::Wait => "wait",
			Commands::Params => "params",
			Commands::Ps(_) => "ps",
			Commands::Spawn(_) => "spawn",
			Commands::Resume(_) => "resume",
			Commands::Kill(_) => "kill",
		}
	}
}

/// Which device a command operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
	Local,
	Usb,
	Remote,
	Id(String),
}

impl Cli {
	pub fn device_selector(&self) -> DeviceSelector {
		if let Some(id) = &self.device {
			DeviceSelector::Id(id.clone())
		} else if self.usb {
			DeviceSelector::Usb
		} else if self.remote {
			DeviceSelector::Remote
		} else {
			DeviceSelector::Local
		}
	}
}

#[derive(Args, Debug, Clone)]
pub struct PsArgs {
	/// Only show entries whose name matches this glob
	#[arg(value_name = "PATTERN")]
	pub pattern: Option<String>,

	/// List installed applications instead of processes
	#[arg(short, long)]
	pub applications: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SpawnArgs {
	/// Program path on the device
	#[arg(value_name = "PROGRAM")]
	pub program: String,

	/// Arguments passed after argv[0]
	#[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
	pub args: Vec<String>,

	/// Environment variable to add (KEY=VALUE, repeatable)
	#[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
	pub env: Vec<(String, String)>,

	/// Working directory
	#[arg(long, value_name = "DIR")]
	pub cwd: Option<String>,

	/// How the process' standard streams are wired
	#[arg(long, value_enum, default_value = "inherit")]
	pub stdio: StdioArg,

	/// Resume the process right after spawning it
	#[arg(long)]
	pub resume: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StdioArg {
	#[default]
	Inherit,
	Pipe,
}

impl From<StdioArg> for Stdio {
	fn from(stdio: StdioArg) -> Self {
		match stdio {
			StdioArg::Inherit => Stdio::Inherit,
			StdioArg::Pipe => Stdio::Pipe,
		}
	}
}

#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
	/// PID, or a process name (glob patterns allowed)
	#[arg(value_name = "PID|NAME")]
	pub target: String,
}

impl TargetArgs {
	/// Numeric targets are PIDs, anything else is a name.
	pub fn process_target(&self) -> ProcessTarget {
		match self.target.parse::<u32>() {
			Ok(pid) => ProcessTarget::Pid(pid),
			Err(_) => ProcessTarget::Name(self.target.clone()),
		}
	}
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
	match s.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
		_ => Err(format!("expected KEY=VALUE, got '{s}'")),
	}
}
