use clap::Parser;
use telco_cli::cli::Cli;
use telco_cli::error::CliError;
use telco_cli::output::{self, OutputFormat, ResultBuilder};
use telco_cli::{commands, logging};

// The device API blocks on its own runtime, so main stays synchronous.
fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let format = cli.format;
	let command = cli.command.name();

	if let Err(err) = commands::dispatch(cli) {
		handle_error(command, err, format);
		std::process::exit(1);
	}
}

fn handle_error(command: &'static str, err: CliError, format: OutputFormat) {
	let cmd_error = err.to_command_error();

	// humans read stderr
	output::print_error_stderr(&cmd_error);

	// scripts read the envelope
	if format == OutputFormat::Json {
		let result: output::CommandResult<()> = ResultBuilder::new(command)
			.error(cmd_error.code, &cmd_error.message)
			.build();
		output::print_result(&result, format);
	}
}
