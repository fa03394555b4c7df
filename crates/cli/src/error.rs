use thiserror::Error;

use crate::output::{CommandError, ErrorCode};

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	/// Failure reported by the device layer; keeps its kind
	#[error(transparent)]
	Telco(#[from] telco::Error),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

impl CliError {
	/// Convert this error to a CommandError for structured output
	pub fn to_command_error(&self) -> CommandError {
		let (code, message) = match self {
			CliError::Telco(err) => (ErrorCode::from(err.kind()), err.to_string()),
			CliError::InvalidInput(msg) => (ErrorCode::InvalidInput, msg.clone()),
			CliError::Io(err) => (ErrorCode::IoError, err.to_string()),
			CliError::Json(err) => (ErrorCode::InternalError, format!("JSON error: {err}")),
			// context chains keep the kind of the telco error at their root
			CliError::Anyhow(err) => {
				let code = err
					.downcast_ref::<telco::Error>()
					.map_or(ErrorCode::InternalError, |e| ErrorCode::from(e.kind()));
				(code, format!("{err:#}"))
			}
		};

		CommandError { code, message }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn telco_errors_keep_their_kind() {
		let err = CliError::from(telco::Error::ProcessNotFound(
			"unable to find process with pid 7".to_string(),
		));
		let cmd = err.to_command_error();
		assert_eq!(cmd.code, ErrorCode::ProcessNotFound);
		assert_eq!(cmd.message, "unable to find process with pid 7");

		let cmd = CliError::from(telco::Error::Rpc("Boom".to_string())).to_command_error();
		assert_eq!(cmd.code, ErrorCode::ScriptError);
		assert_eq!(cmd.message, "Boom");
	}

	#[test]
	fn anyhow_context_is_kept() {
		let err = anyhow::anyhow!("disk full").context("unable to write");
		let cmd = CliError::from(err).to_command_error();
		assert_eq!(cmd.code, ErrorCode::InternalError);
		assert_eq!(cmd.message, "unable to write: disk full");
	}

	#[test]
	fn anyhow_wrapping_a_telco_error_keeps_its_kind() {
		let err = anyhow::Error::new(telco::Error::InvalidArgument("bad fixture".to_string()))
			.context("loading fixture 'x.json'");
		let cmd = CliError::from(err).to_command_error();
		assert_eq!(cmd.code, ErrorCode::InvalidArgument);
		assert_eq!(cmd.message, "loading fixture 'x.json': bad fixture");
	}
}
