use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
	/// The base configuration document could not be read.
	#[error("cannot read base config {}: {source}", .path.display())]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// Malformed streaming parameters. Nothing was spawned.
	#[error("invalid streaming config: {0}")]
	InvalidConfig(String),

	#[error("training already in progress")]
	AlreadyRunning,

	/// The trainer exited inside the early-failure window. Not counted as a restart.
	#[error("training process exited immediately (exit {})", fmt_code(.code))]
	ImmediateExit { code: Option<i32> },

	#[error("failed to spawn training process: {0}")]
	Spawn(#[source] std::io::Error),

	#[error("invalid restart policy: {0}")]
	InvalidPolicy(String),

	#[error("model export failed: {0}")]
	ExportFailed(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

fn fmt_code(code: &Option<i32>) -> String {
	match code {
		Some(c) => c.to_string(),
		None => "signal".to_string(),
	}
}
