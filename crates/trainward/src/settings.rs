use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Construction-time settings for a [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
	/// Base pipeline configuration the generated config is derived from.
	pub config_path: PathBuf,
	pub model_dir: PathBuf,
	#[serde(default)]
	pub base_checkpoint: Option<PathBuf>,
	/// Where generated configs are written. System temp dir when unset.
	#[serde(default)]
	pub temp_dir: Option<PathBuf>,
	#[serde(default)]
	pub trainer: TrainerCommand,
	#[serde(default)]
	pub logs: LogSettings,
	#[serde(default)]
	pub watchdog: WatchdogSettings,
	#[serde(default = "default_early_failure_ms")]
	pub early_failure_ms: u64,
	#[serde(default = "default_terminate_grace")]
	pub terminate_grace_secs: u64,
	#[serde(default = "default_shutdown_timeout")]
	pub shutdown_timeout_secs: u64,
}

impl SupervisorConfig {
	pub fn new(config_path: impl Into<PathBuf>, model_dir: impl Into<PathBuf>) -> Self {
		Self {
			config_path: config_path.into(),
			model_dir: model_dir.into(),
			base_checkpoint: None,
			temp_dir: None,
			trainer: TrainerCommand::default(),
			logs: LogSettings::default(),
			watchdog: WatchdogSettings::default(),
			early_failure_ms: default_early_failure_ms(),
			terminate_grace_secs: default_terminate_grace(),
			shutdown_timeout_secs: default_shutdown_timeout(),
		}
	}
}

fn default_early_failure_ms() -> u64 {
	500
}
fn default_terminate_grace() -> u64 {
	10
}
fn default_shutdown_timeout() -> u64 {
	5
}

/// The training toolkit invocation. Supervisor-owned flags are appended after `train_args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerCommand {
	#[serde(default = "default_program")]
	pub program: String,
	#[serde(default = "default_train_args")]
	pub train_args: Vec<String>,
	#[serde(default = "default_export_args")]
	pub export_args: Vec<String>,
}

impl Default for TrainerCommand {
	fn default() -> Self {
		Self {
			program: default_program(),
			train_args: default_train_args(),
			export_args: default_export_args(),
		}
	}
}

fn default_program() -> String {
	"python3".to_string()
}
fn default_train_args() -> Vec<String> {
	vec!["-m".into(), "easy_rec.python.train_eval".into()]
}
fn default_export_args() -> Vec<String> {
	vec!["-m".into(), "easy_rec.python.export".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
	#[serde(default = "default_max_size")]
	pub max_size_bytes: u64,
	/// Rotated generations kept per stream.
	#[serde(default = "default_retention")]
	pub retention: usize,
	/// In-memory tail capacity per stream, in lines.
	#[serde(default = "default_tail_lines")]
	pub tail_lines: usize,
}

impl Default for LogSettings {
	fn default() -> Self {
		Self {
			max_size_bytes: default_max_size(),
			retention: default_retention(),
			tail_lines: default_tail_lines(),
		}
	}
}

fn default_max_size() -> u64 {
	5 * 1024 * 1024
}
fn default_retention() -> usize {
	5
}
fn default_tail_lines() -> usize {
	500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
	/// Idle time after which the checkpoint directory is consulted.
	#[serde(default = "default_heartbeat_timeout")]
	pub heartbeat_timeout_secs: u64,
	/// Idle time (without checkpoint progress) after which the trainer counts as hung.
	#[serde(default = "default_hung_restart")]
	pub hung_restart_secs: u64,
}

impl Default for WatchdogSettings {
	fn default() -> Self {
		Self {
			heartbeat_timeout_secs: default_heartbeat_timeout(),
			hung_restart_secs: default_hung_restart(),
		}
	}
}

fn default_heartbeat_timeout() -> u64 {
	30
}
fn default_hung_restart() -> u64 {
	90
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_from_minimal_toml() {
		let cfg: SupervisorConfig = toml::from_str(
			r#"
config_path = "configs/online.config"
model_dir = "models/online"
"#,
		)
		.unwrap();
		assert_eq!(cfg.trainer.program, "python3");
		assert_eq!(cfg.trainer.train_args, vec!["-m", "easy_rec.python.train_eval"]);
		assert_eq!(cfg.logs.max_size_bytes, 5 * 1024 * 1024);
		assert_eq!(cfg.logs.retention, 5);
		assert_eq!(cfg.logs.tail_lines, 500);
		assert_eq!(cfg.watchdog.heartbeat_timeout_secs, 30);
		assert_eq!(cfg.watchdog.hung_restart_secs, 90);
		assert_eq!(cfg.early_failure_ms, 500);
	}

	#[test]
	fn partial_tables_keep_other_defaults() {
		let cfg: SupervisorConfig = toml::from_str(
			r#"
config_path = "c"
model_dir = "m"

[trainer]
program = "/opt/venv/bin/python"

[watchdog]
hung_restart_secs = 120
"#,
		)
		.unwrap();
		assert_eq!(cfg.trainer.program, "/opt/venv/bin/python");
		assert_eq!(cfg.trainer.export_args, vec!["-m", "easy_rec.python.export"]);
		assert_eq!(cfg.watchdog.heartbeat_timeout_secs, 30);
		assert_eq!(cfg.watchdog.hung_restart_secs, 120);
	}
}
