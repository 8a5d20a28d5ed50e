use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
	Idle,
	Starting,
	Running,
	Stopping,
	Stopped,
	Failed,
}

impl TrainerState {
	pub fn is_running(&self) -> bool {
		matches!(self, TrainerState::Running)
	}

	/// Whether an explicit `start` may be issued from this state.
	pub fn can_start(&self) -> bool {
		matches!(self, TrainerState::Idle | TrainerState::Stopped | TrainerState::Failed)
	}
}

/// Message-queue source templated into the generated config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
	/// Comma-separated `host:port` bootstrap list.
	#[serde(default)]
	pub servers: String,
	#[serde(default)]
	pub topic: String,
	#[serde(default = "default_group")]
	pub group: String,
	/// Start offset timestamp. Defaults to "now" at generation time.
	#[serde(default)]
	pub offset_time: Option<String>,
}

fn default_group() -> String {
	"easyrec_online".to_string()
}

impl StreamingConfig {
	pub fn new(servers: impl Into<String>, topic: impl Into<String>) -> Self {
		Self {
			servers: servers.into(),
			topic: topic.into(),
			group: default_group(),
			offset_time: None,
		}
	}

	pub fn validate(&self) -> Result<()> {
		let mut missing = Vec::new();
		if self.servers.trim().is_empty() {
			missing.push("servers");
		}
		if self.topic.trim().is_empty() {
			missing.push("topic");
		}
		if !missing.is_empty() {
			return Err(SupervisorError::InvalidConfig(format!(
				"missing required fields: {}",
				missing.join(", ")
			)));
		}

		let mut bad = Vec::new();
		let mut valid = 0;
		for part in self.servers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
			if is_host_port(part) {
				valid += 1;
			} else {
				bad.push(part);
			}
		}
		if !bad.is_empty() {
			return Err(SupervisorError::InvalidConfig(format!(
				"invalid bootstrap server entries: {}",
				bad.join(", ")
			)));
		}
		if valid == 0 {
			return Err(SupervisorError::InvalidConfig(
				"no bootstrap servers given".to_string(),
			));
		}
		Ok(())
	}
}

fn is_host_port(entry: &str) -> bool {
	let Some((host, port)) = entry.rsplit_once(':') else {
		return false;
	};
	if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
		return false;
	}
	matches!(port.parse::<u32>(), Ok(p) if (1..=65535).contains(&p))
}

/// Incremental-checkpoint settings for the training block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfig {
	#[serde(default = "default_save_steps")]
	pub dense_save_steps: u64,
	#[serde(default = "default_save_steps")]
	pub sparse_save_steps: u64,
	#[serde(default = "default_true")]
	pub enable_stop_signal: bool,
	/// Periodic full-checkpoint interval.
	#[serde(default = "default_full_save_steps")]
	pub save_checkpoints_steps: u64,
}

impl Default for UpdateConfig {
	fn default() -> Self {
		Self {
			dense_save_steps: default_save_steps(),
			sparse_save_steps: default_save_steps(),
			enable_stop_signal: true,
			save_checkpoints_steps: default_full_save_steps(),
		}
	}
}

fn default_save_steps() -> u64 {
	100
}
fn default_full_save_steps() -> u64 {
	500
}
fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
	pub streaming: StreamingConfig,
	#[serde(default)]
	pub update: Option<UpdateConfig>,
	#[serde(default = "default_max_restarts")]
	pub max_restarts: u32,
	#[serde(default = "default_backoff")]
	pub backoff_secs: u64,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default = "default_watchdog_interval")]
	pub watchdog_interval_secs: u64,
}

impl StartRequest {
	pub fn new(streaming: StreamingConfig) -> Self {
		Self {
			streaming,
			update: None,
			max_restarts: default_max_restarts(),
			backoff_secs: default_backoff(),
			env: HashMap::new(),
			watchdog_interval_secs: default_watchdog_interval(),
		}
	}
}

fn default_max_restarts() -> u32 {
	3
}
fn default_backoff() -> u64 {
	10
}
fn default_watchdog_interval() -> u64 {
	5
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
	pub max_restarts: u32,
	pub backoff_secs: u64,
}

impl Default for RestartPolicy {
	fn default() -> Self {
		Self {
			max_restarts: default_max_restarts(),
			backoff_secs: default_backoff(),
		}
	}
}

/// Partial policy change. Signed so that negative input is rejected instead of wrapped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
	#[serde(default)]
	pub max_restarts: Option<i64>,
	#[serde(default)]
	pub backoff_secs: Option<i64>,
}

impl RestartPolicy {
	/// Returns the policy with `update` applied, leaving `self` untouched on error.
	pub fn merged(&self, update: &PolicyUpdate) -> Result<RestartPolicy> {
		let mut next = *self;
		if let Some(max) = update.max_restarts {
			next.max_restarts = u32::try_from(max).map_err(|_| {
				SupervisorError::InvalidPolicy(format!("max_restarts must be in 0..={}, got {}", u32::MAX, max))
			})?;
		}
		if let Some(backoff) = update.backoff_secs {
			next.backoff_secs = u64::try_from(backoff).map_err(|_| {
				SupervisorError::InvalidPolicy(format!("backoff_secs must be non-negative, got {}", backoff))
			})?;
		}
		Ok(next)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
	Stdout,
	Stderr,
	Both,
}

impl LogStream {
	pub fn includes_stdout(&self) -> bool {
		matches!(self, LogStream::Stdout | LogStream::Both)
	}

	pub fn includes_stderr(&self) -> bool {
		matches!(self, LogStream::Stderr | LogStream::Both)
	}
}

impl std::str::FromStr for LogStream {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"stdout" => Ok(LogStream::Stdout),
			"stderr" => Ok(LogStream::Stderr),
			"both" => Ok(LogStream::Both),
			other => Err(format!("unknown stream: {} (expected stdout, stderr or both)", other)),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogTail {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stdout: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stderr: Option<Vec<String>>,
}

/// Path and modification time of a checkpoint artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRef {
	pub path: PathBuf,
	/// Unix milliseconds.
	pub modified_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
	pub state: TrainerState,
	pub is_training: bool,
	pub heartbeat_age_secs: f64,
	pub restarts: u32,
	pub max_restarts: u32,
	pub process_exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
	#[serde(flatten)]
	pub health: HealthSnapshot,
	pub model_dir: PathBuf,
	pub config_path: PathBuf,
	pub generated_config_path: Option<PathBuf>,
	pub base_checkpoint: Option<PathBuf>,
	pub process_id: Option<u32>,
	pub latest_checkpoint: Option<PathBuf>,
	pub num_checkpoints: usize,
	pub log_tail: LogTail,
	pub watchdog_interval_secs: u64,
	pub backoff_secs: u64,
	pub last_progress_age_secs: f64,
	pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateFile {
	pub file: String,
	pub path: PathBuf,
	pub size: u64,
	pub modified_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IncrementalUpdates {
	pub available: bool,
	pub files: Vec<UpdateFile>,
}
