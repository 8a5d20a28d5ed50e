use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::checkpoints;
use crate::config_gen;
use crate::error::{Result, SupervisorError};
use crate::heartbeat::Heartbeat;
use crate::logs;
use crate::output::{LogPipeline, OutputCapture};
use crate::process;
use crate::settings::SupervisorConfig;
use crate::types::*;
use crate::watchdog::{self, WatchdogHandle};

const STATUS_TAIL_LINES: usize = 20;
const PIPELINE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const EARLY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervises a single long-running training process.
///
/// Construct once and share the `Arc` with whatever serves the control surface.
pub struct Supervisor {
	pub(crate) config: SupervisorConfig,
	pub(crate) state: Mutex<SupervisorState>,
	pub(crate) heartbeat: Arc<Heartbeat>,
	pub(crate) stdout: OutputCapture,
	pub(crate) stderr: OutputCapture,
}

pub(crate) struct SupervisorState {
	pub(crate) phase: TrainerState,
	pub(crate) process: Option<ProcessHandle>,
	pub(crate) restarts: u32,
	pub(crate) policy: RestartPolicy,
	pub(crate) watchdog_interval_secs: u64,
	/// Parameters of the last successful start, reused by watchdog restarts.
	pub(crate) last_start: Option<StartRequest>,
	pub(crate) watchdog: Option<WatchdogHandle>,
	pub(crate) generated_config: Option<PathBuf>,
	pub(crate) last_exit_code: Option<i32>,
	pub(crate) last_failure: Option<String>,
}

pub(crate) struct ProcessHandle {
	pub(crate) child: Child,
	pub(crate) pid: u32,
	pub(crate) pipeline: LogPipeline,
	pub(crate) exit_code: Option<i32>,
}

impl ProcessHandle {
	pub(crate) fn new(child: Child, pipeline: LogPipeline) -> Self {
		let pid = child.id().unwrap_or(0);
		Self {
			child,
			pid,
			pipeline,
			exit_code: None,
		}
	}

	/// Exit code once the process is gone. Sticky after the first observation.
	pub(crate) fn poll(&mut self) -> Option<i32> {
		if self.exit_code.is_none() {
			self.exit_code = process::poll_exit(&mut self.child);
		}
		self.exit_code
	}
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Result<Arc<Self>> {
		std::fs::create_dir_all(&config.model_dir)?;

		let heartbeat = Arc::new(Heartbeat::new());
		let stdout = OutputCapture::new(
			logs::stdout_log_path(&config.model_dir),
			&config.logs,
			Arc::clone(&heartbeat),
		);
		let stderr = OutputCapture::new(
			logs::stderr_log_path(&config.model_dir),
			&config.logs,
			Arc::clone(&heartbeat),
		);

		Ok(Arc::new(Self {
			config,
			state: Mutex::new(SupervisorState {
				phase: TrainerState::Idle,
				process: None,
				restarts: 0,
				policy: RestartPolicy::default(),
				watchdog_interval_secs: 5,
				last_start: None,
				watchdog: None,
				generated_config: None,
				last_exit_code: None,
				last_failure: None,
			}),
			heartbeat,
			stdout,
			stderr,
		}))
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	pub async fn state(&self) -> TrainerState {
		self.state.lock().await.phase
	}

	/// Generates the run config, spawns the trainer and arms the watchdog.
	///
	/// Returns [`SupervisorError::ImmediateExit`] if the trainer dies inside the
	/// early-failure window; that attempt is not counted as a restart.
	pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<()> {
		request.streaming.validate()?;
		let env = process::filter_env(&request.env);

		let (previous, stale) = {
			let mut st = self.state.lock().await;
			if !st.phase.can_start() {
				tracing::warn!("training already in progress ({:?})", st.phase);
				return Err(SupervisorError::AlreadyRunning);
			}
			let previous = st.phase;
			st.phase = TrainerState::Starting;
			if let Some(old) = st.watchdog.take() {
				old.signal();
			}
			st.process = None;
			(previous, st.generated_config.take())
		};
		if let Some(path) = stale {
			remove_file_logged(&path, "stale generated config");
		}
		// a leftover marker would stop the new trainer right away
		remove_file_logged(&process::stop_signal_path(&self.config.model_dir), "stale stop signal");

		let generated = match config_gen::generate(
			&self.config.config_path,
			&request.streaming,
			request.update.as_ref(),
			self.config.temp_dir.as_deref(),
		) {
			Ok(p) => p,
			Err(e) => {
				tracing::error!("failed to start incremental training: {}", e);
				self.state.lock().await.phase = previous;
				return Err(e);
			}
		};

		let mut child = match process::spawn_trainer(&self.config, &generated, &env) {
			Ok(c) => c,
			Err(e) => {
				tracing::error!("failed to start incremental training: {}", e);
				remove_file_logged(&generated, "generated config");
				let mut st = self.state.lock().await;
				st.phase = TrainerState::Failed;
				st.last_failure = Some(e.to_string());
				return Err(e);
			}
		};

		self.heartbeat.reset();
		let mut pipeline = LogPipeline::attach(&mut child, &self.stdout, &self.stderr);

		tokio::time::sleep(Duration::from_millis(self.config.early_failure_ms)).await;
		if let Some(code) = process::poll_exit(&mut child) {
			pipeline.drain(EARLY_DRAIN_TIMEOUT).await;
			pipeline.stop(EARLY_DRAIN_TIMEOUT).await;
			let message = format!("training process exited immediately with code {}", code);
			tracing::error!("{}", message);
			self.stderr.note(&message).await;
			remove_file_logged(&generated, "generated config");

			let mut st = self.state.lock().await;
			st.phase = TrainerState::Failed;
			st.last_exit_code = Some(code);
			st.last_failure = Some(message);
			return Err(SupervisorError::ImmediateExit { code: Some(code) });
		}

		let handle = ProcessHandle::new(child, pipeline);
		let pid = handle.pid;
		// checkpoints already on disk are not progress of this run
		let watermark = checkpoints::latest_marker_mtime(&self.config.model_dir);
		{
			let mut st = self.state.lock().await;
			st.restarts = 0;
			st.policy = RestartPolicy {
				max_restarts: request.max_restarts,
				backoff_secs: request.backoff_secs,
			};
			st.watchdog_interval_secs = request.watchdog_interval_secs.max(1);
			st.last_start = Some(request);
			st.generated_config = Some(generated);
			st.process = Some(handle);
			st.last_exit_code = None;
			st.last_failure = None;
			self.heartbeat.reset();
			if let Some(mtime) = watermark {
				self.heartbeat.seed_checkpoint(mtime);
			}
			st.watchdog = Some(watchdog::spawn(Arc::clone(self)));
			st.phase = TrainerState::Running;
		}

		tracing::info!("incremental training started (pid {})", pid);
		self.stderr.note(&format!("training started (pid {})", pid)).await;
		Ok(())
	}

	/// Graceful-then-forceful stop. Returns `false` without side effects unless running.
	pub async fn stop(&self, timeout: Duration) -> bool {
		let (handle, watchdog, generated) = {
			let mut st = self.state.lock().await;
			if st.phase != TrainerState::Running {
				tracing::debug!("stop requested while {:?}; nothing to do", st.phase);
				return false;
			}
			st.phase = TrainerState::Stopping;
			let watchdog = st.watchdog.take();
			if let Some(w) = &watchdog {
				w.signal();
			}
			(st.process.take(), watchdog, st.generated_config.take())
		};

		let marker = process::stop_signal_path(&self.config.model_dir);
		if let Err(e) = std::fs::write(&marker, "stop") {
			tracing::warn!("failed to write stop signal {}: {}", marker.display(), e);
		}

		let mut exit_code = None;
		if let Some(mut handle) = handle {
			exit_code = match handle.poll() {
				Some(code) => Some(code),
				None => {
					process::shutdown_child(
						&mut handle.child,
						handle.pid,
						timeout,
						Duration::from_secs(self.config.terminate_grace_secs),
					)
					.await
				}
			};
			handle.pipeline.drain(Duration::from_secs(2)).await;
			handle.pipeline.stop(PIPELINE_JOIN_TIMEOUT).await;
		}

		if let Some(watchdog) = watchdog {
			watchdog.join(WATCHDOG_JOIN_TIMEOUT).await;
		}

		remove_file_logged(&marker, "stop signal");
		if let Some(path) = generated {
			remove_file_logged(&path, "generated config");
		}

		{
			let mut st = self.state.lock().await;
			st.phase = TrainerState::Stopped;
			st.last_exit_code = exit_code;
		}
		tracing::info!("incremental training stopped");
		self.stderr.note("training stopped").await;
		true
	}

	/// Process-level cleanup: stops a running trainer and removes anything left behind.
	pub async fn shutdown(&self) {
		self.stop(Duration::from_secs(self.config.shutdown_timeout_secs)).await;

		let (handle, generated) = {
			let mut st = self.state.lock().await;
			if let Some(w) = st.watchdog.take() {
				w.signal();
			}
			(st.process.take(), st.generated_config.take())
		};
		if let Some(mut handle) = handle {
			if handle.poll().is_none() {
				tracing::info!("shutdown: killing training process {}", handle.pid);
				process::kill_now(&mut handle.child, handle.pid).await;
			}
			handle.pipeline.stop(Duration::from_secs(1)).await;
		}
		if let Some(path) = generated {
			remove_file_logged(&path, "generated config");
		}
		remove_file_logged(&process::stop_signal_path(&self.config.model_dir), "stop signal");
	}

	pub async fn health(&self) -> HealthSnapshot {
		let mut st = self.state.lock().await;
		self.health_locked(&mut st)
	}

	fn health_locked(&self, st: &mut SupervisorState) -> HealthSnapshot {
		let process_exit_code = match st.process.as_mut() {
			Some(handle) => handle.poll(),
			None => st.last_exit_code,
		};
		HealthSnapshot {
			state: st.phase,
			is_training: st.phase.is_running(),
			heartbeat_age_secs: self.heartbeat.log_idle_secs(),
			restarts: st.restarts,
			max_restarts: st.policy.max_restarts,
			process_exit_code,
		}
	}

	pub async fn status(&self) -> StatusSnapshot {
		let (health, process_id, generated_config_path, watchdog_interval_secs, backoff_secs, last_failure) = {
			let mut st = self.state.lock().await;
			let health = self.health_locked(&mut st);
			(
				health,
				st.process.as_ref().map(|h| h.pid),
				st.generated_config.clone(),
				st.watchdog_interval_secs,
				st.policy.backoff_secs,
				st.last_failure.clone(),
			)
		};

		let checkpoints = checkpoints::list_checkpoints(&self.config.model_dir);
		StatusSnapshot {
			health,
			model_dir: self.config.model_dir.clone(),
			config_path: self.config.config_path.clone(),
			generated_config_path,
			base_checkpoint: self.config.base_checkpoint.clone(),
			process_id,
			latest_checkpoint: checkpoints.last().map(|c| c.path.clone()),
			num_checkpoints: checkpoints.len(),
			log_tail: self.tail_logs(STATUS_TAIL_LINES, LogStream::Both).await,
			watchdog_interval_secs,
			backoff_secs,
			last_progress_age_secs: self.heartbeat.progress_age_secs(),
			last_failure,
		}
	}

	/// Most recent captured lines per requested stream. Never touches the state lock.
	pub async fn tail_logs(&self, lines: usize, stream: LogStream) -> LogTail {
		LogTail {
			stdout: if stream.includes_stdout() {
				Some(self.stdout.tail(lines).await)
			} else {
				None
			},
			stderr: if stream.includes_stderr() {
				Some(self.stderr.tail(lines).await)
			} else {
				None
			},
		}
	}

	/// Applies to the next watchdog decision; a backoff already sleeping keeps its length.
	pub async fn update_restart_policy(&self, update: PolicyUpdate) -> Result<RestartPolicy> {
		let mut st = self.state.lock().await;
		st.policy = st.policy.merged(&update)?;
		tracing::info!(
			"restart policy updated: max_restarts={} backoff_secs={}",
			st.policy.max_restarts,
			st.policy.backoff_secs
		);
		Ok(st.policy)
	}

	pub async fn restart_policy(&self) -> RestartPolicy {
		self.state.lock().await.policy
	}

	/// Runs the toolkit's export command against the model directory.
	pub async fn export(&self, export_dir: &Path) -> Result<()> {
		std::fs::create_dir_all(export_dir)?;
		let trainer = &self.config.trainer;
		let mut cmd = tokio::process::Command::new(&trainer.program);
		cmd.args(&trainer.export_args)
			.arg("--pipeline_config_path")
			.arg(&self.config.config_path)
			.arg("--export_dir")
			.arg(export_dir)
			.arg("--checkpoint_path")
			.arg(&self.config.model_dir)
			.stdin(std::process::Stdio::null());
		tracing::info!("exporting model to {}", export_dir.display());

		let output = cmd.output().await.map_err(SupervisorError::Spawn)?;
		if output.status.success() {
			tracing::info!("model exported successfully to {}", export_dir.display());
			Ok(())
		} else {
			let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
			tracing::error!("model export failed: {}", stderr);
			Err(SupervisorError::ExportFailed(if stderr.is_empty() {
				format!("exit {}", process::exit_code(output.status))
			} else {
				stderr
			}))
		}
	}

	pub fn incremental_updates(&self) -> IncrementalUpdates {
		checkpoints::incremental_updates(&self.config.model_dir)
	}
}

pub(crate) fn remove_file_logged(path: &Path, what: &str) {
	match std::fs::remove_file(path) {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
		Err(e) => tracing::warn!("failed to remove {} {}: {}", what, path.display(), e),
	}
}
