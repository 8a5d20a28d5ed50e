//! Background monitor for a running trainer.
//!
//! Each tick looks at two things: whether the process has exited, and whether it
//! has gone quiet. Silence alone is not a hang; a trainer that is busy writing a
//! checkpoint produces no output, so a newer checkpoint marker counts as progress.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checkpoints;
use crate::config_gen;
use crate::error::{Result, SupervisorError};
use crate::output::LogPipeline;
use crate::process;
use crate::supervisor::{remove_file_logged, ProcessHandle, Supervisor};
use crate::types::TrainerState;

const OLD_PIPELINE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct WatchdogHandle {
	stop: watch::Sender<bool>,
	task: JoinHandle<()>,
}

impl WatchdogHandle {
	/// Asks the loop to exit at its next wait point, including a pending backoff.
	pub(crate) fn signal(&self) {
		let _ = self.stop.send(true);
	}

	pub(crate) async fn join(self, timeout: Duration) {
		self.signal();
		let mut task = self.task;
		if tokio::time::timeout(timeout, &mut task).await.is_err() {
			tracing::warn!("watchdog did not exit in time; aborting");
			task.abort();
		}
	}
}

pub(crate) fn spawn(supervisor: Arc<Supervisor>) -> WatchdogHandle {
	let (stop, stop_rx) = watch::channel(false);
	let task = tokio::spawn(run(supervisor, stop_rx));
	WatchdogHandle { stop, task }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartReason {
	Exited { code: i32 },
	Hung { idle_secs: u64 },
}

impl fmt::Display for RestartReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RestartReason::Exited { code } => write!(f, "training process exited with code {}", code),
			RestartReason::Hung { idle_secs } => {
				write!(f, "training process hung (no output or checkpoint for {}s)", idle_secs)
			}
		}
	}
}

enum Decision {
	Healthy,
	Restart { reason: RestartReason, backoff: Duration },
	GiveUp { reason: RestartReason },
}

async fn run(supervisor: Arc<Supervisor>, mut stop: watch::Receiver<bool>) {
	tracing::debug!("watchdog started");
	loop {
		let interval = supervisor.state.lock().await.watchdog_interval_secs.max(1);
		if !sleep_or_stop(Duration::from_secs(interval), &mut stop).await {
			break;
		}

		match check(&supervisor, &stop).await {
			Decision::Healthy => {}
			Decision::GiveUp { reason } => {
				fail(&supervisor, reason, format!("{}; restart limit reached", reason)).await;
				break;
			}
			Decision::Restart { reason, backoff } => {
				if !sleep_or_stop(backoff, &mut stop).await {
					break;
				}
				match restart(&supervisor, &stop, reason).await {
					Ok(true) => {}
					Ok(false) => break,
					Err(e) => {
						tracing::error!("restart failed: {}", e);
						fail(&supervisor, reason, format!("restart after {} failed: {}", reason, e)).await;
						break;
					}
				}
			}
		}
	}
	tracing::debug!("watchdog exited");
}

/// Sleeps for `duration`. Returns false if the stop signal fired first.
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
	if *stop.borrow() {
		return false;
	}
	let interrupted = tokio::select! {
		_ = tokio::time::sleep(duration) => false,
		_ = stop.changed() => true,
	};
	!interrupted && !*stop.borrow()
}

async fn check(supervisor: &Supervisor, stop: &watch::Receiver<bool>) -> Decision {
	let exit_code = {
		let mut st = supervisor.state.lock().await;
		if st.phase != TrainerState::Running {
			return Decision::Healthy;
		}
		match st.process.as_mut() {
			Some(handle) => handle.poll(),
			None => return Decision::Healthy,
		}
	};

	let reason = match exit_code {
		Some(code) => RestartReason::Exited { code },
		None => {
			let limits = &supervisor.config.watchdog;
			let idle = supervisor.heartbeat.log_idle_secs();
			if idle <= limits.heartbeat_timeout_secs as f64 {
				return Decision::Healthy;
			}
			// quiet: a newer checkpoint still counts as progress
			if let Some(mtime) = checkpoints::latest_marker_mtime(&supervisor.config.model_dir) {
				if supervisor.heartbeat.record_checkpoint(mtime) {
					tracing::debug!("no output for {:.0}s but a new checkpoint appeared", idle);
					return Decision::Healthy;
				}
			}
			if idle <= limits.hung_restart_secs as f64 {
				tracing::debug!("no output for {:.0}s", idle);
				return Decision::Healthy;
			}
			RestartReason::Hung { idle_secs: idle as u64 }
		}
	};

	let mut st = supervisor.state.lock().await;
	if st.phase != TrainerState::Running || *stop.borrow() {
		return Decision::Healthy;
	}
	if st.restarts < st.policy.max_restarts {
		st.restarts += 1;
		tracing::warn!(
			"{}; restarting ({}/{}) in {}s",
			reason,
			st.restarts,
			st.policy.max_restarts,
			st.policy.backoff_secs
		);
		let note = format!(
			"{}; restart {}/{} in {}s",
			reason, st.restarts, st.policy.max_restarts, st.policy.backoff_secs
		);
		let backoff = Duration::from_secs(st.policy.backoff_secs);
		drop(st);
		supervisor.stderr.note(&note).await;
		Decision::Restart { reason, backoff }
	} else {
		tracing::error!("{}; max restarts ({}) reached", reason, st.policy.max_restarts);
		Decision::GiveUp { reason }
	}
}

/// Replaces the trainer with a fresh one built from the retained start parameters.
///
/// The state lock is only held to take the old handle out and to install the new
/// one; killing, draining and spawning happen unlocked. Returns `Ok(false)` when
/// the supervisor left the running state in the meantime.
async fn restart(
	supervisor: &Supervisor,
	stop: &watch::Receiver<bool>,
	reason: RestartReason,
) -> Result<bool> {
	let (request, old, stale) = {
		let mut st = supervisor.state.lock().await;
		if st.phase != TrainerState::Running || *stop.borrow() {
			return Ok(false);
		}
		let mut old = st.process.take();
		if let Some(handle) = old.as_mut() {
			st.last_exit_code = handle.poll();
		}
		(st.last_start.clone(), old, st.generated_config.take())
	};

	if let Some(mut old) = old {
		if old.poll().is_none() {
			tracing::warn!("killing unresponsive training process {}", old.pid);
			process::kill_now(&mut old.child, old.pid).await;
		}
		old.pipeline.drain(OLD_PIPELINE_TIMEOUT).await;
		old.pipeline.stop(OLD_PIPELINE_TIMEOUT).await;
	}
	if let Some(stale) = stale {
		remove_file_logged(&stale, "previous generated config");
	}

	let Some(request) = request else {
		return Err(SupervisorError::InvalidConfig("no start parameters to restart with".to_string()));
	};
	if *stop.borrow() {
		return Ok(false);
	}

	let config = &supervisor.config;
	let generated = config_gen::generate(
		&config.config_path,
		&request.streaming,
		request.update.as_ref(),
		config.temp_dir.as_deref(),
	)?;
	let env = process::filter_env(&request.env);
	let mut child = match process::spawn_trainer(config, &generated, &env) {
		Ok(c) => c,
		Err(e) => {
			remove_file_logged(&generated, "generated config");
			return Err(e);
		}
	};
	let pipeline = LogPipeline::attach(&mut child, &supervisor.stdout, &supervisor.stderr);
	let mut handle = ProcessHandle::new(child, pipeline);
	let pid = handle.pid;

	{
		let mut st = supervisor.state.lock().await;
		if st.phase == TrainerState::Running && !*stop.borrow() {
			st.process = Some(handle);
			st.generated_config = Some(generated);
			st.last_exit_code = None;
			supervisor.heartbeat.touch_all();
			drop(st);

			tracing::info!("training process restarted (pid {}) after: {}", pid, reason);
			supervisor
				.stderr
				.note(&format!("training restarted (pid {})", pid))
				.await;
			return Ok(true);
		}
	}

	// stopped while the replacement was starting
	tracing::info!("discarding replacement training process {}", pid);
	process::kill_now(&mut handle.child, pid).await;
	handle.pipeline.stop(OLD_PIPELINE_TIMEOUT).await;
	remove_file_logged(&generated, "generated config");
	Ok(false)
}

/// Marks the run failed and cleans up whatever process is left.
async fn fail(supervisor: &Supervisor, reason: RestartReason, message: String) {
	let (handle, generated) = {
		let mut st = supervisor.state.lock().await;
		if st.phase != TrainerState::Running {
			return;
		}
		st.phase = TrainerState::Failed;
		st.last_failure = Some(message.clone());
		(st.process.take(), st.generated_config.take())
	};
	supervisor.stderr.note(&message).await;

	if let Some(mut handle) = handle {
		let code = match handle.poll() {
			Some(code) => Some(code),
			None => {
				if let RestartReason::Hung { .. } = reason {
					tracing::warn!("killing hung training process {}", handle.pid);
				}
				process::kill_now(&mut handle.child, handle.pid).await
			}
		};
		handle.pipeline.drain(OLD_PIPELINE_TIMEOUT).await;
		handle.pipeline.stop(OLD_PIPELINE_TIMEOUT).await;

		let mut st = supervisor.state.lock().await;
		if st.phase == TrainerState::Failed {
			st.last_exit_code = code;
		}
	}
	if let Some(path) = generated {
		remove_file_logged(&path, "generated config");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reasons_read_well() {
		assert_eq!(
			RestartReason::Exited { code: -9 }.to_string(),
			"training process exited with code -9"
		);
		assert_eq!(
			RestartReason::Hung { idle_secs: 95 }.to_string(),
			"training process hung (no output or checkpoint for 95s)"
		);
	}

	#[tokio::test]
	async fn sleep_is_cut_short_by_stop() {
		let (tx, mut rx) = watch::channel(false);
		let waiter = tokio::spawn(async move { sleep_or_stop(Duration::from_secs(30), &mut rx).await });
		tokio::time::sleep(Duration::from_millis(50)).await;
		tx.send(true).unwrap();
		let finished = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
		assert!(!finished);
	}

	#[tokio::test]
	async fn sleep_completes_without_stop() {
		let (_tx, mut rx) = watch::channel(false);
		assert!(sleep_or_stop(Duration::from_millis(10), &mut rx).await);
	}
}
