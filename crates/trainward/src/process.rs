use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::error::{Result, SupervisorError};
use crate::settings::SupervisorConfig;

/// Marker the trainer polls for; its presence requests a graceful shutdown.
pub const STOP_SIGNAL_FILE: &str = "OSS_STOP_SIGNAL";

/// Library and search-path variables callers may not override.
pub const ENV_DENYLIST: &[&str] = &[
	"LD_PRELOAD",
	"LD_LIBRARY_PATH",
	"LD_AUDIT",
	"DYLD_INSERT_LIBRARIES",
	"DYLD_LIBRARY_PATH",
	"DYLD_FALLBACK_LIBRARY_PATH",
	"DYLD_FRAMEWORK_PATH",
	"PYTHONPATH",
	"PYTHONHOME",
	"PYTHONSTARTUP",
	"PATH",
];

pub fn stop_signal_path(model_dir: &Path) -> PathBuf {
	model_dir.join(STOP_SIGNAL_FILE)
}

pub fn is_denied_env(key: &str) -> bool {
	ENV_DENYLIST.iter().any(|d| d.eq_ignore_ascii_case(key))
}

/// Overrides minus denylisted keys, sorted by key.
pub fn filter_env(overrides: &HashMap<String, String>) -> Vec<(String, String)> {
	let mut kept: Vec<(String, String)> = Vec::with_capacity(overrides.len());
	for (key, val) in overrides {
		if key.is_empty() || key.contains('=') || key.contains('\0') {
			tracing::warn!("dropping malformed env override {:?}", key);
			continue;
		}
		if is_denied_env(key) {
			tracing::warn!("dropping denylisted env override {}", key);
			continue;
		}
		kept.push((key.clone(), val.clone()));
	}
	kept.sort();
	kept
}

/// Full trainer argument list after the program name.
pub fn trainer_args(config: &SupervisorConfig, generated_config: &Path) -> Vec<OsString> {
	let mut args: Vec<OsString> = config.trainer.train_args.iter().map(OsString::from).collect();
	args.push("--pipeline_config_path".into());
	args.push(generated_config.into());
	args.push("--model_dir".into());
	args.push(config.model_dir.as_os_str().to_os_string());
	args.push("--continue_train".into());
	if let Some(base) = &config.base_checkpoint {
		args.push("--fine_tune_checkpoint".into());
		args.push(base.as_os_str().to_os_string());
	}
	args
}

/// Spawns the trainer in its own process group with piped output.
pub fn spawn_trainer(
	config: &SupervisorConfig,
	generated_config: &Path,
	env: &[(String, String)],
) -> Result<Child> {
	let args = trainer_args(config, generated_config);
	tracing::info!(
		"starting training: {} {}",
		config.trainer.program,
		args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
	);

	let mut cmd = Command::new(&config.trainer.program);
	cmd.args(&args)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.process_group(0)
		.kill_on_drop(true);

	for (key, val) in env {
		cmd.env(key, val);
	}

	cmd.spawn().map_err(SupervisorError::Spawn)
}

/// Exit code with signal deaths reported as the negated signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
	status
		.code()
		.or_else(|| status.signal().map(|s| -s))
		.unwrap_or(-1)
}

/// Polls the child without blocking. `None` while it is still running.
pub fn poll_exit(child: &mut Child) -> Option<i32> {
	match child.try_wait() {
		Ok(Some(status)) => Some(exit_code(status)),
		Ok(None) => None,
		Err(e) => {
			tracing::warn!("failed to poll training process: {}", e);
			None
		}
	}
}

pub fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;
	if pid == 0 {
		return;
	}
	if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
		tracing::debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
	}
}

/// Waits for a graceful exit, then escalates: SIGTERM to the group, then SIGKILL.
pub async fn shutdown_child(
	child: &mut Child,
	pid: u32,
	graceful: Duration,
	terminate_grace: Duration,
) -> Option<i32> {
	use nix::sys::signal::Signal;

	if let Some(code) = wait_for(child, graceful).await {
		return Some(code);
	}

	tracing::warn!("training did not exit gracefully; terminating");
	signal_group(pid, Signal::SIGTERM);
	if let Some(code) = wait_for(child, terminate_grace).await {
		return Some(code);
	}

	tracing::error!("terminate timeout; killing training process");
	kill_now(child, pid).await
}

/// SIGKILL to the whole group and reap.
pub async fn kill_now(child: &mut Child, pid: u32) -> Option<i32> {
	signal_group(pid, nix::sys::signal::Signal::SIGKILL);
	if let Err(e) = child.start_kill() {
		tracing::debug!("start_kill: {}", e);
	}
	wait_for(child, Duration::from_secs(5)).await
}

async fn wait_for(child: &mut Child, limit: Duration) -> Option<i32> {
	match tokio::time::timeout(limit, child.wait()).await {
		Ok(Ok(status)) => Some(exit_code(status)),
		Ok(Err(e)) => {
			tracing::warn!("failed to wait for training process: {}", e);
			None
		}
		Err(_) => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn denylist_is_case_insensitive() {
		let mut env = HashMap::new();
		env.insert("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string());
		env.insert("pythonpath".to_string(), "/tmp".to_string());
		env.insert("Path".to_string(), "/tmp".to_string());
		env.insert("CUDA_VISIBLE_DEVICES".to_string(), "0".to_string());
		env.insert("BAD=KEY".to_string(), "x".to_string());
		env.insert("OMP_NUM_THREADS".to_string(), "4".to_string());

		let kept = filter_env(&env);
		assert_eq!(
			kept,
			vec![
				("CUDA_VISIBLE_DEVICES".to_string(), "0".to_string()),
				("OMP_NUM_THREADS".to_string(), "4".to_string()),
			]
		);
	}

	#[test]
	fn args_include_warm_start_when_configured() {
		let mut cfg = SupervisorConfig::new("/cfg/base.config", "/models/online");
		let args = trainer_args(&cfg, Path::new("/tmp/gen.config"));
		let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().to_string()).collect();
		assert_eq!(
			args,
			vec![
				"-m",
				"easy_rec.python.train_eval",
				"--pipeline_config_path",
				"/tmp/gen.config",
				"--model_dir",
				"/models/online",
				"--continue_train",
			]
		);

		cfg.base_checkpoint = Some("/models/offline/model.ckpt-1000".into());
		let args = trainer_args(&cfg, Path::new("/tmp/gen.config"));
		let tail: Vec<String> = args[args.len() - 2..].iter().map(|a| a.to_string_lossy().to_string()).collect();
		assert_eq!(tail, vec!["--fine_tune_checkpoint", "/models/offline/model.ckpt-1000"]);
	}

	#[tokio::test]
	async fn escalates_to_kill() {
		let mut child = Command::new("sh")
			.args(["-c", "trap '' TERM; while true; do sleep 0.1; done"])
			.process_group(0)
			.kill_on_drop(true)
			.spawn()
			.unwrap();
		let pid = child.id().unwrap();
		// give the shell time to install the trap
		tokio::time::sleep(Duration::from_millis(200)).await;

		let code = shutdown_child(&mut child, pid, Duration::from_millis(200), Duration::from_millis(300)).await;
		assert_eq!(code, Some(-9));
	}

	#[tokio::test]
	async fn terminate_is_enough_for_cooperative_child() {
		let mut child = Command::new("sleep").arg("30").process_group(0).kill_on_drop(true).spawn().unwrap();
		let pid = child.id().unwrap();
		let code = shutdown_child(&mut child, pid, Duration::from_millis(100), Duration::from_secs(5)).await;
		assert_eq!(code, Some(-15));
	}
}
