mod client;
mod config;
mod daemon;
mod paths;
mod protocol;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use owo_colors::OwoColorize;
use trainward::{HealthSnapshot, LogStream, LogTail, StartRequest, StatusSnapshot, StreamingConfig, TrainerState, UpdateConfig};

use client::DaemonClient;
use paths::DaemonPaths;
use protocol::{Request, Response};

fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();

	if args.is_empty() {
		print_usage();
		return;
	}

	let rest = &args[1..];
	match args[0].as_str() {
		"help" | "--help" | "-h" => print_usage(),
		"version" | "--version" | "-V" => println!("trainward {}", env!("CARGO_PKG_VERSION")),
		"daemon" => cmd_daemon(rest),
		"start" => cmd_start(rest),
		"stop" => cmd_stop(rest),
		"status" | "st" => cmd_status(),
		"health" => cmd_health(),
		"logs" => cmd_logs(rest),
		"policy" => cmd_policy(rest),
		"export" => cmd_export(rest),
		"updates" => cmd_updates(),
		"ping" => cmd_ping(),
		"shutdown" => cmd_shutdown(),
		other => {
			eprintln!("unknown command: {}", other);
			eprintln!("run 'trainward help' for usage");
			std::process::exit(1);
		}
	}
}

fn print_usage() {
	eprintln!("{} {} - incremental training supervisor", "trainward".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: {} <command> [options]", "trainward".bold());
	eprintln!();

	eprintln!("{}", "training".cyan().bold());
	eprintln!("  {} --servers <h:p,...> --topic <t>   Start streaming training", "start".bold());
	eprintln!("        [--group <g>] [--offset-time <YYYYmmdd HH:MM:SS>]");
	eprintln!("        [--max-restarts <n>] [--backoff <secs>] [--watchdog-interval <secs>]");
	eprintln!("        [--dense-save-steps <n>] [--sparse-save-steps <n>] [--save-checkpoints-steps <n>]");
	eprintln!("        [--no-stop-signal] [--env KEY=VALUE]...");
	eprintln!("  {} [--timeout <secs>]              Stop gracefully, then forcefully", "stop".bold());
	eprintln!("  {}                              Full status", "status".bold());
	eprintln!("  {}                              Health summary", "health".bold());
	eprintln!("  {} [--max-restarts <n>] [--backoff <secs>]  Show or change restart policy", "policy".bold());
	eprintln!();

	eprintln!("{}", "output".cyan().bold());
	eprintln!("  {} [--lines <n>] [--stream stdout|stderr|both]  Recent trainer output", "logs".bold());
	eprintln!("  {}                             Incremental update files", "updates".bold());
	eprintln!("  {} <dir>                        Export the model", "export".bold());
	eprintln!();

	eprintln!("{}", "system".cyan().bold());
	eprintln!("  {} [--config <file>] [--config-path <base>] [--model-dir <dir>] [--base-checkpoint <ckpt>]", "daemon".bold());
	eprintln!("                                      Run the daemon in the foreground");
	eprintln!("  {}                                Check the daemon", "ping".bold());
	eprintln!("  {}                            Stop training and the daemon", "shutdown".bold());
}

// --- Argument helpers ---

/// Splits `--flag value` pairs and bare `--switch`es from positional arguments.
struct Opts {
	values: HashMap<String, Vec<String>>,
	switches: Vec<String>,
	positional: Vec<String>,
}

const SWITCHES: &[&str] = &["--no-stop-signal"];

impl Opts {
	fn parse(args: &[String]) -> Opts {
		let mut opts = Opts {
			values: HashMap::new(),
			switches: Vec::new(),
			positional: Vec::new(),
		};
		let mut iter = args.iter();
		while let Some(arg) = iter.next() {
			if !arg.starts_with("--") {
				opts.positional.push(arg.clone());
				continue;
			}
			if let Some((flag, value)) = arg.split_once('=') {
				opts.values.entry(flag.to_string()).or_default().push(value.to_string());
			} else if SWITCHES.contains(&arg.as_str()) {
				opts.switches.push(arg.clone());
			} else {
				match iter.next() {
					Some(value) => opts.values.entry(arg.clone()).or_default().push(value.clone()),
					None => fail(format!("missing value for {}", arg)),
				}
			}
		}
		opts
	}

	fn get(&self, flag: &str) -> Option<&str> {
		self.values.get(flag).and_then(|v| v.last()).map(|s| s.as_str())
	}

	fn all(&self, flag: &str) -> &[String] {
		self.values.get(flag).map(|v| v.as_slice()).unwrap_or(&[])
	}

	fn has(&self, switch: &str) -> bool {
		self.switches.iter().any(|s| s == switch)
	}

	fn number<T: std::str::FromStr>(&self, flag: &str) -> Option<T> {
		self.get(flag).map(|v| v.parse().unwrap_or_else(|_| fail(format!("{} expects a number, got {:?}", flag, v))))
	}
}

fn fail(message: impl std::fmt::Display) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(1);
}

fn send(request: &Request, timeout: Option<Duration>) -> Response {
	let paths = DaemonPaths::from_env();
	let mut client = DaemonClient::connect(&paths).unwrap_or_else(|e| fail(e));
	match client.send(request, timeout) {
		Ok(Response::Error { message }) => fail(message),
		Ok(response) => response,
		Err(e) => fail(e),
	}
}

const QUERY_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

// --- Commands ---

fn cmd_daemon(args: &[String]) {
	let opts = Opts::parse(args);
	let paths = DaemonPaths::from_env();
	let config_file = opts.get("--config").map(PathBuf::from).unwrap_or_else(|| paths.config_file());
	let global = config::load_global_config(&config_file);
	let overrides = daemon::DaemonOverrides {
		config_path: opts.get("--config-path").map(PathBuf::from),
		model_dir: opts.get("--model-dir").map(PathBuf::from),
		base_checkpoint: opts.get("--base-checkpoint").map(PathBuf::from),
	};

	let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(format!("failed to start runtime: {}", e)));
	if let Err(e) = runtime.block_on(daemon::run(paths, global, overrides)) {
		fail(e);
	}
}

fn cmd_start(args: &[String]) {
	let opts = Opts::parse(args);
	let mut streaming = StreamingConfig::new(
		opts.get("--servers").unwrap_or_default(),
		opts.get("--topic").unwrap_or_default(),
	);
	if let Some(group) = opts.get("--group") {
		streaming.group = group.to_string();
	}
	streaming.offset_time = opts.get("--offset-time").map(str::to_string);

	let mut request = StartRequest::new(streaming);
	if let Some(n) = opts.number("--max-restarts") {
		request.max_restarts = n;
	}
	if let Some(n) = opts.number("--backoff") {
		request.backoff_secs = n;
	}
	if let Some(n) = opts.number("--watchdog-interval") {
		request.watchdog_interval_secs = n;
	}

	let tuned = ["--dense-save-steps", "--sparse-save-steps", "--save-checkpoints-steps"]
		.iter()
		.any(|f| opts.get(f).is_some())
		|| opts.has("--no-stop-signal");
	if tuned {
		let mut update = UpdateConfig::default();
		if let Some(n) = opts.number("--dense-save-steps") {
			update.dense_save_steps = n;
		}
		if let Some(n) = opts.number("--sparse-save-steps") {
			update.sparse_save_steps = n;
		}
		if let Some(n) = opts.number("--save-checkpoints-steps") {
			update.save_checkpoints_steps = n;
		}
		update.enable_stop_signal = !opts.has("--no-stop-signal");
		request.update = Some(update);
	}

	for pair in opts.all("--env") {
		match pair.split_once('=') {
			Some((k, v)) if !k.is_empty() => {
				request.env.insert(k.to_string(), v.to_string());
			}
			_ => fail(format!("--env expects KEY=VALUE, got {:?}", pair)),
		}
	}

	if let Err(e) = request.streaming.validate() {
		fail(e);
	}

	if let Response::Ok { message } = send(&Request::Start { request }, None) {
		eprintln!("{} {}", "●".green(), message.unwrap_or_default());
	}
}

fn cmd_stop(args: &[String]) {
	let opts = Opts::parse(args);
	let timeout_secs = opts.number("--timeout").unwrap_or_else(protocol::default_stop_timeout);
	if let Response::Ok { message } = send(&Request::Stop { timeout_secs }, None) {
		eprintln!("{}", message.unwrap_or_default());
	}
}

fn cmd_status() {
	if let Response::Status { status } = send(&Request::Status, QUERY_TIMEOUT) {
		render_status(&status);
	}
}

fn cmd_health() {
	if let Response::Health { health } = send(&Request::Health, QUERY_TIMEOUT) {
		render_health(&health);
	}
}

fn cmd_logs(args: &[String]) {
	let opts = Opts::parse(args);
	let lines = opts.number("--lines").unwrap_or_else(protocol::default_lines);
	let stream: LogStream = match opts.get("--stream") {
		Some(s) => s.parse().unwrap_or_else(|e: String| fail(e)),
		None => LogStream::Both,
	};
	if let Response::Logs { tail } = send(&Request::Logs { lines, stream }, QUERY_TIMEOUT) {
		render_tail(&tail);
	}
}

fn cmd_policy(args: &[String]) {
	let opts = Opts::parse(args);
	let request = Request::Policy {
		max_restarts: opts.number("--max-restarts"),
		backoff_secs: opts.number("--backoff"),
	};
	if let Response::Policy { policy } = send(&request, QUERY_TIMEOUT) {
		println!("max_restarts  {}", policy.max_restarts);
		println!("backoff       {}s", policy.backoff_secs);
	}
}

fn cmd_export(args: &[String]) {
	let opts = Opts::parse(args);
	let Some(dir) = opts.positional.first() else {
		fail("usage: trainward export <dir>");
	};
	let mut dir = PathBuf::from(dir);
	if dir.is_relative() {
		if let Ok(cwd) = std::env::current_dir() {
			dir = cwd.join(dir);
		}
	}
	if let Response::Ok { message } = send(&Request::Export { dir }, None) {
		eprintln!("{}", message.unwrap_or_default());
	}
}

fn cmd_updates() {
	if let Response::Updates { updates } = send(&Request::Updates, QUERY_TIMEOUT) {
		if !updates.available {
			eprintln!("no incremental updates yet");
			return;
		}
		for file in &updates.files {
			println!("{:<40} {:>10}  {}", file.file, format_size(file.size), format_mtime(file.modified_ms));
		}
	}
}

fn cmd_ping() {
	let paths = DaemonPaths::from_env();
	if let Response::Pong = send(&Request::Ping, QUERY_TIMEOUT) {
		match client::read_pid(&paths) {
			Some(pid) => eprintln!("daemon running (pid {})", pid),
			None => eprintln!("daemon running"),
		}
	}
}

fn cmd_shutdown() {
	let paths = DaemonPaths::from_env();
	if !client::is_running(&paths) {
		eprintln!("daemon not running");
		return;
	}
	if let Response::Ok { message } = send(&Request::Shutdown, QUERY_TIMEOUT) {
		eprintln!("daemon: {}", message.unwrap_or_default());
	}
}

// --- Rendering ---

fn state_label(state: TrainerState) -> String {
	match state {
		TrainerState::Running => format!("{} running", "●".green()),
		TrainerState::Starting => format!("{} starting", "●".yellow()),
		TrainerState::Stopping => format!("{} stopping", "●".yellow()),
		TrainerState::Stopped => format!("{} stopped", "○".dimmed()),
		TrainerState::Idle => format!("{} idle", "○".dimmed()),
		TrainerState::Failed => format!("{} {}", "●".red(), "failed".red()),
	}
}

fn render_health(health: &HealthSnapshot) {
	println!("{}", state_label(health.state));
	println!("  restarts   {}/{}", health.restarts, health.max_restarts);
	println!("  heartbeat  {} ago", format_age(health.heartbeat_age_secs));
	if let Some(code) = health.process_exit_code {
		println!("  exit code  {}", code);
	}
}

fn render_status(status: &StatusSnapshot) {
	render_health(&status.health);
	if let Some(pid) = status.process_id {
		println!("  pid        {}", pid);
	}
	println!("  progress   {} ago", format_age(status.last_progress_age_secs));
	println!("  watchdog   every {}s, backoff {}s", status.watchdog_interval_secs, status.backoff_secs);
	println!("  model dir  {}", status.model_dir.display());
	println!("  config     {}", status.config_path.display());
	if let Some(generated) = &status.generated_config_path {
		println!("  generated  {}", generated.display());
	}
	if let Some(base) = &status.base_checkpoint {
		println!("  warm start {}", base.display());
	}
	match &status.latest_checkpoint {
		Some(latest) => println!("  checkpoint {} ({} total)", latest.display(), status.num_checkpoints),
		None => println!("  checkpoint {}", "none".dimmed()),
	}
	if let Some(failure) = &status.last_failure {
		println!("  {}    {}", "error".red(), failure);
	}
	println!();
	render_tail(&status.log_tail);
}

fn render_tail(tail: &LogTail) {
	if let Some(lines) = &tail.stdout {
		println!("{}", "stdout".cyan().bold());
		for line in lines {
			println!("  {}", line);
		}
	}
	if let Some(lines) = &tail.stderr {
		println!("{}", "stderr".cyan().bold());
		for line in lines {
			println!("  {}", line.dimmed());
		}
	}
}

fn format_age(secs: f64) -> String {
	let secs = secs.max(0.0) as u64;
	if secs < 60 {
		format!("{}s", secs)
	} else if secs < 3600 {
		let m = secs / 60;
		let s = secs % 60;
		if s == 0 { format!("{}m", m) } else { format!("{}m{}s", m, s) }
	} else {
		let h = secs / 3600;
		let m = (secs % 3600) / 60;
		if m == 0 { format!("{}h", h) } else { format!("{}h{}m", h, m) }
	}
}

fn format_size(bytes: u64) -> String {
	const KIB: u64 = 1024;
	const MIB: u64 = 1024 * KIB;
	if bytes >= MIB {
		format!("{:.1}M", bytes as f64 / MIB as f64)
	} else if bytes >= KIB {
		format!("{:.1}K", bytes as f64 / KIB as f64)
	} else {
		format!("{}B", bytes)
	}
}

fn format_mtime(ms: i64) -> String {
	let secs = (trainward::heartbeat::now_ms() - ms).max(0) as f64 / 1000.0;
	format!("{} ago", format_age(secs))
}
