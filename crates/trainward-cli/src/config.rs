use serde::Deserialize;
use std::path::Path;
use trainward::SupervisorConfig;

const DEFAULT_CONFIG_PATH: &str = "configs/online.config";
const DEFAULT_MODEL_DIR: &str = "models/online";

#[derive(Debug, Clone)]
pub struct GlobalConfig {
	pub daemon: DaemonConfig,
	pub supervisor: SupervisorConfig,
}

impl Default for GlobalConfig {
	fn default() -> Self {
		Self {
			daemon: DaemonConfig::default(),
			supervisor: SupervisorConfig::new(DEFAULT_CONFIG_PATH, DEFAULT_MODEL_DIR),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	/// `tracing` filter used when `RUST_LOG` is unset.
	#[serde(default = "default_log_filter")]
	pub log_filter: String,
	#[serde(default = "default_stop_timeout")]
	pub stop_timeout_secs: u64,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			log_filter: default_log_filter(),
			stop_timeout_secs: default_stop_timeout(),
		}
	}
}

fn default_log_filter() -> String {
	"info".to_string()
}
fn default_stop_timeout() -> u64 {
	crate::protocol::default_stop_timeout()
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
	#[serde(default)]
	daemon: Option<DaemonConfig>,
	#[serde(default)]
	supervisor: Option<toml::Table>,
}

/// Reads `path`, reporting a missing or unparsable file as a warning and using defaults.
pub fn load_global_config(path: &Path) -> GlobalConfig {
	if !path.exists() {
		return GlobalConfig::default();
	}
	match std::fs::read_to_string(path) {
		Ok(content) => match parse_global_config(&content) {
			Ok(config) => return config,
			Err(e) => eprintln!("warning: failed to parse {}: {}", path.display(), e),
		},
		Err(e) => eprintln!("warning: failed to read {}: {}", path.display(), e),
	}
	GlobalConfig::default()
}

pub fn parse_global_config(content: &str) -> Result<GlobalConfig, toml::de::Error> {
	let raw: RawConfig = toml::from_str(content)?;

	let mut table = raw.supervisor.unwrap_or_default();
	table
		.entry("config_path")
		.or_insert_with(|| toml::Value::String(DEFAULT_CONFIG_PATH.to_string()));
	table
		.entry("model_dir")
		.or_insert_with(|| toml::Value::String(DEFAULT_MODEL_DIR.to_string()));
	let supervisor: SupervisorConfig = toml::Value::Table(table).try_into()?;

	Ok(GlobalConfig {
		daemon: raw.daemon.unwrap_or_default(),
		supervisor,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	#[test]
	fn empty_file_uses_fallback_paths() {
		let cfg = parse_global_config("").unwrap();
		assert_eq!(cfg.supervisor.config_path, PathBuf::from("configs/online.config"));
		assert_eq!(cfg.supervisor.model_dir, PathBuf::from("models/online"));
		assert_eq!(cfg.daemon.log_filter, "info");
		assert_eq!(cfg.daemon.stop_timeout_secs, 30);
	}

	#[test]
	fn supervisor_table_overrides() {
		let cfg = parse_global_config(
			r#"
[daemon]
log_filter = "trainward=debug"

[supervisor]
model_dir = "/data/models/online"
base_checkpoint = "/data/models/offline/model.ckpt-5000"

[supervisor.watchdog]
hung_restart_secs = 300
"#,
		)
		.unwrap();
		assert_eq!(cfg.daemon.log_filter, "trainward=debug");
		assert_eq!(cfg.supervisor.config_path, PathBuf::from("configs/online.config"));
		assert_eq!(cfg.supervisor.model_dir, PathBuf::from("/data/models/online"));
		assert_eq!(
			cfg.supervisor.base_checkpoint,
			Some(PathBuf::from("/data/models/offline/model.ckpt-5000"))
		);
		assert_eq!(cfg.supervisor.watchdog.hung_restart_secs, 300);
		assert_eq!(cfg.supervisor.watchdog.heartbeat_timeout_secs, 30);
	}

	#[test]
	fn unreadable_file_falls_back() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		std::fs::write(&path, "[supervisor\nbroken").unwrap();
		let cfg = load_global_config(&path);
		assert_eq!(cfg.supervisor.model_dir, PathBuf::from("models/online"));

		let missing = load_global_config(&dir.path().join("missing.toml"));
		assert_eq!(missing.daemon.stop_timeout_secs, 30);
	}
}
