use std::path::PathBuf;

const APP_NAME: &str = "trainward";

/// XDG locations for the daemon's socket, pid file and config.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
	state_dir: PathBuf,
	config_dir: PathBuf,
}

impl DaemonPaths {
	pub fn from_env() -> Self {
		let home = std::env::var("HOME").ok().map(PathBuf::from);
		let state_dir = match (std::env::var("XDG_STATE_HOME"), &home) {
			(Ok(dir), _) if !dir.is_empty() => PathBuf::from(dir).join(APP_NAME),
			(_, Some(home)) => home.join(".local").join("state").join(APP_NAME),
			_ => PathBuf::from("/tmp").join(APP_NAME),
		};
		let config_dir = match (std::env::var("XDG_CONFIG_HOME"), &home) {
			(Ok(dir), _) if !dir.is_empty() => PathBuf::from(dir).join(APP_NAME),
			(_, Some(home)) => home.join(".config").join(APP_NAME),
			_ => PathBuf::from("/tmp").join(APP_NAME).join("config"),
		};
		Self { state_dir, config_dir }
	}

	/// Everything under one directory.
	#[cfg(test)]
	pub fn rooted(root: impl Into<PathBuf>) -> Self {
		let root = root.into();
		Self {
			state_dir: root.join("state"),
			config_dir: root.join("config"),
		}
	}

	pub fn state_dir(&self) -> &PathBuf {
		&self.state_dir
	}

	pub fn socket_path(&self) -> PathBuf {
		self.state_dir.join("daemon.sock")
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir.join("daemon.pid")
	}

	pub fn config_file(&self) -> PathBuf {
		self.config_dir.join("config.toml")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rooted_layout() {
		let paths = DaemonPaths::rooted("/tmp/tw");
		assert_eq!(paths.socket_path(), PathBuf::from("/tmp/tw/state/daemon.sock"));
		assert_eq!(paths.pid_path(), PathBuf::from("/tmp/tw/state/daemon.pid"));
		assert_eq!(paths.config_file(), PathBuf::from("/tmp/tw/config/config.toml"));
	}
}
