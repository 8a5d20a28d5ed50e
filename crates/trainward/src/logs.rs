use std::path::{Path, PathBuf};

pub const STDOUT_LOG: &str = "online_train_stdout.log";
pub const STDERR_LOG: &str = "online_train_stderr.log";

const SUFFIX_FORMAT: &str = "%Y%m%d%H%M%S%3f";

pub fn stdout_log_path(model_dir: &Path) -> PathBuf {
	model_dir.join(STDOUT_LOG)
}

pub fn stderr_log_path(model_dir: &Path) -> PathBuf {
	model_dir.join(STDERR_LOG)
}

/// Next free rotation target for `active`, e.g. `online_train_stdout.log.20261014093012123`.
///
/// Suffixes are UTC timestamps to the millisecond. If that name is taken (or an existing
/// generation sorts later), the suffix is bumped past the newest one so ordering holds.
pub fn rotated_log_path(active: &Path) -> PathBuf {
	let now: u64 = chrono::Utc::now()
		.format(SUFFIX_FORMAT)
		.to_string()
		.parse()
		.unwrap_or(0);
	let newest = rotated_generations(active).last().map(|(s, _)| *s);
	let suffix = match newest {
		Some(n) if n >= now => n + 1,
		_ => now,
	};
	with_suffix(active, suffix)
}

/// Deletes the oldest rotated generations of `active` beyond `retention`.
pub fn prune_rotated(active: &Path, retention: usize) -> Vec<PathBuf> {
	let generations = rotated_generations(active);
	if generations.len() <= retention {
		return Vec::new();
	}
	let excess = generations.len() - retention;
	let mut removed = Vec::new();
	for (_, path) in generations.into_iter().take(excess) {
		match std::fs::remove_file(&path) {
			Ok(()) => removed.push(path),
			Err(e) => tracing::warn!("failed to prune rotated log {}: {}", path.display(), e),
		}
	}
	removed
}

/// Rotated siblings of `active`, oldest first.
pub fn rotated_generations(active: &Path) -> Vec<(u64, PathBuf)> {
	let Some(dir) = active.parent() else {
		return Vec::new();
	};
	let Some(base) = active.file_name().map(|n| n.to_string_lossy().to_string()) else {
		return Vec::new();
	};
	let prefix = format!("{}.", base);

	let entries = match std::fs::read_dir(dir) {
		Ok(e) => e,
		Err(_) => return Vec::new(),
	};

	let mut found: Vec<(u64, PathBuf)> = entries
		.flatten()
		.filter_map(|entry| {
			let name = entry.file_name().to_string_lossy().to_string();
			let suffix = name.strip_prefix(&prefix)?;
			let stamp = suffix.parse::<u64>().ok()?;
			Some((stamp, entry.path()))
		})
		.collect();
	found.sort_by_key(|(stamp, _)| *stamp);
	found
}

fn with_suffix(active: &Path, suffix: u64) -> PathBuf {
	let mut name = active.as_os_str().to_os_string();
	name.push(format!(".{}", suffix));
	PathBuf::from(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rotated_name_has_timestamp_suffix() {
		let dir = tempfile::tempdir().unwrap();
		let active = stdout_log_path(dir.path());
		let rotated = rotated_log_path(&active);
		let name = rotated.file_name().unwrap().to_string_lossy().to_string();
		let suffix = name.strip_prefix("online_train_stdout.log.").unwrap();
		assert_eq!(suffix.len(), 17);
		assert!(chrono::NaiveDateTime::parse_from_str(&suffix[..14], "%Y%m%d%H%M%S").is_ok());
	}

	#[test]
	fn rotated_name_never_collides() {
		let dir = tempfile::tempdir().unwrap();
		let active = stderr_log_path(dir.path());
		let future = with_suffix(&active, 99990101000000000);
		std::fs::write(&future, "x").unwrap();

		let next = rotated_log_path(&active);
		assert_eq!(next, with_suffix(&active, 99990101000000001));
	}

	#[test]
	fn prune_keeps_newest() {
		let dir = tempfile::tempdir().unwrap();
		let active = stdout_log_path(dir.path());
		std::fs::write(&active, "live").unwrap();
		for stamp in [20260101000000003u64, 20260101000000001, 20260101000000002] {
			std::fs::write(with_suffix(&active, stamp), "old").unwrap();
		}
		// unrelated files are ignored
		std::fs::write(dir.path().join("online_train_stdout.log.bak"), "x").unwrap();
		std::fs::write(stderr_log_path(dir.path()).with_extension("log.20200101000000000"), "x").unwrap();

		let removed = prune_rotated(&active, 2);
		assert_eq!(removed, vec![with_suffix(&active, 20260101000000001)]);

		let left: Vec<u64> = rotated_generations(&active).into_iter().map(|(s, _)| s).collect();
		assert_eq!(left, vec![20260101000000002, 20260101000000003]);
		assert!(active.exists());
	}
}
