//! Checkpoint discovery in the model directory.
//!
//! Two conventions are recognized: `<prefix>.meta` / `<prefix>.index` file pairs,
//! reported by their shared prefix, and exported `savedmodel*` subdirectories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::heartbeat::system_time_ms;
use crate::types::{CheckpointRef, IncrementalUpdates, UpdateFile};

pub const INCR_SAVE_DIR: &str = "incr_save";

/// Checkpoints ordered oldest to newest.
pub fn list_checkpoints(model_dir: &Path) -> Vec<CheckpointRef> {
	let entries = match std::fs::read_dir(model_dir) {
		Ok(e) => e,
		Err(e) => {
			tracing::debug!("cannot list {}: {}", model_dir.display(), e);
			return Vec::new();
		}
	};

	// prefix path -> newest marker mtime
	let mut found: HashMap<PathBuf, i64> = HashMap::new();
	for entry in entries.flatten() {
		let name = entry.file_name().to_string_lossy().to_string();
		let path = entry.path();
		let Some(kind) = marker_kind(&name, &path) else {
			continue;
		};
		let Some(mtime) = mtime_ms(&path) else {
			continue;
		};
		let key = match kind {
			Marker::Meta => model_dir.join(&name[..name.len() - ".meta".len()]),
			Marker::Index => model_dir.join(&name[..name.len() - ".index".len()]),
			Marker::SavedModel => path,
		};
		let slot = found.entry(key).or_insert(mtime);
		*slot = (*slot).max(mtime);
	}

	let mut checkpoints: Vec<CheckpointRef> = found
		.into_iter()
		.map(|(path, modified_ms)| CheckpointRef { path, modified_ms })
		.collect();
	checkpoints.sort_by(|a, b| a.modified_ms.cmp(&b.modified_ms).then_with(|| a.path.cmp(&b.path)));
	checkpoints
}

/// Newest modification time among checkpoint markers, if any.
pub fn latest_marker_mtime(model_dir: &Path) -> Option<i64> {
	list_checkpoints(model_dir).last().map(|c| c.modified_ms)
}

/// `*.update` files emitted into `<model_dir>/incr_save`.
pub fn incremental_updates(model_dir: &Path) -> IncrementalUpdates {
	let dir = model_dir.join(INCR_SAVE_DIR);
	let entries = match std::fs::read_dir(&dir) {
		Ok(e) => e,
		Err(_) => return IncrementalUpdates::default(),
	};

	let mut files: Vec<UpdateFile> = entries
		.flatten()
		.filter_map(|entry| {
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("update") {
				return None;
			}
			let meta = entry.metadata().ok()?;
			if !meta.is_file() {
				return None;
			}
			Some(UpdateFile {
				file: entry.file_name().to_string_lossy().to_string(),
				size: meta.len(),
				modified_ms: meta.modified().map(system_time_ms).unwrap_or(0),
				path,
			})
		})
		.collect();
	files.sort_by(|a, b| a.modified_ms.cmp(&b.modified_ms).then_with(|| a.file.cmp(&b.file)));

	IncrementalUpdates {
		available: !files.is_empty(),
		files,
	}
}

enum Marker {
	Meta,
	Index,
	SavedModel,
}

fn marker_kind(name: &str, path: &Path) -> Option<Marker> {
	if name.ends_with(".meta") && name.len() > ".meta".len() {
		Some(Marker::Meta)
	} else if name.ends_with(".index") && name.len() > ".index".len() {
		Some(Marker::Index)
	} else if name.starts_with("savedmodel") && path.is_dir() {
		Some(Marker::SavedModel)
	} else {
		None
	}
}

fn mtime_ms(path: &Path) -> Option<i64> {
	std::fs::metadata(path)
		.and_then(|m| m.modified())
		.ok()
		.map(system_time_ms)
}
