//! Generated pipeline configuration.
//!
//! The base document is protobuf text format. It is patched at the string level:
//! a `kafka_train_input` block is prepended and an `incr_save_config` block is
//! placed inside `train_config`. Both insertions are guarded by presence checks,
//! so regenerating from an already patched document leaves it unchanged.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, SupervisorError};
use crate::types::{StreamingConfig, UpdateConfig};

const OFFSET_TIME_FORMAT: &str = "%Y%m%d %H:%M:%S";

fn streaming_block_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*kafka_train_input\s*\{").expect("valid regex"))
}

fn train_block_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?m)^\s*train_config\s*\{").expect("valid regex"))
}

/// Reads `base_path`, patches it and writes the result to a fresh temporary file.
///
/// The previous file is not touched; deleting it is the caller's job.
pub fn generate(
	base_path: &Path,
	streaming: &StreamingConfig,
	update: Option<&UpdateConfig>,
	temp_dir: Option<&Path>,
) -> Result<PathBuf> {
	let base = std::fs::read_to_string(base_path).map_err(|source| SupervisorError::ConfigRead {
		path: base_path.to_path_buf(),
		source,
	})?;

	let default_update = UpdateConfig::default();
	let doc = render(&base, streaming, update.unwrap_or(&default_update));

	let mut builder = tempfile::Builder::new();
	builder.prefix("trainward-").suffix(".config");
	let mut tmp = match temp_dir {
		Some(dir) => {
			std::fs::create_dir_all(dir)?;
			builder.tempfile_in(dir)?
		}
		None => builder.tempfile()?,
	};
	tmp.write_all(doc.as_bytes())?;
	tmp.flush()?;
	let (_, path) = tmp.keep().map_err(|e| e.error)?;

	tracing::info!("generated online config: {}", path.display());
	Ok(path)
}

/// Applies the streaming and checkpoint blocks to `base`.
pub fn render(base: &str, streaming: &StreamingConfig, update: &UpdateConfig) -> String {
	let mut doc = base.to_string();

	if !streaming_block_re().is_match(&doc) {
		doc = streaming_block(streaming) + &doc;
	}

	if doc.contains("incr_save_config") {
		tracing::debug!("incremental checkpoint block already present; skipping insert");
		return doc;
	}

	let section = checkpoint_section(&doc, update);
	match train_block_re().find(&doc).map(|m| m.end()) {
		Some(end) => {
			doc.insert_str(end, &format!("\n{}", section));
		}
		None => {
			if !doc.ends_with('\n') {
				doc.push('\n');
			}
			doc.push_str(&format!("train_config {{\n{}}}\n", section));
		}
	}
	doc
}

fn streaming_block(streaming: &StreamingConfig) -> String {
	let offset = match &streaming.offset_time {
		Some(t) if !t.trim().is_empty() => t.clone(),
		_ => chrono::Local::now().format(OFFSET_TIME_FORMAT).to_string(),
	};
	format!(
		"kafka_train_input {{\n  server: '{}'\n  topic: '{}'\n  group: '{}'\n  offset_time: '{}'\n}}\n\n",
		escape(&streaming.servers),
		escape(&streaming.topic),
		escape(&streaming.group),
		escape(&offset),
	)
}

/// Fields the document already sets are left out so no singular field appears twice.
fn checkpoint_section(doc: &str, update: &UpdateConfig) -> String {
	let mut section = format!(
		"  incr_save_config {{\n    dense_save_steps: {}\n    sparse_save_steps: {}\n    fs {{}}\n  }}\n",
		update.dense_save_steps, update.sparse_save_steps,
	);
	if !doc.contains("enable_oss_stop_signal") {
		section.push_str(&format!("  enable_oss_stop_signal: {}\n", update.enable_stop_signal));
	}
	if !doc.contains("save_checkpoints_steps") {
		section.push_str(&format!("  save_checkpoints_steps: {}\n", update.save_checkpoints_steps));
	}
	section
}

fn escape(value: &str) -> String {
	value.replace('\'', "\\'").replace("\r\n", " ").replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
	use super::*;

	const BASE: &str = "model_config { name: 'x' }\ntrain_config { save_checkpoints_steps: 100 }";

	fn kafka() -> StreamingConfig {
		StreamingConfig {
			servers: "k1:9092".into(),
			topic: "t1".into(),
			group: "g1".into(),
			offset_time: Some("20240101 00:00:00".into()),
		}
	}

	#[test]
	fn inserts_both_blocks() {
		let out = render(BASE, &kafka(), &UpdateConfig::default());
		assert!(out.starts_with("kafka_train_input {\n"));
		assert!(out.contains("  topic: 't1'\n"));
		assert!(out.contains("  group: 'g1'\n"));
		assert!(out.contains("  offset_time: '20240101 00:00:00'\n"));
		assert!(out.contains("train_config {\n  incr_save_config {\n    dense_save_steps: 100\n"));
		assert!(out.contains("enable_oss_stop_signal: true"));
		// base already sets the full-checkpoint interval
		assert_eq!(out.matches("save_checkpoints_steps").count(), 1);
		assert!(out.contains("model_config { name: 'x' }"));
	}

	#[test]
	fn rendering_is_idempotent() {
		let once = render(BASE, &kafka(), &UpdateConfig::default());
		let twice = render(&once, &kafka(), &UpdateConfig::default());
		assert_eq!(once, twice);
		assert_eq!(twice.matches("kafka_train_input").count(), 1);
		assert_eq!(twice.matches("incr_save_config").count(), 1);
	}

	#[test]
	fn custom_update_steps() {
		let update = UpdateConfig {
			dense_save_steps: 50,
			sparse_save_steps: 60,
			enable_stop_signal: false,
			save_checkpoints_steps: 1000,
		};
		let out = render("train_config {\n  num_steps: 10\n}\n", &kafka(), &update);
		assert!(out.contains("dense_save_steps: 50"));
		assert!(out.contains("sparse_save_steps: 60"));
		assert!(out.contains("enable_oss_stop_signal: false"));
		assert!(out.contains("save_checkpoints_steps: 1000"));
		assert!(out.contains("  num_steps: 10\n}"));
	}

	#[test]
	fn appends_training_block_when_missing() {
		let out = render("model_config { name: 'x' }", &kafka(), &UpdateConfig::default());
		assert!(out.ends_with("train_config {\n  incr_save_config {\n    dense_save_steps: 100\n    sparse_save_steps: 100\n    fs {}\n  }\n  enable_oss_stop_signal: true\n  save_checkpoints_steps: 500\n}\n"));
		assert_eq!(out.matches("train_config").count(), 1);
	}

	#[test]
	fn only_first_training_block_is_patched() {
		let base = "train_config {\n}\neval_config {\n}\n# train_config {\n";
		let out = render(base, &kafka(), &UpdateConfig::default());
		assert_eq!(out.matches("incr_save_config").count(), 1);
		let incr = out.find("incr_save_config").unwrap();
		assert!(incr < out.find("eval_config").unwrap());
	}

	#[test]
	fn existing_streaming_block_is_kept() {
		let base = "  kafka_train_input {\n  server: 'old:1'\n}\ntrain_config {\n}\n";
		let out = render(base, &kafka(), &UpdateConfig::default());
		assert_eq!(out.matches("kafka_train_input").count(), 1);
		assert!(out.contains("old:1"));
		assert!(!out.contains("k1:9092"));
	}

	#[test]
	fn templated_values_are_escaped() {
		let mut cfg = kafka();
		cfg.topic = "it's\nhere".into();
		let out = render(BASE, &cfg, &UpdateConfig::default());
		assert!(out.contains(r"  topic: 'it\'s here'"));
	}

	#[test]
	fn offset_defaults_to_now() {
		let mut cfg = kafka();
		cfg.offset_time = None;
		let out = render(BASE, &cfg, &UpdateConfig::default());
		let line = out.lines().find(|l| l.contains("offset_time")).unwrap();
		let value = line.trim().trim_start_matches("offset_time: '").trim_end_matches('\'');
		assert!(chrono::NaiveDateTime::parse_from_str(value, OFFSET_TIME_FORMAT).is_ok(), "{}", line);
	}

	#[test]
	fn generate_writes_fresh_files() {
		let dir = tempfile::tempdir().unwrap();
		let base = dir.path().join("base.config");
		std::fs::write(&base, BASE).unwrap();

		let first = generate(&base, &kafka(), None, Some(dir.path())).unwrap();
		let second = generate(&base, &kafka(), None, Some(dir.path())).unwrap();
		assert_ne!(first, second);
		let a = std::fs::read_to_string(&first).unwrap();
		let b = std::fs::read_to_string(&second).unwrap();
		assert_eq!(a, b);
		assert!(first.to_string_lossy().ends_with(".config"));
	}

	#[test]
	fn generate_from_patched_output_does_not_duplicate() {
		let dir = tempfile::tempdir().unwrap();
		let base = dir.path().join("base.config");
		std::fs::write(&base, BASE).unwrap();

		let first = generate(&base, &kafka(), None, Some(dir.path())).unwrap();
		let again = generate(&first, &kafka(), None, Some(dir.path())).unwrap();
		let text = std::fs::read_to_string(&again).unwrap();
		assert_eq!(text.matches("kafka_train_input").count(), 1);
		assert_eq!(text.matches("incr_save_config").count(), 1);
	}

	#[test]
	fn missing_base_is_config_read_error() {
		let dir = tempfile::tempdir().unwrap();
		let err = generate(&dir.path().join("nope.config"), &kafka(), None, Some(dir.path())).unwrap_err();
		assert!(matches!(err, SupervisorError::ConfigRead { .. }));
	}
}
