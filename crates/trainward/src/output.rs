use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::heartbeat::Heartbeat;
use crate::logs;
use crate::settings::LogSettings;

/// One output stream of the trainer: a bounded line tail plus a rotating file.
///
/// Lives for the whole supervisor; each restart attaches fresh readers to it.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<String>>>,
	capacity: usize,
	log_writer: Arc<Mutex<LogWriter>>,
	heartbeat: Arc<Heartbeat>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	bytes_written: u64,
	max_size: u64,
	retention: usize,
}

impl OutputCapture {
	pub fn new(path: PathBuf, settings: &LogSettings, heartbeat: Arc<Heartbeat>) -> Self {
		if let Some(parent) = path.parent() {
			let _ = fs::create_dir_all(parent);
		}
		let file = open_append(&path);
		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		let capacity = settings.tail_lines.max(1);
		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
			capacity,
			log_writer: Arc::new(Mutex::new(LogWriter {
				file,
				path,
				bytes_written,
				max_size: settings.max_size_bytes,
				retention: settings.retention,
			})),
			heartbeat,
		}
	}

	/// Records one line read from the trainer. Counts as log activity.
	pub async fn push_line(&self, line: String) {
		self.heartbeat.record_log_activity();
		self.append(line).await;
	}

	/// Records a supervisor-authored line. Does not count as log activity.
	pub async fn note(&self, message: &str) {
		self.append(format!("[trainward] {}", message)).await;
	}

	async fn append(&self, line: String) {
		{
			let mut writer = self.log_writer.lock().await;
			writer.write_line(&line);
		}

		let mut ring = self.ring.lock().await;
		if ring.len() >= self.capacity {
			ring.pop_front();
		}
		ring.push_back(line);
	}

	/// Up to `lines` most recent entries, oldest first.
	pub async fn tail(&self, lines: usize) -> Vec<String> {
		let ring = self.ring.lock().await;
		let skip = ring.len().saturating_sub(lines);
		ring.iter().skip(skip).cloned().collect()
	}
}

impl LogWriter {
	fn write_line(&mut self, line: &str) {
		if self.file.is_none() {
			self.file = open_append(&self.path);
		}
		let Some(ref mut file) = self.file else {
			return;
		};
		let mut data = Vec::with_capacity(line.len() + 1);
		data.extend_from_slice(line.as_bytes());
		data.push(b'\n');
		if let Err(e) = file.write_all(&data) {
			tracing::warn!("failed to write {}: {}", self.path.display(), e);
			return;
		}

		self.bytes_written += data.len() as u64;
		if self.bytes_written > self.max_size {
			self.rotate();
		}
	}

	fn rotate(&mut self) {
		if let Some(file) = self.file.take() {
			drop(file);
		}

		let rotated = logs::rotated_log_path(&self.path);
		if let Err(e) = fs::rename(&self.path, &rotated) {
			tracing::warn!("log rotation failed for {}: {}", self.path.display(), e);
		} else {
			logs::prune_rotated(&self.path, self.retention);
		}

		self.file = open_append(&self.path);
		self.bytes_written = self
			.file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);
	}
}

fn open_append(path: &Path) -> Option<File> {
	match OpenOptions::new().create(true).append(true).open(path) {
		Ok(f) => Some(f),
		Err(e) => {
			tracing::warn!("cannot open log file {}: {}", path.display(), e);
			None
		}
	}
}

/// Reader tasks for one child's stdout and stderr.
///
/// Dropping the pipeline closes its stop channel, which also ends the readers.
pub struct LogPipeline {
	stop: watch::Sender<bool>,
	readers: Vec<JoinHandle<()>>,
}

impl LogPipeline {
	pub fn attach(child: &mut Child, stdout: &OutputCapture, stderr: &OutputCapture) -> Self {
		let (stop, stop_rx) = watch::channel(false);
		let mut readers = Vec::with_capacity(2);

		if let Some(out) = child.stdout.take() {
			let capture = stdout.clone();
			let rx = stop_rx.clone();
			readers.push(tokio::spawn(async move {
				pipe_lines(out, capture, rx).await;
			}));
		}
		if let Some(err) = child.stderr.take() {
			let capture = stderr.clone();
			let rx = stop_rx.clone();
			readers.push(tokio::spawn(async move {
				pipe_lines(err, capture, rx).await;
			}));
		}

		Self { stop, readers }
	}

	/// Waits up to `timeout` for the readers to reach end of stream on their own.
	pub async fn drain(&mut self, timeout: Duration) {
		let deadline = tokio::time::Instant::now() + timeout;
		let mut pending = Vec::new();
		for mut handle in std::mem::take(&mut self.readers) {
			if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
				pending.push(handle);
			}
		}
		self.readers = pending;
	}

	/// Signals the readers and joins them, aborting any that outlive `timeout`.
	pub async fn stop(&mut self, timeout: Duration) {
		let _ = self.stop.send(true);
		self.drain(timeout).await;
		for handle in self.readers.drain(..) {
			tracing::debug!("log reader did not stop in time; aborting");
			handle.abort();
		}
	}

	#[cfg(test)]
	pub fn is_finished(&self) -> bool {
		self.readers.iter().all(|h| h.is_finished())
	}
}

async fn pipe_lines<R: AsyncRead + Unpin>(
	reader: R,
	output: OutputCapture,
	mut stop: watch::Receiver<bool>,
) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::with_capacity(256);
	loop {
		if *stop.borrow() {
			return;
		}
		buf.clear();
		let read = tokio::select! {
			r = reader.read_until(b'\n', &mut buf) => r,
			_ = stop.changed() => return,
		};
		match read {
			Ok(0) => return,
			Ok(_) => output.push_line(decode_line(&buf)).await,
			Err(e) => {
				tracing::warn!("log reader error: {}", e);
				return;
			}
		}
	}
}

fn decode_line(raw: &[u8]) -> String {
	let text = String::from_utf8_lossy(raw);
	text.trim_end_matches(['\n', '\r']).to_string()
}
