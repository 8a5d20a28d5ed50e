use std::sync::atomic::{AtomicI64, Ordering};

/// Signs of life, as unix milliseconds.
///
/// Log readers bump `last_log_activity` on every line, so this stays lock-free
/// and independent of the supervisor state lock.
#[derive(Debug)]
pub struct Heartbeat {
	last_log_activity: AtomicI64,
	last_progress: AtomicI64,
	last_checkpoint_mtime: AtomicI64,
}

impl Heartbeat {
	pub fn new() -> Self {
		let now = now_ms();
		Self {
			last_log_activity: AtomicI64::new(now),
			last_progress: AtomicI64::new(now),
			last_checkpoint_mtime: AtomicI64::new(0),
		}
	}

	/// Resets activity and progress to now and forgets the checkpoint watermark.
	pub fn reset(&self) {
		let now = now_ms();
		self.last_log_activity.store(now, Ordering::Relaxed);
		self.last_progress.store(now, Ordering::Relaxed);
		self.last_checkpoint_mtime.store(0, Ordering::Relaxed);
	}

	/// Resets activity and progress but keeps the checkpoint watermark.
	pub fn touch_all(&self) {
		let now = now_ms();
		self.last_log_activity.store(now, Ordering::Relaxed);
		self.last_progress.store(now, Ordering::Relaxed);
	}

	/// Sets the checkpoint watermark without counting it as progress.
	pub fn seed_checkpoint(&self, mtime_ms: i64) {
		self.last_checkpoint_mtime.fetch_max(mtime_ms, Ordering::Relaxed);
	}

	pub fn record_log_activity(&self) {
		self.last_log_activity.store(now_ms(), Ordering::Relaxed);
	}

	/// Records a checkpoint newer than the watermark. Returns false if `mtime_ms` is not newer.
	pub fn record_checkpoint(&self, mtime_ms: i64) -> bool {
		let prev = self.last_checkpoint_mtime.fetch_max(mtime_ms, Ordering::Relaxed);
		if mtime_ms <= prev {
			return false;
		}
		let now = now_ms();
		self.last_progress.store(now, Ordering::Relaxed);
		self.last_log_activity.store(now, Ordering::Relaxed);
		true
	}

	#[cfg(test)]
	pub fn last_checkpoint_mtime(&self) -> i64 {
		self.last_checkpoint_mtime.load(Ordering::Relaxed)
	}

	pub fn log_idle_secs(&self) -> f64 {
		age_secs(self.last_log_activity.load(Ordering::Relaxed))
	}

	pub fn progress_age_secs(&self) -> f64 {
		age_secs(self.last_progress.load(Ordering::Relaxed))
	}
}

impl Default for Heartbeat {
	fn default() -> Self {
		Self::new()
	}
}

pub fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

pub fn system_time_ms(t: std::time::SystemTime) -> i64 {
	chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis()
}

fn age_secs(ts_ms: i64) -> f64 {
	(now_ms() - ts_ms).max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn checkpoint_watermark_only_moves_forward() {
		let hb = Heartbeat::new();
		assert!(hb.record_checkpoint(1_000));
		assert!(!hb.record_checkpoint(1_000));
		assert!(!hb.record_checkpoint(500));
		assert_eq!(hb.last_checkpoint_mtime(), 1_000);
		assert!(hb.record_checkpoint(2_000));

		hb.reset();
		assert_eq!(hb.last_checkpoint_mtime(), 0);
		assert!(hb.log_idle_secs() < 1.0);
	}

	#[test]
	fn seeded_checkpoint_is_not_progress() {
		let hb = Heartbeat::new();
		hb.seed_checkpoint(5_000);
		assert_eq!(hb.last_checkpoint_mtime(), 5_000);
		assert!(!hb.record_checkpoint(5_000));
		assert!(hb.record_checkpoint(6_000));
	}
}
