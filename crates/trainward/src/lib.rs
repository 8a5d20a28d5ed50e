//! # trainward
//!
//! Supervisor for a long-running incremental training process.
//!
//! Generates the streaming run config, spawns the trainer in its own process
//! group, captures and rotates its output, and restarts it when it crashes or
//! stops making progress.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trainward::{StartRequest, StreamingConfig, Supervisor, SupervisorConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> trainward::Result<()> {
//! let sup = Supervisor::new(SupervisorConfig::new("configs/online.config", "models/online"))?;
//!
//! let streaming = StreamingConfig::new("kafka-1:9092,kafka-2:9092", "clicks");
//! sup.start(StartRequest::new(streaming)).await?;
//!
//! println!("{:?}", sup.health().await);
//! sup.stop(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

pub mod checkpoints;
pub mod config_gen;
pub mod error;
pub mod heartbeat;
pub mod logs;
pub mod output;
pub mod process;
pub mod settings;
pub mod supervisor;
pub mod types;
mod watchdog;

pub use error::{Result, SupervisorError};
pub use settings::{LogSettings, SupervisorConfig, TrainerCommand, WatchdogSettings};
pub use supervisor::Supervisor;
pub use types::*;
pub use watchdog::RestartReason;
