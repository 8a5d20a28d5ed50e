pub mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use trainward::{PolicyUpdate, Supervisor};

use crate::config::GlobalConfig;
use crate::paths::DaemonPaths;
use crate::protocol::{Request, Response};

/// Options that override `[supervisor]` from the config file.
#[derive(Debug, Default)]
pub struct DaemonOverrides {
	pub config_path: Option<PathBuf>,
	pub model_dir: Option<PathBuf>,
	pub base_checkpoint: Option<PathBuf>,
}

pub async fn run(paths: DaemonPaths, mut global: GlobalConfig, overrides: DaemonOverrides) -> Result<(), String> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&global.daemon.log_filter));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	if let Some(p) = overrides.config_path {
		global.supervisor.config_path = p;
	}
	if let Some(p) = overrides.model_dir {
		global.supervisor.model_dir = p;
	}
	if let Some(p) = overrides.base_checkpoint {
		global.supervisor.base_checkpoint = Some(p);
	}

	if crate::client::is_running(&paths) {
		return Err(format!("daemon already running on {}", paths.socket_path().display()));
	}

	let supervisor = Supervisor::new(global.supervisor.clone()).map_err(|e| e.to_string())?;

	std::fs::create_dir_all(paths.state_dir()).map_err(|e| format!("cannot create {}: {}", paths.state_dir().display(), e))?;
	let pid_path = paths.pid_path();
	if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
		tracing::warn!("failed to write pid file {}: {}", pid_path.display(), e);
	}

	let socket_path = paths.socket_path();
	if socket_path.exists() {
		let _ = std::fs::remove_file(&socket_path);
	}
	let listener = tokio::net::UnixListener::bind(&socket_path)
		.map_err(|e| format!("failed to bind socket {}: {}", socket_path.display(), e))?;
	tracing::info!("listening on {}", socket_path.display());

	let shutdown = Arc::new(Notify::new());
	let sup_socket = Arc::clone(&supervisor);
	let shutdown_socket = Arc::clone(&shutdown);
	let socket_handle = tokio::spawn(server::run_socket_server(listener, move |req: Request| {
		let sup = Arc::clone(&sup_socket);
		let shutdown = Arc::clone(&shutdown_socket);
		async move { handle_request(&sup, &shutdown, req).await }
	}));

	tracing::info!(
		"daemon started (pid {}), model dir {}",
		std::process::id(),
		global.supervisor.model_dir.display()
	);

	let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.map_err(|e| format!("failed to install SIGTERM handler: {}", e))?;
	tokio::select! {
		_ = tokio::signal::ctrl_c() => tracing::info!("interrupted; shutting down"),
		_ = sigterm.recv() => tracing::info!("terminated; shutting down"),
		_ = shutdown.notified() => tracing::info!("shutdown requested"),
	}

	socket_handle.abort();
	supervisor.shutdown().await;

	let _ = std::fs::remove_file(&socket_path);
	let _ = std::fs::remove_file(&pid_path);
	tracing::info!("daemon stopped");
	Ok(())
}

pub async fn handle_request(supervisor: &Arc<Supervisor>, shutdown: &Notify, request: Request) -> Response {
	match request {
		Request::Ping => Response::Pong,
		Request::Start { request } => match supervisor.start(request).await {
			Ok(()) => Response::ok("incremental training started"),
			Err(e) => Response::error(e),
		},
		Request::Stop { timeout_secs } => {
			if supervisor.stop(Duration::from_secs(timeout_secs)).await {
				Response::ok("incremental training stopped")
			} else {
				Response::ok(format!("nothing to stop ({:?})", supervisor.state().await))
			}
		}
		Request::Status => Response::Status {
			status: Box::new(supervisor.status().await),
		},
		Request::Health => Response::Health {
			health: supervisor.health().await,
		},
		Request::Logs { lines, stream } => Response::Logs {
			tail: supervisor.tail_logs(lines, stream).await,
		},
		Request::Policy { max_restarts, backoff_secs } => {
			let update = PolicyUpdate { max_restarts, backoff_secs };
			let result = if max_restarts.is_none() && backoff_secs.is_none() {
				Ok(supervisor.restart_policy().await)
			} else {
				supervisor.update_restart_policy(update).await
			};
			match result {
				Ok(policy) => Response::Policy { policy },
				Err(e) => Response::error(e),
			}
		}
		Request::Export { dir } => match supervisor.export(&dir).await {
			Ok(()) => Response::ok(format!("model exported to {}", dir.display())),
			Err(e) => Response::error(e),
		},
		Request::Updates => Response::Updates {
			updates: supervisor.incremental_updates(),
		},
		Request::Shutdown => {
			shutdown.notify_one();
			Response::ok("shutting down")
		}
	}
}
