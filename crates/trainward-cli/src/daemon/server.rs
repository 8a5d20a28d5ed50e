use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::protocol::{Request, Response};

/// Accepts connections forever, answering one JSON line with one JSON line.
pub async fn run_socket_server<F, Fut>(listener: UnixListener, handler: F)
where
	F: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Response> + Send,
{
	let handler = Arc::new(handler);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		tokio::spawn(async move {
			handle_connection(stream, handler).await;
		});
	}
}

async fn handle_connection<F, Fut>(stream: UnixStream, handler: Arc<F>)
where
	F: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Response> + Send,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		if line.trim().is_empty() {
			continue;
		}
		let response = match serde_json::from_str::<Request>(&line) {
			Ok(request) => {
				tracing::debug!("request: {:?}", request);
				handler(request).await
			}
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				Response::error(format!("invalid request: {}", e))
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn roundtrip(stream: &mut UnixStream, line: &str) -> Response {
		stream.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
		let mut reader = BufReader::new(stream);
		let mut out = String::new();
		reader.read_line(&mut out).await.unwrap();
		serde_json::from_str(&out).unwrap()
	}

	#[tokio::test]
	async fn answers_requests_and_rejects_garbage() {
		let dir = tempfile::tempdir().unwrap();
		let socket = dir.path().join("test.sock");
		let listener = UnixListener::bind(&socket).unwrap();
		tokio::spawn(run_socket_server(listener, |req: Request| async move {
			match req {
				Request::Ping => Response::Pong,
				_ => Response::ok("handled"),
			}
		}));

		let mut stream = UnixStream::connect(&socket).await.unwrap();
		assert!(matches!(roundtrip(&mut stream, r#"{"cmd":"ping"}"#).await, Response::Pong));

		match roundtrip(&mut stream, "not json").await {
			Response::Error { message } => assert!(message.starts_with("invalid request")),
			other => panic!("unexpected response: {:?}", other),
		}

		// the connection stays usable after a bad line
		match roundtrip(&mut stream, r#"{"cmd":"status"}"#).await {
			Response::Ok { message } => assert_eq!(message.as_deref(), Some("handled")),
			other => panic!("unexpected response: {:?}", other),
		}
	}
}
