use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use trainward::{
	HealthSnapshot, IncrementalUpdates, LogStream, LogTail, RestartPolicy, StartRequest, StatusSnapshot,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Start { request: StartRequest },
	Stop {
		#[serde(default = "default_stop_timeout")]
		timeout_secs: u64,
	},
	Status,
	Health,
	Logs {
		#[serde(default = "default_lines")]
		lines: usize,
		#[serde(default = "default_stream")]
		stream: LogStream,
	},
	Policy {
		#[serde(default)]
		max_restarts: Option<i64>,
		#[serde(default)]
		backoff_secs: Option<i64>,
	},
	Export { dir: PathBuf },
	Updates,
	Ping,
	Shutdown,
}

pub fn default_stop_timeout() -> u64 {
	30
}
pub fn default_lines() -> usize {
	100
}
fn default_stream() -> LogStream {
	LogStream::Both
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Status { status: Box<StatusSnapshot> },
	Health { health: HealthSnapshot },
	Logs { tail: LogTail },
	Policy { policy: RestartPolicy },
	Updates { updates: IncrementalUpdates },
	Error { message: String },
	Pong,
}

impl Response {
	pub fn ok(message: impl Into<String>) -> Self {
		Response::Ok {
			message: Some(message.into()),
		}
	}

	pub fn error(err: impl std::fmt::Display) -> Self {
		Response::Error {
			message: err.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn requests_are_tagged_by_cmd() {
		let json = serde_json::to_value(Request::Stop { timeout_secs: 12 }).unwrap();
		assert_eq!(json, serde_json::json!({"cmd": "stop", "timeout_secs": 12}));

		let req: Request = serde_json::from_str(r#"{"cmd":"logs"}"#).unwrap();
		match req {
			Request::Logs { lines, stream } => {
				assert_eq!(lines, 100);
				assert_eq!(stream, LogStream::Both);
			}
			other => panic!("unexpected request: {:?}", other),
		}
	}

	#[test]
	fn start_request_fills_defaults() {
		let req: Request = serde_json::from_str(
			r#"{"cmd":"start","request":{"streaming":{"servers":"k1:9092","topic":"clicks"}}}"#,
		)
		.unwrap();
		let Request::Start { request } = req else {
			panic!("expected start");
		};
		assert_eq!(request.streaming.group, "easyrec_online");
		assert_eq!(request.max_restarts, 3);
		assert_eq!(request.backoff_secs, 10);
		assert_eq!(request.watchdog_interval_secs, 5);
		assert!(request.update.is_none());
	}

	#[test]
	fn policy_fields_are_optional() {
		let req: Request = serde_json::from_str(r#"{"cmd":"policy","backoff_secs":4}"#).unwrap();
		match req {
			Request::Policy { max_restarts, backoff_secs } => {
				assert_eq!(max_restarts, None);
				assert_eq!(backoff_secs, Some(4));
			}
			other => panic!("unexpected request: {:?}", other),
		}
	}

	#[test]
	fn responses_are_tagged_by_type() {
		let json = serde_json::to_value(Response::error("boom")).unwrap();
		assert_eq!(json, serde_json::json!({"type": "error", "message": "boom"}));

		let resp: Response = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
		assert!(matches!(resp, Response::Pong));

		let resp: Response = serde_json::from_str(
			r#"{"type":"logs","tail":{"stdout":["a","b"]}}"#,
		)
		.unwrap();
		match resp {
			Response::Logs { tail } => {
				assert_eq!(tail.stdout, Some(vec!["a".to_string(), "b".to_string()]));
				assert!(tail.stderr.is_none());
			}
			other => panic!("unexpected response: {:?}", other),
		}
	}
}
