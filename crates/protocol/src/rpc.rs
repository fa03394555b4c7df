//! Script message channel and the RPC envelope that rides on it.
//!
//! Scripts and the host exchange [`ScriptMessage`]s. Remote procedure calls
//! are ordinary `send` payloads shaped as a tagged array:
//!
//! ```text
//! host -> script:  ["telco:rpc", id, "call", "method", [args...]]
//! script -> host:  ["telco:rpc", id, "ok", value]
//!                  ["telco:rpc", id, "error", "message"]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::value::RpcValue;

/// First element of every RPC envelope.
pub const RPC_TAG: &str = "telco:rpc";

/// Severity of a `log` message emitted by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Debug,
	Info,
	Warning,
	Error,
}

/// A message emitted by a loaded script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScriptMessage {
	/// Application payload (also carries RPC replies)
	Send { payload: Value },
	/// Console output from the script
	Log { level: LogLevel, payload: String },
	/// Uncaught error inside the script
	Error {
		description: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		stack: Option<String>,
	},
}

/// One entry of the RPC surface a script declares when it loads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportSignature {
	/// Exported function name, as declared by the payload
	pub name: String,
	/// Number of parameters, when the payload declares it
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arity: Option<usize>,
}

impl ExportSignature {
	/// Creates a signature without a declared arity.
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			arity: None,
		}
	}

	/// Creates a signature with a fixed arity.
	pub fn with_arity(name: impl Into<String>, arity: usize) -> Self {
		Self {
			name: name.into(),
			arity: Some(arity),
		}
	}
}

/// A decoded RPC call as seen by the script side.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
	pub id: u64,
	pub method: String,
	pub args: Vec<RpcValue>,
}

/// A decoded RPC reply as seen by the host side.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
	/// The call returned a value
	Ok { id: u64, value: RpcValue },
	/// The call raised an error inside the script
	Error { id: u64, message: String },
	/// The envelope was tagged as RPC but could not be decoded
	Malformed { id: Option<u64>, reason: String },
}

/// Builds the payload for an outgoing call.
pub fn call_payload(id: u64, method: &str, args: &[RpcValue]) -> Value {
	let args: Vec<Value> = args.iter().map(RpcValue::to_json).collect();
	json!([RPC_TAG, id, "call", method, args])
}

/// Builds a successful reply payload.
pub fn reply_ok(id: u64, value: &RpcValue) -> Value {
	json!([RPC_TAG, id, "ok", value.to_json()])
}

/// Builds an error reply payload.
pub fn reply_error(id: u64, message: &str) -> Value {
	json!([RPC_TAG, id, "error", message])
}

fn rpc_envelope(payload: &Value) -> Option<&[Value]> {
	let items = payload.as_array()?;
	match items.first() {
		Some(Value::String(tag)) if tag == RPC_TAG => Some(items),
		_ => None,
	}
}

/// Decodes an outgoing call. Returns `None` if the payload is not an RPC envelope.
pub fn parse_call(payload: &Value) -> Option<Result<RpcCall, String>> {
	let items = rpc_envelope(payload)?;
	Some((|| -> Result<RpcCall, String> {
		let id = items
			.get(1)
			.and_then(Value::as_u64)
			.ok_or("missing request id")?;
		match items.get(2).and_then(Value::as_str) {
			Some("call") => {}
			other => return Err(format!("unsupported operation {other:?}")),
		}
		let method = items
			.get(3)
			.and_then(Value::as_str)
			.ok_or("missing method name")?
			.to_string();
		let args = match items.get(4) {
			Some(Value::Array(args)) => args
				.iter()
				.cloned()
				.map(RpcValue::from_json)
				.collect::<Result<Vec<_>, _>>()?,
			None | Some(Value::Null) => Vec::new(),
			Some(_) => return Err("arguments must be an array".to_string()),
		};
		Ok(RpcCall { id, method, args })
	})())
}

/// Decodes a reply. Returns `None` if the payload is not an RPC envelope.
pub fn parse_reply(payload: &Value) -> Option<RpcReply> {
	let items = rpc_envelope(payload)?;
	let Some(id) = items.get(1).and_then(Value::as_u64) else {
		return Some(RpcReply::Malformed {
			id: None,
			reason: "missing request id".to_string(),
		});
	};
	let malformed = |reason: &str| RpcReply::Malformed {
		id: Some(id),
		reason: reason.to_string(),
	};

	Some(match (items.get(2).and_then(Value::as_str), items.get(3)) {
		(Some("ok"), Some(value)) => match RpcValue::from_json(value.clone()) {
			Ok(value) => RpcReply::Ok { id, value },
			Err(reason) => malformed(&reason),
		},
		(Some("ok"), None) => malformed("reply is missing its value"),
		(Some("error"), Some(Value::String(message))) => RpcReply::Error {
			id,
			message: message.clone(),
		},
		(Some("error"), _) => malformed("error reply is missing its message"),
		_ => malformed("unknown reply status"),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn call_envelope_round_trips() {
		let payload = call_payload(7, "add", &[RpcValue::Int(1), RpcValue::Int(2)]);
		let call = parse_call(&payload).unwrap().unwrap();
		assert_eq!(call.id, 7);
		assert_eq!(call.method, "add");
		assert_eq!(call.args, vec![RpcValue::Int(1), RpcValue::Int(2)]);
	}

	#[test]
	fn non_rpc_payloads_are_ignored() {
		assert!(parse_reply(&json!({"hello": "world"})).is_none());
		assert!(parse_reply(&json!(["other", 1, "ok", 2])).is_none());
		assert!(parse_call(&json!("text")).is_none());
	}

	#[test]
	fn reply_status_is_decoded() {
		match parse_reply(&reply_ok(3, &RpcValue::from("pong"))).unwrap() {
			RpcReply::Ok { id, value } => {
				assert_eq!(id, 3);
				assert_eq!(value.as_str(), Some("pong"));
			}
			other => panic!("Expected Ok, got {other:?}"),
		}

		match parse_reply(&reply_error(4, "boom")).unwrap() {
			RpcReply::Error { id, message } => {
				assert_eq!(id, 4);
				assert_eq!(message, "boom");
			}
			other => panic!("Expected Error, got {other:?}"),
		}
	}

	#[test]
	fn malformed_replies_keep_their_id() {
		match parse_reply(&json!([RPC_TAG, 9, "ok"])).unwrap() {
			RpcReply::Malformed { id, .. } => assert_eq!(id, Some(9)),
			other => panic!("Expected Malformed, got {other:?}"),
		}
		match parse_reply(&json!([RPC_TAG, "x"])).unwrap() {
			RpcReply::Malformed { id, .. } => assert_eq!(id, None),
			other => panic!("Expected Malformed, got {other:?}"),
		}
	}

	#[test]
	fn script_message_tags() {
		let msg: ScriptMessage =
			serde_json::from_value(json!({"type": "log", "level": "info", "payload": "hi"}))
				.unwrap();
		assert_eq!(
			msg,
			ScriptMessage::Log {
				level: LogLevel::Info,
				payload: "hi".to_string()
			}
		);
	}
}
