//! Script payloads for the in-process host.
//!
//! The in-process host does not execute script source. Instead, Rust
//! [`Agent`]s are registered against a source string; loading a script whose
//! source (or compiled bytecode) matches runs that agent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use telco_protocol::{ExportSignature, RpcValue};
use telco_runtime::{Error, Result};

/// Leading bytes of bytecode produced by `compile_script`.
pub const BYTECODE_MAGIC: &[u8; 4] = b"TBC\x01";

/// Script payload running inside a simulated process.
///
/// `call` runs on a blocking thread and may take as long as it likes.
pub trait Agent: Send + Sync {
	/// The RPC surface declared when the script loads.
	fn exports(&self) -> Vec<ExportSignature>;

	/// Invokes an exported function. `Err` is raised to the caller as an RPC error.
	fn call(&self, method: &str, args: Vec<RpcValue>) -> std::result::Result<RpcValue, String>;

	/// Handles a non-RPC message posted by the host. A returned payload is
	/// sent back as a `send` message.
	fn on_message(&self, message: Value, data: Option<Vec<u8>>) -> Option<Value> {
		let _ = (message, data);
		None
	}
}

type ExportFn = Arc<dyn Fn(Vec<RpcValue>) -> std::result::Result<RpcValue, String> + Send + Sync>;
type MessageFn = Arc<dyn Fn(Value, Option<Vec<u8>>) -> Option<Value> + Send + Sync>;

/// [`Agent`] assembled from closures.
///
/// ```ignore
/// let agent = FnAgent::new()
///     .export("add", 2, |args| Ok(RpcValue::Int(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0))));
/// ```
#[derive(Clone, Default)]
pub struct FnAgent {
	exports: BTreeMap<String, (Option<usize>, ExportFn)>,
	on_message: Option<MessageFn>,
}

impl FnAgent {
	pub fn new() -> Self {
		Self::default()
	}

	/// Exports a function with a fixed arity.
	pub fn export<F>(mut self, name: impl Into<String>, arity: usize, f: F) -> Self
	where
		F: Fn(Vec<RpcValue>) -> std::result::Result<RpcValue, String> + Send + Sync + 'static,
	{
		self.exports.insert(name.into(), (Some(arity), Arc::new(f)));
		self
	}

	/// Exports a function accepting any number of arguments.
	pub fn export_variadic<F>(mut self, name: impl Into<String>, f: F) -> Self
	where
		F: Fn(Vec<RpcValue>) -> std::result::Result<RpcValue, String> + Send + Sync + 'static,
	{
		self.exports.insert(name.into(), (None, Arc::new(f)));
		self
	}

	/// Handles posted messages.
	pub fn on_message<F>(mut self, f: F) -> Self
	where
		F: Fn(Value, Option<Vec<u8>>) -> Option<Value> + Send + Sync + 'static,
	{
		self.on_message = Some(Arc::new(f));
		self
	}
}

impl Agent for FnAgent {
	fn exports(&self) -> Vec<ExportSignature> {
		self.exports
			.iter()
			.map(|(name, (arity, _))| ExportSignature {
				name: name.clone(),
				arity: *arity,
			})
			.collect()
	}

	fn call(&self, method: &str, args: Vec<RpcValue>) -> std::result::Result<RpcValue, String> {
		match self.exports.get(method) {
			Some((_, f)) => f(args),
			None => Err(format!("unable to find method '{method}'")),
		}
	}

	fn on_message(&self, message: Value, data: Option<Vec<u8>>) -> Option<Value> {
		self.on_message.as_ref().and_then(|f| f(message, data))
	}
}

impl fmt::Debug for FnAgent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FnAgent")
			.field("exports", &self.exports.keys().collect::<Vec<_>>())
			.finish()
	}
}

/// Agent for sources nobody registered: no exports, ignores messages.
pub(crate) struct NullAgent;

impl Agent for NullAgent {
	fn exports(&self) -> Vec<ExportSignature> {
		Vec::new()
	}

	fn call(&self, method: &str, _args: Vec<RpcValue>) -> std::result::Result<RpcValue, String> {
		Err(format!("unable to find method '{method}'"))
	}
}

/// Produces bytecode for `source`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an empty source.
pub fn compile(source: &str) -> Result<Vec<u8>> {
	if source.trim().is_empty() {
		return Err(Error::InvalidArgument("script source is empty".to_string()));
	}
	let mut bytecode = BYTECODE_MAGIC.to_vec();
	bytecode.extend_from_slice(source.as_bytes());
	Ok(bytecode)
}

/// Recovers the source from bytecode produced by [`compile`].
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the magic is wrong or the body is not UTF-8.
pub fn decompile(bytecode: &[u8]) -> Result<String> {
	let body = bytecode
		.strip_prefix(BYTECODE_MAGIC.as_slice())
		.ok_or_else(|| Error::Protocol("malformed bytecode: bad magic".to_string()))?;
	String::from_utf8(body.to_vec())
		.map_err(|_| Error::Protocol("malformed bytecode: invalid body".to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bytecode_round_trips() {
		let bytecode = compile("rpc.exports = {}").unwrap();
		assert!(bytecode.starts_with(BYTECODE_MAGIC));
		assert_eq!(decompile(&bytecode).unwrap(), "rpc.exports = {}");
	}

	#[test]
	fn bad_magic_is_a_protocol_error() {
		let err = decompile(b"garbage").unwrap_err();
		assert!(matches!(err, Error::Protocol(_)));
		assert!(compile("   ").is_err());
	}

	#[test]
	fn fn_agent_dispatches_by_name() {
		let agent = FnAgent::new()
			.export("double", 1, |args| {
				Ok(RpcValue::Int(args[0].as_i64().unwrap_or_default() * 2))
			})
			.export_variadic("count", |args| Ok(RpcValue::Int(args.len() as i64)));

		let exports = agent.exports();
		assert_eq!(exports.len(), 2);
		assert!(exports.contains(&ExportSignature::with_arity("double", 1)));
		assert!(exports.contains(&ExportSignature::new("count")));

		assert_eq!(agent.call("double", vec![RpcValue::Int(21)]), Ok(RpcValue::Int(42)));
		assert!(agent.call("missing", vec![]).is_err());
	}
}
