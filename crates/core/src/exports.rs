//! RPC surface of a loaded script.
//!
//! The export table is fixed when the script loads. Lookups accept the
//! declared name or its snake_case spelling, so `list_threads` reaches an
//! export declared as `listThreads`.

use std::sync::Arc;

use indexmap::IndexMap;
use telco_protocol::{ExportSignature, RpcValue};
use telco_runtime::{Cancellable, Error, Result};

use crate::script::Script;

/// Name-indexed dispatch table negotiated at load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportTable {
	entries: IndexMap<String, ExportSignature>,
}

impl ExportTable {
	pub fn new(signatures: impl IntoIterator<Item = ExportSignature>) -> Self {
		Self {
			entries: signatures
				.into_iter()
				.map(|signature| (signature.name.clone(), signature))
				.collect(),
		}
	}

	/// Declared names, in declaration order.
	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.entries.keys().map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Looks up an export by declared or snake_case name.
	pub fn get(&self, name: &str) -> Option<&ExportSignature> {
		self.entries
			.get(name)
			.or_else(|| self.entries.get(&snake_to_camel(name)))
	}

	pub fn has(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	/// Resolves a call, checking the declared arity.
	pub(crate) fn resolve(&self, name: &str, argc: usize) -> Result<&ExportSignature> {
		let signature = self
			.get(name)
			.ok_or_else(|| Error::InvalidArgument(format!("no export named '{name}'")))?;
		match signature.arity {
			Some(arity) if arity != argc => Err(Error::InvalidArgument(format!(
				"export '{}' expects {arity} argument(s), got {argc}",
				signature.name
			))),
			_ => Ok(signature),
		}
	}
}

fn snake_to_camel(name: &str) -> String {
	let mut out = String::with_capacity(name.len());
	let mut upper = false;
	for (i, c) in name.chars().enumerate() {
		if c == '_' && i > 0 {
			upper = true;
		} else if upper {
			out.extend(c.to_uppercase());
			upper = false;
		} else {
			out.push(c);
		}
	}
	out
}

/// Async handle to a script's exports.
///
/// Usable from inside any tokio runtime. Calls fail with
/// [`Error::InvalidOperation`] once the script is unloaded.
#[derive(Clone)]
pub struct Exports {
	script: Script,
	table: Arc<ExportTable>,
}

impl Exports {
	pub(crate) fn new(script: Script, table: Arc<ExportTable>) -> Self {
		Self { script, table }
	}

	pub fn table(&self) -> &ExportTable {
		&self.table
	}

	pub fn names(&self) -> Vec<String> {
		self.table.names().map(str::to_string).collect()
	}

	pub fn has(&self, name: &str) -> bool {
		self.table.has(name)
	}

	/// Calls an export and waits for its reply.
	///
	/// # Errors
	///
	/// - [`Error::InvalidArgument`] for an unknown name or wrong arity
	/// - [`Error::Rpc`] if the export raised
	/// - [`Error::TimedOut`] after the manager's RPC timeout
	/// - [`Error::Protocol`] if the reply is malformed
	/// - [`Error::InvalidOperation`] if the script is unloaded before the reply
	pub async fn call(&self, name: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
		self.script.inner().call(name, args).await
	}

	/// Blocking view of the same exports.
	pub fn blocking(&self) -> ExportsSync {
		ExportsSync {
			exports: self.clone(),
		}
	}
}

/// Blocking handle to a script's exports.
#[derive(Clone)]
pub struct ExportsSync {
	exports: Exports,
}

impl ExportsSync {
	pub(crate) fn new(exports: Exports) -> Self {
		Self { exports }
	}

	pub fn table(&self) -> &ExportTable {
		self.exports.table()
	}

	pub fn names(&self) -> Vec<String> {
		self.exports.names()
	}

	pub fn has(&self, name: &str) -> bool {
		self.exports.has(name)
	}

	/// Calls an export, blocking the current thread.
	///
	/// Honors the thread's current cancellable, if any.
	pub fn call(&self, name: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
		self.call_with_cancellable(name, args, None)
	}

	/// Like [`call`](Self::call), failing with [`Error::Cancelled`] as soon as
	/// `cancellable` fires.
	pub fn call_with_cancellable(
		&self,
		name: &str,
		args: Vec<RpcValue>,
		cancellable: Option<&Cancellable>,
	) -> Result<RpcValue> {
		let inner = self.exports.script.inner();
		inner
			.shared()
			.ctx
			.run(inner.call(name, args), cancellable)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table() -> ExportTable {
		ExportTable::new([
			ExportSignature::with_arity("listThreads", 0),
			ExportSignature::with_arity("add", 2),
			ExportSignature::new("log"),
		])
	}

	#[test]
	fn snake_case_reaches_camel_case_export() {
		let table = table();
		assert_eq!(table.get("list_threads").unwrap().name, "listThreads");
		assert_eq!(table.get("listThreads").unwrap().name, "listThreads");
		assert!(!table.has("list_processes"));
		assert_eq!(snake_to_camel("_private"), "_private");
		assert_eq!(snake_to_camel("a_b_c"), "aBC");
	}

	#[test]
	fn resolve_checks_arity() {
		let table = table();
		assert!(table.resolve("add", 2).is_ok());
		assert!(table.resolve("log", 5).is_ok());

		let err = table.resolve("add", 1).unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)));
		assert_eq!(err.to_string(), "export 'add' expects 2 argument(s), got 1");

		let err = table.resolve("nope", 0).unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)));
	}

	#[test]
	fn names_keep_declaration_order() {
		let table = table();
		let names: Vec<&str> = table.names().collect();
		assert_eq!(names, ["listThreads", "add", "log"]);
	}
}
