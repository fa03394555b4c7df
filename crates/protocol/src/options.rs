//! Option structs for lifecycle operations.
//!
//! These types represent the configuration passed to `spawn`, `attach` and
//! script creation. They are designed for serialization to the control
//! protocol and follow a consuming-builder style.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Realm, Stdio};

/// Options for `spawn()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
	/// Argument vector, including `argv[0]`
	#[serde(skip_serializing_if = "Option::is_none")]
	pub argv: Option<Vec<String>>,

	/// Complete environment, replacing the backend's
	#[serde(skip_serializing_if = "Option::is_none")]
	pub envp: Option<BTreeMap<String, String>>,

	/// Extra environment merged into the backend's
	#[serde(skip_serializing_if = "Option::is_none")]
	pub env: Option<BTreeMap<String, String>>,

	/// Working directory
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cwd: Option<String>,

	/// Standard stream wiring
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stdio: Option<Stdio>,

	/// Backend-specific auxiliary options
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub aux: BTreeMap<String, Value>,
}

impl SpawnOptions {
	/// Creates new default options.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the argument vector.
	pub fn argv<I, S>(mut self, argv: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.argv = Some(argv.into_iter().map(Into::into).collect());
		self
	}

	/// Replaces the whole environment.
	pub fn envp<I, K, V>(mut self, envp: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		self.envp = Some(envp.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
		self
	}

	/// Adds variables on top of the inherited environment.
	pub fn env<I, K, V>(mut self, env: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		self.env = Some(env.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
		self
	}

	/// Sets the working directory.
	pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
		self.cwd = Some(cwd.into());
		self
	}

	/// Sets stdio wiring.
	pub fn stdio(mut self, stdio: Stdio) -> Self {
		self.stdio = Some(stdio);
		self
	}

	/// Adds an auxiliary option.
	pub fn aux(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.aux.insert(key.into(), value.into());
		self
	}
}

/// Options for `attach()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
	/// Realm to attach in
	#[serde(skip_serializing_if = "Option::is_none")]
	pub realm: Option<Realm>,

	/// Seconds the backend keeps the session alive across a transport drop
	#[serde(default)]
	pub persist_timeout: u32,
}

impl SessionOptions {
	/// Creates new default options.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the realm.
	pub fn realm(mut self, realm: Realm) -> Self {
		self.realm = Some(realm);
		self
	}

	/// Sets the persist timeout in seconds.
	pub fn persist_timeout(mut self, seconds: u32) -> Self {
		self.persist_timeout = seconds;
		self
	}
}

/// Options for script creation and compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOptions {
	/// Script name, used in diagnostics
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

impl ScriptOptions {
	/// Creates new default options.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the script name.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}
}
