//! Typed request proxy for one remote object.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::Result;

/// Sends requests on behalf of the object identified by `guid`.
#[derive(Clone)]
pub struct Channel {
	guid: Arc<str>,
	connection: Arc<Connection>,
}

impl Channel {
	pub fn new(guid: impl Into<Arc<str>>, connection: Arc<Connection>) -> Self {
		Self {
			guid: guid.into(),
			connection,
		}
	}

	/// Sends a method call and decodes the response.
	pub async fn send<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
		let params = serde_json::to_value(params)?;
		let response = self
			.connection
			.send_message(&self.guid, method, params)
			.await?;
		serde_json::from_value(response).map_err(Into::into)
	}

	/// Sends a method call with no parameters.
	pub async fn send_no_params<R: DeserializeOwned>(&self, method: &str) -> Result<R> {
		self.send(method, Value::Null).await
	}

	/// Sends a method call whose result is ignored.
	pub async fn send_no_result<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
		let _: Value = self.send(method, params).await?;
		Ok(())
	}

	pub fn guid(&self) -> &str {
		&self.guid
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}

	/// Returns a channel for another object on the same connection.
	pub fn sibling(&self, guid: impl Into<Arc<str>>) -> Channel {
		Channel::new(guid, Arc::clone(&self.connection))
	}
}
