//! Message transports between a [`Connection`](crate::Connection) and a backend.
//!
//! A transport moves whole JSON messages. Framing, if any, is the transport's
//! business; the connection only sees [`serde_json::Value`]s. The workspace
//! ships [`ChannelTransport`], an in-memory pair used by the in-process host.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Boxed future returned by [`Transport::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Outbound half of a transport.
pub trait Transport: Send {
	/// Sends one message to the peer.
	fn send(&mut self, message: Value) -> SendFuture<'_>;
}

/// Both halves of a transport, ready to be driven by a connection.
pub struct TransportParts {
	/// Outbound half
	pub sender: Box<dyn Transport>,
	/// Inbound messages; the stream ends when the peer goes away
	pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// In-memory transport backed by an unbounded channel.
pub struct ChannelTransport {
	tx: mpsc::UnboundedSender<Value>,
}

impl ChannelTransport {
	/// Wraps the sending side of a channel whose receiver belongs to the peer.
	pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
		Self { tx }
	}

	/// Creates two connected endpoints.
	///
	/// Whatever one side sends arrives on the other's `message_rx`.
	pub fn pair() -> (TransportParts, TransportParts) {
		let (a_tx, a_rx) = mpsc::unbounded_channel();
		let (b_tx, b_rx) = mpsc::unbounded_channel();
		let a = TransportParts {
			sender: Box::new(ChannelTransport { tx: b_tx }),
			message_rx: a_rx,
		};
		let b = TransportParts {
			sender: Box::new(ChannelTransport { tx: a_tx }),
			message_rx: b_rx,
		};
		(a, b)
	}
}

impl Transport for ChannelTransport {
	fn send(&mut self, message: Value) -> SendFuture<'_> {
		let result = self
			.tx
			.send(message)
			.map_err(|_| Error::Transport("peer closed the channel".to_string()));
		Box::pin(async move { result })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn pair_is_cross_wired() {
		let (mut client, mut server) = ChannelTransport::pair();

		client.sender.send(json!({"id": 1})).await.unwrap();
		server.sender.send(json!({"id": 2})).await.unwrap();

		assert_eq!(server.message_rx.recv().await.unwrap(), json!({"id": 1}));
		assert_eq!(client.message_rx.recv().await.unwrap(), json!({"id": 2}));
	}

	#[tokio::test]
	async fn send_fails_once_peer_is_gone() {
		let (mut client, server) = ChannelTransport::pair();
		drop(server);

		let err = client.sender.send(json!(null)).await.unwrap_err();
		assert!(matches!(err, Error::Transport(_)));
	}

	#[tokio::test]
	async fn receiver_ends_when_peer_sender_drops() {
		let (mut client, server) = ChannelTransport::pair();
		drop(server.sender);
		assert!(client.message_rx.recv().await.is_none());
	}
}
