//! Runtime substrate for telco.
//!
//! This crate provides the machinery shared by the object model:
//! - [`Error`] and [`ErrorKind`], the error surface of every operation
//! - [`Cancellable`], cooperative cancellation that works across threads
//! - [`EventHub`], typed handler registries with off-thread delivery
//! - [`Context`], the background tokio runtime plus event delivery thread
//! - [`Connection`] and [`Channel`], JSON-RPC correlation over a [`Transport`]
//! - [`Backend`], the seam behind which an instrumentation engine lives

pub mod backend;
pub mod cancellable;
pub mod channel;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod timeout;
pub mod transport;

pub use backend::Backend;
pub use cancellable::Cancellable;
pub use channel::Channel;
pub use connection::{Connection, ErrorPayload, Event, EventTarget, Message, Request, Response};
pub use context::{Context, Dispatcher};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventHub, EventKind, HandlerId, next_handler_id};
pub use timeout::Timeout;
pub use transport::{ChannelTransport, SendFuture, Transport, TransportParts};
