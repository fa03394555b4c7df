//! Seam between the object model and an instrumentation backend.

use crate::context::Context;
use crate::error::Result;
use crate::transport::TransportParts;

/// Something that can serve the control protocol.
///
/// `connect` is called once per device manager. The backend may spawn tasks
/// on the context's runtime and must keep serving until its end of the
/// transport is closed.
pub trait Backend: Send + Sync {
	/// Short name used in logs.
	fn name(&self) -> &str;

	/// Opens a transport to the backend.
	///
	/// # Errors
	///
	/// Returns [`Error::ServerNotRunning`](crate::Error::ServerNotRunning) if
	/// the backend cannot be reached.
	fn connect(&self, ctx: &Context) -> Result<TransportParts>;
}
