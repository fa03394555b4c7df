//! Wait bounds for blocking lookups.

use std::time::Duration;

use tokio::time::Instant;

/// How long a blocking lookup may wait.
///
/// Numeric conversions follow the usual convention: `0` means do not wait,
/// a positive value is a bound in seconds, a negative value waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
	/// Check once and return.
	#[default]
	NoWait,
	/// Wait at most this long.
	After(Duration),
	/// Wait until matched or cancelled.
	Forever,
}

impl Timeout {
	/// Absolute deadline measured from now, or `None` for [`Timeout::Forever`]
	/// and for bounds too far out to represent.
	pub fn deadline(&self) -> Option<Instant> {
		match self {
			Timeout::NoWait => Some(Instant::now()),
			Timeout::After(duration) => Instant::now().checked_add(*duration),
			Timeout::Forever => None,
		}
	}

	/// Sleeps until [`deadline`](Self::deadline); never resolves for [`Timeout::Forever`].
	pub async fn elapsed(deadline: Option<Instant>) {
		match deadline {
			Some(deadline) => tokio::time::sleep_until(deadline).await,
			None => std::future::pending().await,
		}
	}
}

impl From<Duration> for Timeout {
	fn from(duration: Duration) -> Self {
		if duration.is_zero() {
			Timeout::NoWait
		} else {
			Timeout::After(duration)
		}
	}
}

impl From<Option<Duration>> for Timeout {
	fn from(duration: Option<Duration>) -> Self {
		duration.map_or(Timeout::Forever, Timeout::from)
	}
}

impl From<f64> for Timeout {
	fn from(seconds: f64) -> Self {
		if seconds == 0.0 {
			Timeout::NoWait
		} else if seconds < 0.0 || !seconds.is_finite() {
			Timeout::Forever
		} else {
			Duration::try_from_secs_f64(seconds).map_or(Timeout::Forever, Timeout::After)
		}
	}
}

impl From<i32> for Timeout {
	fn from(seconds: i32) -> Self {
		Timeout::from(f64::from(seconds))
	}
}

impl From<i64> for Timeout {
	fn from(seconds: i64) -> Self {
		Timeout::from(seconds as f64)
	}
}
