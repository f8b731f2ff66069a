//! Time helpers shared across trackers and the registry client.
//!
//! All wall-clock reads go through [`now`] so that tests can substitute a
//! fake clock by constructing values directly instead of calling it.

use chrono::{DateTime, Utc};

use crate::error::Error;

pub fn now() -> DateTime<Utc> {
	Utc::now()
}

/// Render a timestamp as RFC3339, the wire/disk format for
/// `MachineEntry.last_updated`.
pub fn to_rfc3339(t: DateTime<Utc>) -> String {
	t.to_rfc3339()
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, Error> {
	DateTime::parse_from_rfc3339(s)
		.map(|t| t.with_timezone(&Utc))
		.map_err(|e| Error::InvalidArgument(format!("invalid RFC3339 timestamp {:?}: {}", s, e)))
}

/// A source of the current time, abstracted so the supervisor and health
/// trackers can be driven deterministically in tests (see `FakeClock`
/// implementations in `ployz_supervisor`/`ployz_health`).
pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;
}

/// The production clock: reads the system clock directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		now()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_rfc3339() {
		let t = now();
		let s = to_rfc3339(t);
		let back = parse_rfc3339(&s).unwrap();
		// RFC3339 serialization truncates to the encoded precision; compare timestamps.
		assert_eq!(t.timestamp(), back.timestamp());
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse_rfc3339("not a date").is_err());
	}
}
