//! Typed, transition-checked phase enums (§4.1, C1).
//!
//! Every FSM here is a small `Copy` enum plus a table of allowed
//! `(from, to)` pairs. [`PhaseCell`] wraps one such enum behind a lock and
//! enforces the table on every `transition`: in debug builds an invalid
//! transition panics (a programming error, per spec); in release builds it
//! is logged and the phase is left unchanged. This mirrors the way the
//! teacher crate treats invariant violations as either a hard `assert!` or
//! a `warn!`-and-continue, depending on build profile, rather than
//! threading a `Result` through call sites that can never legitimately
//! fail.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// A phase enum with a statically known transition table.
pub trait Phase: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
	fn initial() -> Self;
	fn is_allowed(from: Self, to: Self) -> bool;
}

/// Thread-safe holder for a [`Phase`], enforcing its transition table.
pub struct PhaseCell<P: Phase> {
	current: RwLock<P>,
}

impl<P: Phase> PhaseCell<P> {
	pub fn new() -> Self {
		Self {
			current: RwLock::new(P::initial()),
		}
	}

	pub fn get(&self) -> P {
		*self.current.read().unwrap()
	}

	/// Attempt `from -> to`. Returns `true` if the transition was applied.
	/// An invalid transition is a programming error: it panics in debug
	/// builds and is logged-and-ignored in release builds, per §4.1.
	pub fn transition(&self, to: P) -> bool {
		let mut guard = self.current.write().unwrap();
		let from = *guard;
		if P::is_allowed(from, to) {
			*guard = to;
			true
		} else {
			debug_assert!(
				false,
				"invalid phase transition attempted: {:?} -> {:?}",
				from, to
			);
			tracing::error!(
				"ignoring invalid phase transition: {:?} -> {:?}",
				from,
				to
			);
			false
		}
	}
}

impl<P: Phase> Default for PhaseCell<P> {
	fn default() -> Self {
		Self::new()
	}
}

/// Supervisor lifecycle phase (§4.1, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
	Absent,
	Starting,
	Running,
	Degraded,
	Backoff,
	GivingUp,
	Stopping,
}

impl Phase for SupervisorPhase {
	fn initial() -> Self {
		SupervisorPhase::Absent
	}

	fn is_allowed(from: Self, to: Self) -> bool {
		use SupervisorPhase::*;
		matches!(
			(from, to),
			(Absent, Starting)
				| (Starting, Running)
				| (Starting, Degraded)
				| (Starting, Backoff)
				| (Starting, Stopping)
				| (Running, Degraded)
				| (Running, Stopping)
				| (Degraded, Running)
				| (Degraded, Backoff)
				| (Degraded, Stopping)
				| (Backoff, Starting)
				| (Backoff, GivingUp)
				| (Backoff, Stopping)
				| (Stopping, Absent)
		)
	}
}

impl SupervisorPhase {
	/// `true` iff this phase means the supervisor counts as "running" for
	/// `ApplyResult.supervisor_running` (§4.8).
	pub fn counts_as_running(&self) -> bool {
		matches!(
			self,
			SupervisorPhase::Starting
				| SupervisorPhase::Running
				| SupervisorPhase::Degraded
				| SupervisorPhase::Backoff
		)
	}

	/// `GivingUp` is terminal: no auto-restart (§4.1).
	pub fn is_terminal(&self) -> bool {
		matches!(self, SupervisorPhase::GivingUp)
	}
}

/// Per-peer reachability phase (§4.1, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingPhase {
	NoData,
	Reachable,
	Unreachable,
}

impl Phase for PingPhase {
	fn initial() -> Self {
		PingPhase::NoData
	}

	fn is_allowed(from: Self, to: Self) -> bool {
		use PingPhase::*;
		matches!(
			(from, to),
			(NoData, Reachable) | (NoData, Unreachable) | (Reachable, Unreachable) | (Unreachable, Reachable)
		)
	}
}

/// RPC server bring-up phase (§4.1, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServePhase {
	StartingInternal,
	StartingProxy,
	WaitingForIdentity,
	Serving,
	ShuttingDown,
}

impl Phase for ServePhase {
	fn initial() -> Self {
		ServePhase::StartingInternal
	}

	fn is_allowed(from: Self, to: Self) -> bool {
		use ServePhase::*;
		matches!(
			(from, to),
			(StartingInternal, StartingProxy)
				| (StartingProxy, WaitingForIdentity)
				| (WaitingForIdentity, Serving)
				| (StartingInternal, ShuttingDown)
				| (StartingProxy, ShuttingDown)
				| (WaitingForIdentity, ShuttingDown)
				| (Serving, ShuttingDown)
		)
	}
}
