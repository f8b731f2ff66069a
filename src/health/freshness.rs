//! Per-peer observation freshness (§4.4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use ployz_util::id::MachineId;
use ployz_util::model::MachineEntry;

const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Observation {
	row: MachineEntry,
	observed_at: DateTime<Utc>,
}

/// `{id -> (Freshness, ReplicationLag, Stale)}` derived from the last
/// `Update(row)` call for each peer (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessEntry {
	pub freshness: chrono::Duration,
	pub replication_lag: chrono::Duration,
	pub stale: bool,
}

pub type FreshnessSnapshot = HashMap<MachineId, FreshnessEntry>;

/// Thread-safe tracker of `(last_seen_version, observed_at)` per peer,
/// fed by registry subscription events (§4.4).
pub struct FreshnessTracker {
	threshold: Duration,
	observations: Mutex<HashMap<MachineId, Observation>>,
}

impl FreshnessTracker {
	pub fn new() -> Self {
		Self::with_threshold(DEFAULT_STALE_THRESHOLD)
	}

	pub fn with_threshold(threshold: Duration) -> Self {
		Self {
			threshold,
			observations: Mutex::new(HashMap::new()),
		}
	}

	/// Record a fresh observation of `row`, timestamped now.
	pub fn update(&self, row: MachineEntry) {
		let mut observations = self.observations.lock().unwrap();
		observations.insert(
			row.id,
			Observation {
				row,
				observed_at: Utc::now(),
			},
		);
	}

	pub fn remove(&self, id: MachineId) {
		self.observations.lock().unwrap().remove(&id);
	}

	pub fn snapshot(&self) -> FreshnessSnapshot {
		let now = Utc::now();
		let threshold = chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::seconds(30));
		self.observations
			.lock()
			.unwrap()
			.iter()
			.map(|(id, obs)| {
				let freshness = now - obs.observed_at;
				let replication_lag = now - obs.row.last_updated;
				(
					*id,
					FreshnessEntry {
						freshness,
						replication_lag,
						stale: freshness > threshold,
					},
				)
			})
			.collect()
	}
}

impl Default for FreshnessTracker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv6Addr;

	fn sample_row(id: u8) -> MachineEntry {
		MachineEntry {
			id: MachineId([id; 32]),
			public_key: MachineId([id; 32]),
			subnet: format!("10.210.{}.0/24", id),
			management_ip: format!("fd00::{}", id).parse::<Ipv6Addr>().unwrap(),
			endpoint: None,
			last_updated: Utc::now(),
			version: 1,
		}
	}

	#[test]
	fn freshly_updated_peer_is_not_stale() {
		let tracker = FreshnessTracker::new();
		tracker.update(sample_row(1));
		let snap = tracker.snapshot();
		let entry = &snap[&MachineId([1u8; 32])];
		assert!(!entry.stale);
	}

	#[test]
	fn threshold_of_zero_marks_everything_stale() {
		let tracker = FreshnessTracker::with_threshold(Duration::from_secs(0));
		tracker.update(sample_row(1));
		std::thread::sleep(std::time::Duration::from_millis(5));
		let snap = tracker.snapshot();
		assert!(snap[&MachineId([1u8; 32])].stale);
	}

	#[test]
	fn removed_peer_disappears_from_snapshot() {
		let tracker = FreshnessTracker::new();
		tracker.update(sample_row(1));
		tracker.remove(MachineId([1u8; 32]));
		assert!(tracker.snapshot().is_empty());
	}
}
