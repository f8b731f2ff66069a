//! TCP reachability probing (§4.4).

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::MachineEntry;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of the most recent dial to a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PingResult {
	Reachable { rtt: Duration },
	Unreachable,
}

pub type PingSnapshot = HashMap<MachineId, PingResult>;

type DialFn = Arc<
	dyn Fn(SocketAddr) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync,
>;

/// Dials each known peer at an interval (default 10s, §4.4), recording
/// RTT on success or `Unreachable` on timeout/refusal. The dial itself
/// is injectable so tests don't need a real socket (mirrors how
/// `ployz_reconcile`'s driver is swapped for a fake in tests).
pub struct PingTracker {
	self_id: Mutex<MachineId>,
	probe_port: u16,
	interval: Duration,
	timeout: Duration,
	dial: DialFn,
	peers: Mutex<HashMap<MachineId, Ipv6Addr>>,
	results: Mutex<PingSnapshot>,
}

impl PingTracker {
	pub fn new(self_id: MachineId, probe_port: u16) -> Self {
		Self::with_dial(self_id, probe_port, Arc::new(real_dial))
	}

	pub fn with_dial(self_id: MachineId, probe_port: u16, dial: DialFn) -> Self {
		Self {
			self_id: Mutex::new(self_id),
			probe_port,
			interval: DEFAULT_INTERVAL,
			timeout: DEFAULT_TIMEOUT,
			dial,
			peers: Mutex::new(HashMap::new()),
			results: Mutex::new(HashMap::new()),
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	/// Update which peer is "self" once local identity becomes known
	/// (§4.6, the identity is only generated during `Controller::start`).
	pub fn set_self_id(&self, self_id: MachineId) {
		*self.self_id.lock().unwrap() = self_id;
	}

	/// Replace the set of peers to dial, keyed by management IP. Called
	/// whenever the registry subscription delivers a change (§4.5).
	pub fn update_peers(&self, rows: &[MachineEntry]) {
		let self_id = *self.self_id.lock().unwrap();
		let mut peers = self.peers.lock().unwrap();
		peers.clear();
		for row in rows {
			if row.id != self_id {
				peers.insert(row.id, row.management_ip);
			}
		}
	}

	pub fn snapshot(&self) -> PingSnapshot {
		self.results.lock().unwrap().clone()
	}

	/// One probing pass over every known peer, run concurrently.
	async fn probe_once(&self) {
		let targets: Vec<(MachineId, SocketAddr)> = self
			.peers
			.lock()
			.unwrap()
			.iter()
			.map(|(id, ip)| (*id, SocketAddr::from((*ip, self.probe_port))))
			.collect();

		let timeout = self.timeout;
		let dial = self.dial.clone();
		let mut handles = Vec::with_capacity(targets.len());
		for (id, addr) in targets {
			let dial = dial.clone();
			handles.push(async move {
				let started = Instant::now();
				let outcome = tokio::time::timeout(timeout, dial(addr)).await;
				let result = match outcome {
					Ok(Ok(())) => PingResult::Reachable { rtt: started.elapsed() },
					_ => PingResult::Unreachable,
				};
				(id, result)
			});
		}
		let outcomes = futures::future::join_all(handles).await;
		let mut results = self.results.lock().unwrap();
		for (id, result) in outcomes {
			results.insert(id, result);
		}
	}

	/// Run the probing loop until `stop_signal` fires, matching the
	/// `status_exchange_loop` idiom: sleep-or-stop raced in a `select!`.
	pub async fn run(&self, mut stop_signal: tokio::sync::watch::Receiver<bool>) {
		while !*stop_signal.borrow() {
			let restart_at = Instant::now() + self.interval;
			self.probe_once().await;
			tokio::select! {
				_ = tokio::time::sleep_until(restart_at.into()) => {},
				_ = stop_signal.changed() => {},
			}
		}
	}
}

fn real_dial(addr: SocketAddr) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> {
	Box::pin(async move {
		tokio::net::TcpStream::connect(addr)
			.await
			.map(|_| ())
			.map_err(|e| Error::Unavailable(format!("dial {} failed: {}", addr, e)))
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

	fn row(id: u8, ip: &str) -> MachineEntry {
		MachineEntry {
			id: MachineId([id; 32]),
			public_key: MachineId([id; 32]),
			subnet: format!("10.210.{}.0/24", id),
			management_ip: ip.parse().unwrap(),
			endpoint: None,
			last_updated: Utc::now(),
			version: 1,
		}
	}

	fn always_ok() -> DialFn {
		Arc::new(|_addr| Box::pin(async { Ok(()) }))
	}

	fn always_fails() -> DialFn {
		Arc::new(|addr| Box::pin(async move { Err(Error::Unavailable(format!("refused {}", addr))) }))
	}

	#[tokio::test]
	async fn self_peer_is_skipped() {
		let self_id = MachineId([1u8; 32]);
		let tracker = PingTracker::with_dial(self_id, 9000, always_ok());
		tracker.update_peers(&[row(1, "fd00::1")]);
		tracker.probe_once().await;
		assert!(tracker.snapshot().is_empty());
	}

	#[tokio::test]
	async fn reachable_peer_records_rtt() {
		let self_id = MachineId([1u8; 32]);
		let tracker = PingTracker::with_dial(self_id, 9000, always_ok());
		tracker.update_peers(&[row(2, "fd00::2")]);
		tracker.probe_once().await;
		match tracker.snapshot()[&MachineId([2u8; 32])] {
			PingResult::Reachable { .. } => {}
			PingResult::Unreachable => panic!("expected reachable"),
		}
	}

	#[tokio::test]
	async fn failing_dial_marks_unreachable() {
		let self_id = MachineId([1u8; 32]);
		let tracker = PingTracker::with_dial(self_id, 9000, always_fails());
		tracker.update_peers(&[row(2, "fd00::2")]);
		tracker.probe_once().await;
		assert_eq!(tracker.snapshot()[&MachineId([2u8; 32])], PingResult::Unreachable);
	}
}
