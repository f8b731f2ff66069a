//! The per-network convergence loop (§4.7, C7).
//!
//! `Supervisor::spawn` starts one background task per enabled network,
//! the way `garage_rpc::system::System::run` joins its `discovery_loop`
//! and `status_exchange_loop` tasks: a `watch::Receiver<bool>` carries
//! cancellation into a `select!` raced against the loop's own timers, so
//! shutdown is cooperative rather than abrupt. Unlike those two loops,
//! this one also retries its own setup with exponential backoff (§4.7
//! step 6), since `Controller::start` can fail for reasons outside the
//! daemon's control (an unreachable container runtime, a slow
//! membership-store bootstrap).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use ployz_controller::Controller;
use ployz_health::{FreshnessTracker, NtpChecker, NtpStatus, PingSnapshot, PingTracker};
use ployz_phases::{PhaseCell, SupervisorPhase};
use ployz_reconcile::WireGuardDriver;
use ployz_registry::{ChangeEvent, RegistryClient};
use ployz_store::StateStore;
use ployz_util::error::Error;
use ployz_util::model::{MachineEntry, NetworkSpec};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const GIVE_UP_AFTER: u32 = 100;
const PERIODIC_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(1);
const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Collaborators a [`Supervisor`] drives; grouped so `Manager` only
/// assembles one value per `ApplyNetworkSpec` call.
pub struct SupervisorDeps {
	pub controller: Arc<Controller>,
	pub registry: Arc<dyn RegistryClient>,
	pub driver: Arc<dyn WireGuardDriver>,
	pub ping_probe_port: u16,
}

/// Backoff tuning for the run loop's step 6 (§4.7). Exposed so tests
/// don't have to wait out a real 2s-to-60s, 100-failure backoff.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub give_up_after: u32,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			initial_delay: INITIAL_RETRY_DELAY,
			max_delay: MAX_RETRY_DELAY,
			give_up_after: GIVE_UP_AFTER,
		}
	}
}

/// `Status()`/`Health()` outputs (§4.7).
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
	pub phase: SupervisorPhase,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkHealth {
	pub freshness: ployz_health::FreshnessSnapshot,
	pub ping: PingSnapshot,
	pub ntp: NtpStatus,
}

/// One running convergence loop for one network.
pub struct Supervisor {
	network: String,
	phase: PhaseCell<SupervisorPhase>,
	last_error: Mutex<Option<String>>,
	freshness: Arc<FreshnessTracker>,
	ping: Arc<PingTracker>,
	ntp: Arc<NtpChecker>,
	cancel_tx: watch::Sender<bool>,
	done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Supervisor {
	/// Spawn the run loop for `spec` and return a handle to it. The
	/// background task owns `state_store` and `deps` for its lifetime.
	pub fn spawn(
		spec: NetworkSpec,
		state_store: Arc<StateStore>,
		deps: SupervisorDeps,
		ntp_sample: impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<chrono::Duration, Error>> + Send>>
			+ Send
			+ Sync
			+ 'static,
	) -> Arc<Supervisor> {
		Self::spawn_with_backoff(spec, state_store, deps, ntp_sample, BackoffConfig::default())
	}

	pub fn spawn_with_backoff(
		spec: NetworkSpec,
		state_store: Arc<StateStore>,
		deps: SupervisorDeps,
		ntp_sample: impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<chrono::Duration, Error>> + Send>>
			+ Send
			+ Sync
			+ 'static,
		backoff: BackoffConfig,
	) -> Arc<Supervisor> {
		let (cancel_tx, cancel_rx) = watch::channel(false);
		let (done_tx, done_rx) = oneshot::channel();

		let sup = Arc::new(Supervisor {
			network: spec.network.clone(),
			phase: PhaseCell::new(),
			last_error: Mutex::new(None),
			freshness: Arc::new(FreshnessTracker::new()),
			ping: Arc::new(PingTracker::new(ployz_util::id::MachineId::zero(), deps.ping_probe_port)),
			ntp: Arc::new(NtpChecker::new(Arc::new(ntp_sample))),
			cancel_tx,
			done_rx: Mutex::new(Some(done_rx)),
		});

		let run_sup = sup.clone();
		tokio::spawn(async move {
			run_sup.run_loop(spec, state_store, deps, cancel_rx, backoff).await;
			let _ = done_tx.send(());
		});

		sup
	}

	pub fn network(&self) -> &str {
		&self.network
	}

	pub fn status(&self) -> SupervisorStatus {
		SupervisorStatus {
			phase: self.phase.get(),
			last_error: self.last_error.lock().unwrap().clone(),
		}
	}

	pub fn health(&self) -> NetworkHealth {
		NetworkHealth {
			freshness: self.freshness.snapshot(),
			ping: self.ping.snapshot(),
			ntp: self.ntp.status(),
		}
	}

	/// Cancel the run loop and wait up to 30s for it to finish (§4.7
	/// "Stop semantics"). Returns without error on timeout; the loop is
	/// still expected to exit shortly.
	pub async fn stop(&self) {
		let _ = self.cancel_tx.send(true);
		let done = self.done_rx.lock().unwrap().take();
		if let Some(done) = done {
			let _ = tokio::time::timeout(STOP_WAIT_TIMEOUT, done).await;
		}
	}

	fn set_phase(&self, to: SupervisorPhase) {
		self.phase.transition(to);
	}

	fn set_error(&self, err: &Error) {
		*self.last_error.lock().unwrap() = Some(err.to_string());
	}

	async fn run_loop(
		self: Arc<Self>,
		spec: NetworkSpec,
		state_store: Arc<StateStore>,
		deps: SupervisorDeps,
		mut cancel_rx: watch::Receiver<bool>,
		backoff: BackoffConfig,
	) {
		let mut consecutive_failures: u32 = 0;
		let mut retry_delay = backoff.initial_delay;

		'outer: loop {
			if *cancel_rx.borrow() {
				self.set_phase(SupervisorPhase::Stopping);
				self.set_phase(SupervisorPhase::Absent);
				return;
			}

			self.set_phase(SupervisorPhase::Starting);

			let runtime_cfg = match ployz_controller::derive_runtime_config(&spec) {
				Ok(cfg) => cfg,
				Err(e) => {
					self.set_phase(SupervisorPhase::Backoff);
					self.set_error(&e);
					if self.back_off(&mut consecutive_failures, &mut retry_delay, &mut cancel_rx, &backoff).await {
						return;
					}
					continue 'outer;
				}
			};

			if let Err(e) = deps.controller.start(&spec, &state_store, deps.registry.as_ref()).await {
				self.set_phase(SupervisorPhase::Backoff);
				self.set_error(&e);
				if self.back_off(&mut consecutive_failures, &mut retry_delay, &mut cancel_rx, &backoff).await {
					return;
				}
				continue 'outer;
			}

			if let Ok(Some(state)) = state_store.get_state() {
				self.ping.set_self_id(state.wg_public);
			}

			let (mut snapshot, mut changes) = match self.subscribe_with_retry(&spec, deps.registry.as_ref(), &mut cancel_rx).await {
				Some(v) => v,
				None => return,
			};

			self.apply_snapshot(&spec, &runtime_cfg, &state_store, deps.driver.as_ref(), &snapshot);
			if self.phase.get() != SupervisorPhase::Degraded {
				self.set_phase(SupervisorPhase::Running);
			}
			consecutive_failures = 0;
			retry_delay = backoff.initial_delay;

			loop {
				let restart_at = tokio::time::Instant::now() + PERIODIC_RECONCILE_INTERVAL;
				tokio::select! {
					_ = cancel_rx.changed() => {
						if *cancel_rx.borrow() {
							self.set_phase(SupervisorPhase::Stopping);
							self.set_phase(SupervisorPhase::Absent);
							return;
						}
					}
					event = changes.next() => {
						match event {
							Some(ChangeEvent::Added(row)) | Some(ChangeEvent::Updated(row)) => {
								upsert_row(&mut snapshot, row);
								self.reconcile_or_degrade(&spec, &runtime_cfg, &state_store, deps.driver.as_ref(), &snapshot);
							}
							Some(ChangeEvent::Deleted(id)) => {
								snapshot.retain(|r| r.id != id);
								self.ping.update_peers(&snapshot);
								self.reconcile_or_degrade(&spec, &runtime_cfg, &state_store, deps.driver.as_ref(), &snapshot);
							}
							Some(ChangeEvent::Resync) => {
								match deps.registry.list_machines(&spec.network).await {
									Ok(rows) => {
										snapshot = rows;
										self.reconcile_or_degrade(&spec, &runtime_cfg, &state_store, deps.driver.as_ref(), &snapshot);
									}
									Err(e) => self.set_error(&e),
								}
							}
							None => {
								match self.subscribe_with_retry(&spec, deps.registry.as_ref(), &mut cancel_rx).await {
									Some((new_snapshot, new_changes)) => {
										snapshot = new_snapshot;
										changes = new_changes;
										self.reconcile_or_degrade(&spec, &runtime_cfg, &state_store, deps.driver.as_ref(), &snapshot);
									}
									None => return,
								}
							}
						}
					}
					_ = tokio::time::sleep_until(restart_at) => {
						match deps.registry.list_machines(&spec.network).await {
							Ok(rows) => {
								snapshot = rows;
								self.reconcile_or_degrade(&spec, &runtime_cfg, &state_store, deps.driver.as_ref(), &snapshot);
							}
							Err(e) => self.set_error(&e),
						}
					}
				}
			}
		}
	}

	/// `EnsureMachineTable` + `SubscribeMachines`, retried every 1s until
	/// it succeeds or cancellation fires (§4.7 step 4).
	async fn subscribe_with_retry(
		&self,
		spec: &NetworkSpec,
		registry: &dyn RegistryClient,
		cancel_rx: &mut watch::Receiver<bool>,
	) -> Option<(Vec<MachineEntry>, ployz_registry::ChangeStream)> {
		loop {
			if *cancel_rx.borrow() {
				self.set_phase(SupervisorPhase::Stopping);
				self.set_phase(SupervisorPhase::Absent);
				return None;
			}
			match registry.ensure_machine_table(&spec.network).await.and(Ok(())) {
				Ok(()) => match registry.subscribe_machines(&spec.network).await {
					Ok(result) => return Some(result),
					Err(e) => self.set_error(&e),
				},
				Err(e) => self.set_error(&e),
			}
			tokio::select! {
				_ = tokio::time::sleep(SUBSCRIBE_RETRY_DELAY) => {},
				_ = cancel_rx.changed() => {},
			}
		}
	}

	fn apply_snapshot(
		&self,
		spec: &NetworkSpec,
		runtime_cfg: &ployz_controller::RuntimeConfig,
		state_store: &StateStore,
		driver: &dyn WireGuardDriver,
		snapshot: &[MachineEntry],
	) {
		self.reconcile_or_degrade(spec, runtime_cfg, state_store, driver, snapshot);
	}

	/// Reconcile errors set `Degraded` but never exit the inner loop
	/// (§4.7 step 5, §7).
	fn reconcile_or_degrade(
		&self,
		spec: &NetworkSpec,
		runtime_cfg: &ployz_controller::RuntimeConfig,
		state_store: &StateStore,
		driver: &dyn WireGuardDriver,
		snapshot: &[MachineEntry],
	) {
		self.ping.update_peers(snapshot);
		for row in snapshot {
			self.freshness.update(row.clone());
		}

		let local_state = match state_store.get_state() {
			Ok(Some(s)) => s,
			Ok(None) => {
				self.set_error(&Error::NotFound(format!("local state missing for {}", spec.network)));
				self.set_phase(SupervisorPhase::Degraded);
				return;
			}
			Err(e) => {
				self.set_error(&e);
				self.set_phase(SupervisorPhase::Degraded);
				return;
			}
		};

		let peers = ployz_reconcile::reconcile(&local_state, snapshot, &spec.network_cidr);
		match driver.apply_peer_config(&runtime_cfg.wg_interface, &peers) {
			Ok(_) => {
				if self.phase.get() == SupervisorPhase::Degraded {
					self.set_phase(SupervisorPhase::Running);
				}
			}
			Err(e) => {
				self.set_error(&e);
				self.set_phase(SupervisorPhase::Degraded);
			}
		}
	}

	/// Sleep `retry_delay` (interruptible by cancellation), double it
	/// capped at 60s, and give up after 100 consecutive failures (§4.7
	/// step 6). Returns `true` if the caller should return immediately.
	async fn back_off(
		&self,
		consecutive_failures: &mut u32,
		retry_delay: &mut Duration,
		cancel_rx: &mut watch::Receiver<bool>,
		backoff: &BackoffConfig,
	) -> bool {
		*consecutive_failures += 1;
		if *consecutive_failures >= backoff.give_up_after {
			self.set_phase(SupervisorPhase::GivingUp);
			return true;
		}

		tokio::select! {
			_ = tokio::time::sleep(*retry_delay) => {}
			_ = cancel_rx.changed() => {
				if *cancel_rx.borrow() {
					self.set_phase(SupervisorPhase::Stopping);
					self.set_phase(SupervisorPhase::Absent);
					return true;
				}
			}
		}

		*retry_delay = std::cmp::min(*retry_delay * 2, backoff.max_delay);
		false
	}
}

fn upsert_row(snapshot: &mut Vec<MachineEntry>, row: MachineEntry) {
	match snapshot.iter_mut().find(|r| r.id == row.id) {
		Some(existing) => *existing = row,
		None => snapshot.push(row),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ployz_controller::fakes::{FakeContainerRuntime, FakeCorrosionRuntime, FakePlatformOps};
	use ployz_reconcile::FakeDriver;
	use ployz_registry::FakeRegistry;
	use std::net::Ipv6Addr;

	fn sample_spec(data_root: &std::path::Path) -> NetworkSpec {
		NetworkSpec {
			network: "demo".to_string(),
			data_root: data_root.to_path_buf(),
			network_cidr: "10.210.0.0/16".to_string(),
			subnet: "10.210.1.0/24".to_string(),
			management_ip: "fd00::1".parse::<Ipv6Addr>().unwrap(),
			advertise_endpoint: None,
			wg_port: 51820,
			corrosion_member_id: 1,
			corrosion_api_token: "secret".to_string(),
			bootstrap: vec![],
			helper_image: None,
		}
	}

	fn no_op_ntp() -> impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<chrono::Duration, Error>> + Send>> + Send + Sync + 'static {
		|| Box::pin(async { Ok(chrono::Duration::milliseconds(0)) })
	}

	#[tokio::test]
	async fn reaches_running_and_stops_cleanly() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = Arc::new(StateStore::open(&spec.data_root, &spec.network).unwrap());

		let controller = Arc::new(Controller::new(
			Arc::new(FakePlatformOps::new()),
			Arc::new(FakeCorrosionRuntime::new()),
			Arc::new(FakeContainerRuntime::new()),
		));
		let registry: Arc<dyn RegistryClient> = Arc::new(FakeRegistry::new());
		let driver: Arc<dyn WireGuardDriver> = Arc::new(FakeDriver::new());

		let deps = SupervisorDeps {
			controller,
			registry,
			driver,
			ping_probe_port: 9000,
		};

		let sup = Supervisor::spawn(spec, state_store, deps, no_op_ntp());

		for _ in 0..50 {
			if sup.status().phase == SupervisorPhase::Running {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert_eq!(sup.status().phase, SupervisorPhase::Running);

		sup.stop().await;
	}

	#[tokio::test]
	async fn backoff_gives_up_after_repeated_failures() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = Arc::new(StateStore::open(&spec.data_root, &spec.network).unwrap());

		let platform = Arc::new(FakePlatformOps::new());
		platform.set_fail_bring_up(true);
		let controller = Arc::new(Controller::new(
			platform,
			Arc::new(FakeCorrosionRuntime::new()),
			Arc::new(FakeContainerRuntime::new()),
		));
		let registry: Arc<dyn RegistryClient> = Arc::new(FakeRegistry::new());
		let driver: Arc<dyn WireGuardDriver> = Arc::new(FakeDriver::new());

		let deps = SupervisorDeps {
			controller,
			registry,
			driver,
			ping_probe_port: 9000,
		};

		let backoff = BackoffConfig {
			initial_delay: Duration::from_millis(5),
			max_delay: Duration::from_millis(20),
			give_up_after: 5,
		};
		let sup = Supervisor::spawn_with_backoff(spec, state_store, deps, no_op_ntp(), backoff);

		tokio::time::timeout(Duration::from_secs(10), async {
			loop {
				if sup.status().phase == SupervisorPhase::GivingUp {
					break;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("supervisor should reach GivingUp");

		assert!(sup.status().last_error.is_some());
	}
}
