//! Top-level facade (§4.8, C8).
//!
//! `Manager` is the single long-lived object each `ployzd` process
//! owns, playing the role `garage_model::garage::Garage` plays for the
//! teacher crate: one struct built once at startup, holding every
//! subsystem, and handed to the RPC server. Unlike `Garage`'s table
//! fleet (one `Table` per data kind, replicated cluster-wide), this
//! daemon normally manages a single network, so the analogous
//! "per-entity handle" collapses to "at most one supervisor per
//! enabled network" in a map.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ployz_controller::{ContainerRuntime, Controller, CorrosionRuntime, PlatformOps};
use ployz_health::{NtpPhase, NtpStatus};
use ployz_phases::SupervisorPhase;
use ployz_reconcile::WireGuardDriver;
use ployz_registry::RegistryClient;
use ployz_store::{SpecStore, StateStore};
use ployz_supervisor::{Supervisor, SupervisorDeps};
use ployz_util::error::{Error, PreconditionCode, PreconditionFailure};
use ployz_util::id::MachineId;
use ployz_util::model::{MachineEntry, NetworkSpec};

/// Samples a reference clock offset for the `NtpChecker` each spawned
/// supervisor carries. Stored as an `Arc` (rather than taken once by
/// value) because a new supervisor is spawned on every apply/restart.
pub type NtpSampleFn = Arc<
	dyn Fn() -> Pin<Box<dyn Future<Output = Result<chrono::Duration, Error>> + Send>> + Send + Sync,
>;

/// Builds the registry client for one network, bound to that network's
/// own derived `registry_api` endpoint and its own `corrosion_api_token`
/// (§4.7 step 3: "a registry client bound to `runtime_cfg.registry_api`").
/// Each enabled network gets its own Corrosion instance on its own
/// derived port, so one process-wide registry instance would talk to the
/// wrong endpoint for every network but the first.
pub type RegistryFactory = Arc<dyn Fn(&ployz_controller::RuntimeConfig, &str) -> Arc<dyn RegistryClient> + Send + Sync>;

const APPLY_SETTLE_ATTEMPTS: u32 = 50;
const APPLY_SETTLE_INTERVAL: Duration = Duration::from_millis(20);

/// One leaf of the `RuntimeTree` surfaced by `GetStatus` (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeNode {
	pub phase: String,
	pub required: bool,
	pub healthy: bool,
	pub error: Option<PreconditionCode>,
	pub hint: Option<String>,
}

impl RuntimeNode {
	fn ok(phase: impl Into<String>) -> Self {
		Self {
			phase: phase.into(),
			required: true,
			healthy: true,
			error: None,
			hint: None,
		}
	}

	fn unhealthy(phase: impl Into<String>, error: PreconditionCode, hint: impl Into<String>) -> Self {
		Self {
			phase: phase.into(),
			required: true,
			healthy: false,
			error: Some(error),
			hint: Some(hint.into()),
		}
	}

	fn from_probe(ok: Option<bool>, hint: &str) -> Self {
		match ok {
			Some(true) => RuntimeNode::ok("ready"),
			Some(false) => RuntimeNode::unhealthy("not_ready", PreconditionCode::RuntimeNotReadyForServices, hint),
			None => RuntimeNode::unhealthy("absent", PreconditionCode::NetworkNotConfigured, "call ApplyNetworkSpec first"),
		}
	}
}

/// `GetStatus`'s structured report (§4.8), the contract CLI display and
/// the readiness predicates below are both built from.
#[derive(Debug, Clone)]
pub struct RuntimeTree {
	pub config: RuntimeNode,
	pub network: RuntimeNode,
	pub wireguard: RuntimeNode,
	pub corrosion: RuntimeNode,
	pub docker: RuntimeNode,
	pub supervisor: RuntimeNode,
	pub clock: RuntimeNode,
}

impl RuntimeTree {
	/// The substrates a proxied RPC needs to have any chance of
	/// succeeding.
	pub fn service_ready(&self) -> bool {
		self.wireguard.healthy && self.corrosion.healthy
	}

	/// Everything `service_ready` needs, plus the supervisor loop and
	/// the container bridge network.
	pub fn control_plane_ready(&self) -> bool {
		self.service_ready() && self.supervisor.healthy && self.docker.healthy
	}
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
	pub network: String,
	pub supervisor_running: bool,
}

#[derive(Debug, Clone)]
pub struct NetworkStatus {
	pub network: String,
	pub configured: bool,
	pub supervisor_phase: SupervisorPhase,
	pub runtime_tree: RuntimeTree,
	pub clock_health: NtpStatus,
}

#[derive(Debug, Clone)]
pub struct Identity {
	pub machine_id: MachineId,
	pub management_ip: std::net::Ipv6Addr,
	pub subnet: String,
	pub advertise_endpoint: Option<std::net::SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct PeerHealth {
	pub node_id: MachineId,
	pub ntp_phase: NtpPhase,
	pub peer_lag: Vec<(MachineId, Option<chrono::Duration>)>,
}

/// The per-process facade (§4.8): spec store, state stores, one shared
/// `Controller`, the supervisor map, and the collaborators every
/// spawned supervisor needs (registry client, WireGuard driver, NTP
/// sampler). Normally holds at most one supervisor.
pub struct Manager {
	data_root: PathBuf,
	spec_store: SpecStore,
	state_stores: Mutex<HashMap<String, Arc<StateStore>>>,
	controller: Arc<Controller>,
	registry_factory: RegistryFactory,
	registries: Mutex<HashMap<String, Arc<dyn RegistryClient>>>,
	driver: Arc<dyn WireGuardDriver>,
	ping_probe_port: u16,
	ntp_sample: NtpSampleFn,
	supervisors: Mutex<HashMap<String, Arc<Supervisor>>>,
}

impl Manager {
	/// Open the spec store under `data_root` and, per §4.8 "Startup
	/// restoration", spawn a supervisor for every persisted network
	/// that is enabled — without synchronously re-running
	/// `Controller::start`; the supervisor's own run loop step 2 does
	/// that on its first iteration.
	pub fn new(
		data_root: PathBuf,
		platform: Arc<dyn PlatformOps>,
		corrosion: Arc<dyn CorrosionRuntime>,
		containers: Arc<dyn ContainerRuntime>,
		registry_factory: RegistryFactory,
		driver: Arc<dyn WireGuardDriver>,
		ping_probe_port: u16,
		ntp_sample: NtpSampleFn,
	) -> Result<Arc<Self>, Error> {
		std::fs::create_dir_all(&data_root)?;
		let spec_store = SpecStore::open(&data_root)?;
		spec_store.ensure_schema()?;

		let manager = Arc::new(Self {
			data_root,
			spec_store,
			state_stores: Mutex::new(HashMap::new()),
			controller: Arc::new(Controller::new(platform, corrosion, containers)),
			registry_factory,
			registries: Mutex::new(HashMap::new()),
			driver,
			ping_probe_port,
			ntp_sample,
			supervisors: Mutex::new(HashMap::new()),
		});

		manager.restore_at_startup()?;
		Ok(manager)
	}

	/// Names of every persisted, enabled network (§4.9 "one identity
	/// watcher per managed network"), in the shape `restore_at_startup`
	/// already walks.
	pub fn enabled_networks(&self) -> Result<Vec<String>, Error> {
		let mut names = Vec::new();
		for network in self.spec_store.list_networks()? {
			if let Some(persisted) = self.spec_store.get_spec(&network)? {
				if persisted.enabled {
					names.push(network);
				}
			}
		}
		Ok(names)
	}

	fn restore_at_startup(self: &Arc<Self>) -> Result<(), Error> {
		for network in self.spec_store.list_networks()? {
			if let Some(persisted) = self.spec_store.get_spec(&network)? {
				if persisted.enabled {
					tracing::info!("Restoring supervisor for network {}", network);
					self.spawn_supervisor(persisted.spec)?;
				}
			}
		}
		Ok(())
	}

	fn state_store(&self, network: &str) -> Result<Arc<StateStore>, Error> {
		let mut stores = self.state_stores.lock().unwrap();
		if let Some(existing) = stores.get(network) {
			return Ok(existing.clone());
		}
		let store = Arc::new(StateStore::open(&self.data_root, network)?);
		stores.insert(network.to_string(), store.clone());
		Ok(store)
	}

	/// Returns this network's registry client, building it from
	/// `registry_factory` bound to its own derived `registry_api` and its
	/// own `corrosion_api_token` the first time it's needed, then caching
	/// it for the life of the process (§4.7 step 3).
	fn registry_for(&self, spec: &NetworkSpec) -> Result<Arc<dyn RegistryClient>, Error> {
		let mut registries = self.registries.lock().unwrap();
		if let Some(existing) = registries.get(&spec.network) {
			return Ok(existing.clone());
		}
		let runtime_cfg = ployz_controller::derive_runtime_config(spec)?;
		let registry = (self.registry_factory)(&runtime_cfg, &spec.corrosion_api_token);
		registries.insert(spec.network.clone(), registry.clone());
		Ok(registry)
	}

	/// As `registry_for`, but looks the spec up by network name for
	/// callers that only have that (every RPC except `ApplyNetworkSpec`).
	fn registry_for_network(&self, network: &str) -> Result<Arc<dyn RegistryClient>, Error> {
		let persisted = self
			.spec_store
			.get_spec(network)?
			.ok_or_else(|| Error::NotFound(format!("network {} is not configured", network)))?;
		self.registry_for(&persisted.spec)
	}

	fn spawn_supervisor(self: &Arc<Self>, spec: NetworkSpec) -> Result<Arc<Supervisor>, Error> {
		let state_store = self.state_store(&spec.network)?;
		let registry = self.registry_for(&spec)?;
		let deps = SupervisorDeps {
			controller: self.controller.clone(),
			registry,
			driver: self.driver.clone(),
			ping_probe_port: self.ping_probe_port,
		};
		let sample = self.ntp_sample.clone();
		let sup = Supervisor::spawn(spec.clone(), state_store, deps, move || sample());
		self.supervisors.lock().unwrap().insert(spec.network.clone(), sup.clone());
		Ok(sup)
	}

	/// Best-effort: stop and forget the supervisor for `network`, if
	/// one is running. Waits up to `Supervisor::stop`'s own 30s bound.
	async fn stop_supervisor(&self, network: &str) {
		let existing = self.supervisors.lock().unwrap().remove(network);
		if let Some(sup) = existing {
			sup.stop().await;
		}
	}

	fn supervisor(&self, network: &str) -> Option<Arc<Supervisor>> {
		self.supervisors.lock().unwrap().get(network).cloned()
	}

	/// §4.8 `ApplyNetworkSpec`: normalize and validate, stop any
	/// existing supervisor for this network, best-effort tear down the
	/// previous runtime if a spec was already persisted, bring up the
	/// new runtime, persist as enabled, and start a fresh supervisor.
	pub async fn apply_network_spec(self: &Arc<Self>, mut spec: NetworkSpec) -> Result<ApplyResult, Error> {
		spec.normalize();
		spec.data_root = self.data_root.clone();
		spec.validate()?;

		self.stop_supervisor(&spec.network).await;

		if let Some(previous) = self.spec_store.get_spec(&spec.network)? {
			let state_store = self.state_store(&spec.network)?;
			if let Err(e) = self.controller.stop(&previous.spec, &state_store, false).await {
				tracing::warn!("best-effort stop of previous runtime for {} failed: {}", spec.network, e);
			}
		}

		// A re-apply may move the network's management IP and thus its
		// derived `registry_api`; drop any cached registry bound to the
		// old endpoint so it's rebuilt against the new one.
		self.registries.lock().unwrap().remove(&spec.network);

		let state_store = self.state_store(&spec.network)?;
		let registry = self.registry_for(&spec)?;
		self.controller.start(&spec, &state_store, registry.as_ref()).await?;

		self.spec_store.save_spec(&spec.network, &spec, true)?;

		let sup = self.spawn_supervisor(spec.clone())?;
		for _ in 0..APPLY_SETTLE_ATTEMPTS {
			if sup.status().phase.counts_as_running() {
				break;
			}
			tokio::time::sleep(APPLY_SETTLE_INTERVAL).await;
		}

		Ok(ApplyResult {
			network: spec.network,
			supervisor_running: sup.status().phase.counts_as_running(),
		})
	}

	/// §4.8 `DisableNetwork`: preflight for obstructing workloads or
	/// attached remote machines, then stop the supervisor and the
	/// runtime, either purging or persisting as disabled.
	pub async fn disable_network(self: &Arc<Self>, network: &str, purge: bool) -> Result<(), Error> {
		let persisted = self
			.spec_store
			.get_spec(network)?
			.ok_or_else(|| Error::NotFound(format!("network {} is not configured", network)))?;

		if self.has_managed_workloads(network) {
			return Err(Error::Precondition(PreconditionFailure::new(
				PreconditionCode::NetworkDestroyHasWorkloads,
				network,
				"workloads are still scheduled on this network",
			)));
		}
		let remote_machines = self.remote_machine_count(network).await?;
		if remote_machines > 0 {
			return Err(Error::Precondition(
				PreconditionFailure::new(
					PreconditionCode::NetworkDestroyHasMachines,
					network,
					format!("{} other machine(s) are still attached", remote_machines),
				)
				.with_hint("call RemoveMachine for each peer before disabling"),
			));
		}

		self.stop_supervisor(network).await;
		let state_store = self.state_store(network)?;
		self.controller.stop(&persisted.spec, &state_store, purge).await?;

		if purge {
			self.spec_store.delete_spec(network)?;
			self.state_stores.lock().unwrap().remove(network);
		} else {
			self.spec_store.save_spec(network, &persisted.spec, false)?;
		}
		Ok(())
	}

	/// Workload/deploy orchestration is out of core (§1 Non-goals,
	/// stubbed in current sources): no workload ever obstructs a
	/// disable in this implementation.
	fn has_managed_workloads(&self, _network: &str) -> bool {
		false
	}

	async fn remote_machine_count(&self, network: &str) -> Result<usize, Error> {
		let self_id = self.state_store(network)?.get_state()?.map(|s| s.wg_public);
		let rows = self.registry_for_network(network)?.list_machines(network).await?;
		Ok(rows.into_iter().filter(|r| Some(r.id) != self_id).count())
	}

	/// §4.8 `GetStatus`: merges `Controller::status`, the supervisor's
	/// phase, and NTP health into the `RuntimeTree` the CLI renders and
	/// the readiness predicates consume.
	pub async fn get_status(&self, network: &str) -> Result<NetworkStatus, Error> {
		let persisted = self.spec_store.get_spec(network)?;
		let configured = persisted.is_some();

		let config_node = if configured {
			RuntimeNode::ok("configured")
		} else {
			RuntimeNode::unhealthy("absent", PreconditionCode::NetworkNotConfigured, "call ApplyNetworkSpec first")
		};

		let controller_status = match &persisted {
			Some(p) => {
				let state_store = self.state_store(network)?;
				Some(self.controller.status(&p.spec, &state_store).await?)
			}
			None => None,
		};

		let supervisor = self.supervisor(network);
		let supervisor_phase = supervisor.as_ref().map(|s| s.status().phase).unwrap_or(SupervisorPhase::Absent);
		let clock_health = supervisor
			.as_ref()
			.map(|s| s.health().ntp)
			.unwrap_or(NtpStatus { phase: NtpPhase::Unchecked, offset: None, error: None });

		let network_node = match &controller_status {
			Some(s) if s.running => RuntimeNode::ok(s.network_phase.to_string()),
			Some(s) => RuntimeNode::unhealthy(s.network_phase.to_string(), PreconditionCode::RuntimeNotReadyForServices, "runtime is not fully up"),
			None => RuntimeNode::unhealthy("absent", PreconditionCode::NetworkNotConfigured, "call ApplyNetworkSpec first"),
		};
		let wireguard_node = RuntimeNode::from_probe(controller_status.as_ref().map(|s| s.wireguard_ok), "wireguard interface is down");
		let corrosion_node = RuntimeNode::from_probe(controller_status.as_ref().map(|s| s.registry_ok), "membership store is not ready");
		let docker_node = RuntimeNode::from_probe(controller_status.as_ref().map(|s| s.docker_net_ok), "container bridge network is missing");
		let supervisor_node = if supervisor_phase.counts_as_running() {
			RuntimeNode::ok(format!("{:?}", supervisor_phase).to_lowercase())
		} else {
			RuntimeNode::unhealthy(format!("{:?}", supervisor_phase).to_lowercase(), PreconditionCode::RuntimeNotReadyForServices, "supervisor is not running")
		};
		let clock_node = if matches!(clock_health.phase, NtpPhase::UnhealthyOffset | NtpPhase::Error) {
			RuntimeNode::unhealthy(format!("{:?}", clock_health.phase).to_lowercase(), PreconditionCode::RuntimeNotReadyForServices, "clock offset exceeds the healthy threshold")
		} else {
			let mut node = RuntimeNode::ok(format!("{:?}", clock_health.phase).to_lowercase());
			node.required = false;
			node
		};

		Ok(NetworkStatus {
			network: network.to_string(),
			configured,
			supervisor_phase,
			runtime_tree: RuntimeTree {
				config: config_node,
				network: network_node,
				wireguard: wireguard_node,
				corrosion: corrosion_node,
				docker: docker_node,
				supervisor: supervisor_node,
				clock: clock_node,
			},
			clock_health,
		})
	}

	/// §4.8 `GetIdentity`.
	pub fn get_identity(&self, network: &str) -> Result<Identity, Error> {
		let state = self
			.state_store(network)?
			.get_state()?
			.ok_or_else(|| Error::NotFound(format!("no local state for network {}", network)))?;
		Ok(Identity {
			machine_id: state.wg_public,
			management_ip: state.management,
			subnet: state.subnet,
			advertise_endpoint: state.advertise,
		})
	}

	pub async fn list_machines(&self, network: &str) -> Result<Vec<MachineEntry>, Error> {
		self.registry_for_network(network)?.list_machines(network).await
	}

	/// Surfaces the registry's conflict kind unchanged (§4.8).
	pub async fn upsert_machine(&self, network: &str, row: MachineEntry, expected_version: i64) -> Result<(), Error> {
		self.registry_for_network(network)?.upsert_machine(network, &row, expected_version).await
	}

	pub async fn remove_machine(&self, network: &str, id: MachineId) -> Result<(), Error> {
		self.registry_for_network(network)?.remove_machine(network, id).await
	}

	/// §6 `GetPeerHealth`: this node's id, NTP phase and a replication-lag
	/// list per known peer, sourced from the running supervisor's health
	/// snapshot (absent if no supervisor is running for `network`).
	pub async fn peer_health(&self, network: &str) -> Result<PeerHealth, Error> {
		let identity = self.get_identity(network)?;
		let (ntp_phase, peer_lag) = match self.supervisor(network) {
			Some(sup) => {
				let health = sup.health();
				let lag = health
					.freshness
					.iter()
					.map(|(id, entry)| (*id, Some(entry.replication_lag)))
					.collect();
				(health.ntp.phase, lag)
			}
			None => (NtpPhase::Unchecked, Vec::new()),
		};
		Ok(PeerHealth {
			node_id: identity.machine_id,
			ntp_phase,
			peer_lag,
		})
	}

	/// §4.8 `TriggerReconcile`: always stop-reconcile-restart, per the
	/// Open Question resolved in §9/DESIGN.md — the strictly safer
	/// contract, since it forces a fresh subscription.
	pub async fn trigger_reconcile(self: &Arc<Self>, network: &str) -> Result<(), Error> {
		let persisted = self
			.spec_store
			.get_spec(network)?
			.ok_or_else(|| Error::NotFound(format!("network {} is not configured", network)))?;

		self.stop_supervisor(network).await;

		let state_store = self.state_store(network)?;
		let local_state = state_store
			.get_state()?
			.ok_or_else(|| Error::NotFound(format!("no local state for network {}", network)))?;
		let snapshot = self.registry_for(&persisted.spec)?.list_machines(network).await?;
		let peers = ployz_reconcile::reconcile(&local_state, &snapshot, &persisted.spec.network_cidr);
		self.driver.apply_peer_config(&local_state.wg_interface, &peers)?;

		self.spawn_supervisor(persisted.spec)?;
		Ok(())
	}

	/// §4.8 shutdown: stop every supervisor and close the stores, all
	/// best-effort.
	pub async fn shutdown(&self) {
		let networks: Vec<String> = self.supervisors.lock().unwrap().keys().cloned().collect();
		for network in networks {
			self.stop_supervisor(&network).await;
		}
		if let Err(e) = self.spec_store.close() {
			tracing::warn!("error closing spec store: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ployz_controller::fakes::{FakeContainerRuntime, FakeCorrosionRuntime, FakePlatformOps};
	use ployz_reconcile::FakeDriver;
	use ployz_registry::FakeRegistry;
	use std::net::Ipv6Addr;

	fn no_op_ntp() -> NtpSampleFn {
		Arc::new(|| Box::pin(async { Ok(chrono::Duration::milliseconds(0)) }))
	}

	fn sample_spec(data_root: &std::path::Path, subnet: &str) -> NetworkSpec {
		NetworkSpec {
			network: "demo".to_string(),
			data_root: data_root.to_path_buf(),
			network_cidr: "10.210.0.0/16".to_string(),
			subnet: subnet.to_string(),
			management_ip: "fd00::1".parse::<Ipv6Addr>().unwrap(),
			advertise_endpoint: None,
			wg_port: 51820,
			corrosion_member_id: 1,
			corrosion_api_token: "secret".to_string(),
			bootstrap: vec![],
			helper_image: None,
		}
	}

	fn manager(dir: &std::path::Path) -> Arc<Manager> {
		let registry: Arc<dyn RegistryClient> = Arc::new(FakeRegistry::new());
		let registry_factory: RegistryFactory = Arc::new(move |_runtime_cfg, _token| registry.clone());
		Manager::new(
			dir.to_path_buf(),
			Arc::new(FakePlatformOps::new()),
			Arc::new(FakeCorrosionRuntime::new()),
			Arc::new(FakeContainerRuntime::new()),
			registry_factory,
			Arc::new(FakeDriver::new()),
			9000,
			no_op_ntp(),
		)
		.unwrap()
	}

	#[tokio::test]
	async fn apply_then_status_reports_configured() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = manager(&dir);

		let result = mgr.apply_network_spec(sample_spec(&dir, "10.210.1.0/24")).await.unwrap();
		assert_eq!(result.network, "demo");
		assert!(result.supervisor_running);

		let status = mgr.get_status("demo").await.unwrap();
		assert!(status.configured);
		assert!(status.runtime_tree.config.healthy);
	}

	#[tokio::test]
	async fn status_before_apply_is_unconfigured() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = manager(&dir);

		let status = mgr.get_status("demo").await.unwrap();
		assert!(!status.configured);
		assert!(!status.runtime_tree.config.healthy);
		assert_eq!(status.supervisor_phase, SupervisorPhase::Absent);
	}

	#[tokio::test]
	async fn disable_rejects_while_peers_are_attached() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = manager(&dir);
		mgr.apply_network_spec(sample_spec(&dir, "10.210.1.0/24")).await.unwrap();

		let identity = mgr.get_identity("demo").unwrap();
		let peer = MachineEntry {
			id: MachineId([9u8; 32]),
			public_key: MachineId([9u8; 32]),
			subnet: "10.210.2.0/24".to_string(),
			management_ip: "fd00::2".parse().unwrap(),
			endpoint: None,
			last_updated: ployz_util::time::now(),
			version: 0,
		};
		mgr.upsert_machine("demo", peer, 0).await.unwrap();
		let _ = identity;

		let err = mgr.disable_network("demo", false).await.unwrap_err();
		assert_eq!(err.precondition().unwrap().code, PreconditionCode::NetworkDestroyHasMachines);
	}

	#[tokio::test]
	async fn disable_succeeds_once_peers_are_removed() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = manager(&dir);
		mgr.apply_network_spec(sample_spec(&dir, "10.210.1.0/24")).await.unwrap();

		let peer_id = MachineId([9u8; 32]);
		mgr.upsert_machine(
			"demo",
			MachineEntry {
				id: peer_id,
				public_key: peer_id,
				subnet: "10.210.2.0/24".to_string(),
				management_ip: "fd00::2".parse().unwrap(),
				endpoint: None,
				last_updated: ployz_util::time::now(),
				version: 0,
			},
			0,
		)
		.await
		.unwrap();

		mgr.remove_machine("demo", peer_id).await.unwrap();
		mgr.disable_network("demo", true).await.unwrap();

		let status = mgr.get_status("demo").await.unwrap();
		assert!(!status.configured);
	}

	#[tokio::test]
	async fn list_upsert_remove_machine_round_trip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = manager(&dir);
		mgr.apply_network_spec(sample_spec(&dir, "10.210.1.0/24")).await.unwrap();

		let id = MachineId([4u8; 32]);
		mgr.upsert_machine(
			"demo",
			MachineEntry {
				id,
				public_key: id,
				subnet: "10.210.4.0/24".to_string(),
				management_ip: "fd00::4".parse().unwrap(),
				endpoint: None,
				last_updated: ployz_util::time::now(),
				version: 0,
			},
			0,
		)
		.await
		.unwrap();

		let rows = mgr.list_machines("demo").await.unwrap();
		assert!(rows.iter().any(|r| r.id == id));

		mgr.remove_machine("demo", id).await.unwrap();
		let rows = mgr.list_machines("demo").await.unwrap();
		assert!(!rows.iter().any(|r| r.id == id));
	}

	#[tokio::test]
	async fn trigger_reconcile_reapplies_peer_config() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = manager(&dir);
		mgr.apply_network_spec(sample_spec(&dir, "10.210.1.0/24")).await.unwrap();

		mgr.trigger_reconcile("demo").await.unwrap();

		let status = mgr.get_status("demo").await.unwrap();
		assert!(status.configured);
	}

	#[tokio::test]
	async fn restore_at_startup_spawns_supervisor_for_enabled_network() {
		let dir = mktemp::Temp::new_dir().unwrap();
		{
			let mgr = manager(&dir);
			mgr.apply_network_spec(sample_spec(&dir, "10.210.1.0/24")).await.unwrap();
			mgr.shutdown().await;
		}

		let restarted = manager(&dir);
		let status = restarted.get_status("demo").await.unwrap();
		assert!(status.configured);
	}
}
