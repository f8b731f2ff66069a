//! Per-network runtime bring-up and tear-down (§4.6, C6).
//!
//! `Controller::start`/`stop`/`status` bring up, reverse and report on
//! the local runtime in the fixed order the contract requires, the same
//! way `garage_model::garage::Garage::new` opens metadata/data
//! directories then the database then the membership system in a single
//! straight-line sequence with `info!` logging at each step. The three
//! external collaborators — the platform WireGuard driver, the
//! membership-store runtime and the container runtime — are capability
//! traits with both a production shape and an in-memory fake, per §9.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ployz_registry::RegistryClient;
use ployz_store::StateStore;
use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::{LocalState, MachineEntry, NetworkPhase, NetworkSpec};

pub mod platform;

/// Derived, ephemeral configuration a `Controller::start` hands back to
/// its caller (the supervisor) for the lifetime of the runtime (§4.6,
/// §4.7 step 1).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	pub network: String,
	pub wg_interface: String,
	pub wg_port: u16,
	pub registry_api: String,
	pub docker_network: String,
}

/// Derive `RuntimeConfig` from a validated `NetworkSpec` (§4.7 step 1).
pub fn derive_runtime_config(spec: &NetworkSpec) -> Result<RuntimeConfig, Error> {
	spec.validate()?;
	Ok(RuntimeConfig {
		network: spec.network.clone(),
		wg_interface: format!("wg-{}", spec.network),
		wg_port: spec.effective_wg_port(),
		registry_api: format!("http://[{}]:{}", spec.management_ip, ployz_util::model::daemon_port_for_name(&spec.network, 8000, 9000)),
		docker_network: format!("ployz-{}", spec.network),
	})
}

/// `Status(ctx, cfg)`'s result (§4.6).
#[derive(Debug, Clone)]
pub struct ControllerStatus {
	pub configured: bool,
	pub running: bool,
	pub wireguard_ok: bool,
	pub registry_ok: bool,
	pub docker_net_ok: bool,
	pub state_path: PathBuf,
	pub network_phase: NetworkPhase,
}

/// Brings a local WireGuard interface up or down with self-addresses.
/// Distinct from `ployz_reconcile::WireGuardDriver`, which only applies
/// peer configuration to an interface this trait already created.
pub trait PlatformOps: Send + Sync {
	fn bring_up_interface(
		&self,
		interface: &str,
		private_key: &str,
		address: std::net::IpAddr,
		prefix: u8,
		port: u16,
	) -> Result<(), Error>;

	fn take_down_interface(&self, interface: &str) -> Result<(), Error>;

	fn interface_exists(&self, interface: &str) -> Result<bool, Error>;
}

/// Starts, stops and health-probes the membership-store (Corrosion)
/// runtime for one network.
#[async_trait::async_trait]
pub trait CorrosionRuntime: Send + Sync {
	async fn start(&self, data_dir: &std::path::Path, member_id: u64, api_token: &str) -> Result<(), Error>;
	async fn stop(&self) -> Result<(), Error>;
	/// `true` once the runtime's health endpoint reports thresholds met.
	async fn health_ready(&self) -> Result<bool, Error>;
}

/// Ensures the container bridge network backing a network's workloads
/// exists with the correct subnet.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
	async fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), Error>;
	async fn remove_network(&self, name: &str) -> Result<(), Error>;
	async fn network_exists(&self, name: &str) -> Result<bool, Error>;
}

/// Upper bound on polling `CorrosionRuntime::health_ready` during
/// `Controller::start` (§4.6 "wait until its health endpoint returns
/// thresholds-met"). Not specified numerically; chosen generously since
/// a slow Corrosion bootstrap should not make `ApplyNetworkSpec` flaky
/// (open question, recorded in DESIGN.md).
const HEALTH_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Controller {
	platform: Arc<dyn PlatformOps>,
	corrosion: Arc<dyn CorrosionRuntime>,
	containers: Arc<dyn ContainerRuntime>,
}

impl Controller {
	pub fn new(
		platform: Arc<dyn PlatformOps>,
		corrosion: Arc<dyn CorrosionRuntime>,
		containers: Arc<dyn ContainerRuntime>,
	) -> Self {
		Self { platform, corrosion, containers }
	}

	/// Bring up the local runtime in order (§4.6): data directories,
	/// keypair, WireGuard interface, membership-store runtime, container
	/// network, self `MachineEntry`.
	pub async fn start(
		&self,
		spec: &NetworkSpec,
		state_store: &StateStore,
		registry: &dyn RegistryClient,
	) -> Result<RuntimeConfig, Error> {
		let runtime_cfg = derive_runtime_config(spec)?;

		tracing::info!("Starting runtime for network {}", spec.network);

		let mut state = match state_store.get_state()? {
			Some(existing) => existing,
			None => {
				tracing::info!("No local state found for {}, generating keypair", spec.network);
				generate_local_state(spec, &runtime_cfg)?
			}
		};
		state.phase = NetworkPhase::Configuring;
		state_store.save_state(&state)?;

		self.platform.bring_up_interface(
			&runtime_cfg.wg_interface,
			&state.wg_private,
			std::net::IpAddr::V6(state.management),
			128,
			runtime_cfg.wg_port,
		)?;

		self.corrosion
			.start(&spec.data_root.join(&spec.network).join("corrosion"), spec.corrosion_member_id, &spec.corrosion_api_token)
			.await?;
		wait_for_corrosion_ready(self.corrosion.as_ref()).await?;

		self.containers.ensure_network(&runtime_cfg.docker_network, &spec.subnet).await?;

		registry.ensure_machine_table(&spec.network).await?;
		let expected_version = registry
			.list_machines(&spec.network)
			.await?
			.into_iter()
			.find(|row| row.id == state.wg_public)
			.map(|row| row.version)
			.unwrap_or(0);
		registry
			.upsert_machine(&spec.network, &self_entry(&state), expected_version)
			.await?;

		state.phase = NetworkPhase::Running;
		state_store.save_state(&state)?;

		tracing::info!("Runtime for network {} started", spec.network);
		Ok(runtime_cfg)
	}

	/// Reverse order of `start` (§4.6). If `purge`, also delete
	/// `LocalState` and the container network; otherwise persisted
	/// artifacts are left so a later re-apply is fast.
	pub async fn stop(&self, spec: &NetworkSpec, state_store: &StateStore, purge: bool) -> Result<(), Error> {
		tracing::info!("Stopping runtime for network {} (purge={})", spec.network, purge);

		let runtime_cfg = derive_runtime_config(spec)?;

		if purge {
			self.containers.remove_network(&runtime_cfg.docker_network).await?;
		}
		self.corrosion.stop().await?;
		self.platform.take_down_interface(&runtime_cfg.wg_interface)?;

		if purge {
			state_store.delete_state()?;
		} else if let Some(mut state) = state_store.get_state()? {
			state.phase = NetworkPhase::Stopped;
			state_store.save_state(&state)?;
		}

		Ok(())
	}

	pub async fn status(&self, spec: &NetworkSpec, state_store: &StateStore) -> Result<ControllerStatus, Error> {
		let runtime_cfg = derive_runtime_config(spec)?;
		let state = state_store.get_state()?;

		let wireguard_ok = self.platform.interface_exists(&runtime_cfg.wg_interface)?;
		let registry_ok = self.corrosion.health_ready().await.unwrap_or(false);
		let docker_net_ok = self.containers.network_exists(&runtime_cfg.docker_network).await.unwrap_or(false);

		Ok(ControllerStatus {
			configured: state.is_some(),
			running: wireguard_ok && registry_ok && docker_net_ok,
			wireguard_ok,
			registry_ok,
			docker_net_ok,
			state_path: spec.data_root.join(&spec.network).join("state.json"),
			network_phase: state.map(|s| s.phase).unwrap_or(NetworkPhase::Stopped),
		})
	}
}

async fn wait_for_corrosion_ready(corrosion: &dyn CorrosionRuntime) -> Result<(), Error> {
	let deadline = tokio::time::Instant::now() + HEALTH_WAIT_TIMEOUT;
	loop {
		if corrosion.health_ready().await? {
			return Ok(());
		}
		if tokio::time::Instant::now() >= deadline {
			return Err(Error::Unavailable("membership store did not become healthy in time".into()));
		}
		tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
	}
}

fn generate_local_state(spec: &NetworkSpec, runtime_cfg: &RuntimeConfig) -> Result<LocalState, Error> {
	let keypair = wireguard_control::KeyPair::generate();
	let wg_public = MachineId::from_slice(keypair.public.as_bytes())
		.ok_or_else(|| Error::Internal("generated public key was not 32 bytes".into()))?;

	Ok(LocalState {
		wg_public,
		wg_private: keypair.private.to_base64(),
		subnet: spec.subnet.clone(),
		management: spec.management_ip,
		advertise: spec.advertise_endpoint,
		cidr: spec.network_cidr.clone(),
		wg_interface: runtime_cfg.wg_interface.clone(),
		wg_port: runtime_cfg.wg_port,
		corrosion_member_id: spec.corrosion_member_id,
		corrosion_api_token: spec.corrosion_api_token.clone(),
		phase: NetworkPhase::Configuring,
	})
}

fn self_entry(state: &LocalState) -> MachineEntry {
	MachineEntry {
		id: state.wg_public,
		public_key: state.wg_public,
		subnet: state.subnet.clone(),
		management_ip: state.management,
		endpoint: state.advertise,
		last_updated: ployz_util::time::now(),
		version: 0,
	}
}

/// In-memory fakes for the three collaborator traits, used by
/// `ployz_supervisor` and `ployz_manager` tests (§9).
pub mod fakes {
	use super::*;
	use std::collections::HashSet;
	use std::sync::Mutex;

	#[derive(Default)]
	pub struct FakePlatformOps {
		pub interfaces: Mutex<HashSet<String>>,
		pub fail_bring_up: Mutex<bool>,
	}

	impl FakePlatformOps {
		pub fn new() -> Self {
			Self::default()
		}

		pub fn set_fail_bring_up(&self, fail: bool) {
			*self.fail_bring_up.lock().unwrap() = fail;
		}
	}

	impl PlatformOps for FakePlatformOps {
		fn bring_up_interface(
			&self,
			interface: &str,
			_private_key: &str,
			_address: std::net::IpAddr,
			_prefix: u8,
			_port: u16,
		) -> Result<(), Error> {
			if *self.fail_bring_up.lock().unwrap() {
				return Err(Error::Unavailable("fake platform forced failure".into()));
			}
			self.interfaces.lock().unwrap().insert(interface.to_string());
			Ok(())
		}

		fn take_down_interface(&self, interface: &str) -> Result<(), Error> {
			self.interfaces.lock().unwrap().remove(interface);
			Ok(())
		}

		fn interface_exists(&self, interface: &str) -> Result<bool, Error> {
			Ok(self.interfaces.lock().unwrap().contains(interface))
		}
	}

	#[derive(Default)]
	pub struct FakeCorrosionRuntime {
		pub running: Mutex<bool>,
	}

	impl FakeCorrosionRuntime {
		pub fn new() -> Self {
			Self::default()
		}
	}

	#[async_trait::async_trait]
	impl CorrosionRuntime for FakeCorrosionRuntime {
		async fn start(&self, _data_dir: &std::path::Path, _member_id: u64, _api_token: &str) -> Result<(), Error> {
			*self.running.lock().unwrap() = true;
			Ok(())
		}

		async fn stop(&self) -> Result<(), Error> {
			*self.running.lock().unwrap() = false;
			Ok(())
		}

		async fn health_ready(&self) -> Result<bool, Error> {
			Ok(*self.running.lock().unwrap())
		}
	}

	#[derive(Default)]
	pub struct FakeContainerRuntime {
		pub networks: Mutex<HashSet<String>>,
	}

	impl FakeContainerRuntime {
		pub fn new() -> Self {
			Self::default()
		}
	}

	#[async_trait::async_trait]
	impl ContainerRuntime for FakeContainerRuntime {
		async fn ensure_network(&self, name: &str, _subnet: &str) -> Result<(), Error> {
			self.networks.lock().unwrap().insert(name.to_string());
			Ok(())
		}

		async fn remove_network(&self, name: &str) -> Result<(), Error> {
			self.networks.lock().unwrap().remove(name);
			Ok(())
		}

		async fn network_exists(&self, name: &str) -> Result<bool, Error> {
			Ok(self.networks.lock().unwrap().contains(name))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::fakes::*;
	use super::*;
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

	fn controller() -> (Controller, Arc<FakePlatformOps>, Arc<FakeCorrosionRuntime>, Arc<FakeContainerRuntime>) {
		let platform = Arc::new(FakePlatformOps::new());
		let corrosion = Arc::new(FakeCorrosionRuntime::new());
		let containers = Arc::new(FakeContainerRuntime::new());
		let controller = Controller::new(platform.clone(), corrosion.clone(), containers.clone());
		(controller, platform, corrosion, containers)
	}

	#[tokio::test]
	async fn start_brings_up_interface_runtime_and_network() {
		let (controller, platform, _corrosion, containers) = controller();
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = StateStore::open(&spec.data_root, &spec.network).unwrap();
		let registry = FakeRegistry::new();

		let runtime_cfg = controller.start(&spec, &state_store, &registry).await.unwrap();

		assert!(platform.interface_exists(&runtime_cfg.wg_interface).unwrap());
		assert!(containers.network_exists(&runtime_cfg.docker_network).await.unwrap());
		assert_eq!(registry.list_machines("demo").await.unwrap().len(), 1);

		let state = state_store.get_state().unwrap().unwrap();
		assert_eq!(state.phase, NetworkPhase::Running);
	}

	#[tokio::test]
	async fn start_reuses_existing_keypair_on_restart() {
		let (controller, ..) = controller();
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = StateStore::open(&spec.data_root, &spec.network).unwrap();
		let registry = FakeRegistry::new();

		controller.start(&spec, &state_store, &registry).await.unwrap();
		let first = state_store.get_state().unwrap().unwrap();

		controller.start(&spec, &state_store, &registry).await.unwrap();
		let second = state_store.get_state().unwrap().unwrap();

		assert_eq!(first.wg_public, second.wg_public);
	}

	#[tokio::test]
	async fn bring_up_failure_surfaces_as_error() {
		let (controller, platform, _corrosion, _containers) = controller();
		platform.set_fail_bring_up(true);
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = StateStore::open(&spec.data_root, &spec.network).unwrap();
		let registry = FakeRegistry::new();

		assert!(controller.start(&spec, &state_store, &registry).await.is_err());
	}

	#[tokio::test]
	async fn stop_without_purge_keeps_state() {
		let (controller, ..) = controller();
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = StateStore::open(&spec.data_root, &spec.network).unwrap();
		let registry = FakeRegistry::new();

		controller.start(&spec, &state_store, &registry).await.unwrap();
		controller.stop(&spec, &state_store, false).await.unwrap();

		let state = state_store.get_state().unwrap();
		assert!(state.is_some());
		assert_eq!(state.unwrap().phase, NetworkPhase::Stopped);
	}

	#[tokio::test]
	async fn stop_with_purge_deletes_state_and_network() {
		let (controller, _platform, _corrosion, containers) = controller();
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = StateStore::open(&spec.data_root, &spec.network).unwrap();
		let registry = FakeRegistry::new();

		let runtime_cfg = controller.start(&spec, &state_store, &registry).await.unwrap();
		controller.stop(&spec, &state_store, true).await.unwrap();

		assert!(state_store.get_state().unwrap().is_none());
		assert!(!containers.network_exists(&runtime_cfg.docker_network).await.unwrap());
	}

	#[tokio::test]
	async fn status_reflects_running_runtime() {
		let (controller, ..) = controller();
		let dir = mktemp::Temp::new_dir().unwrap();
		let spec = sample_spec(&dir);
		let state_store = StateStore::open(&spec.data_root, &spec.network).unwrap();
		let registry = FakeRegistry::new();

		controller.start(&spec, &state_store, &registry).await.unwrap();
		let status = controller.status(&spec, &state_store).await.unwrap();

		assert!(status.configured);
		assert!(status.running);
		assert_eq!(status.network_phase, NetworkPhase::Running);
	}
}
