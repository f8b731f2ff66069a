//! Routes an incoming request to the local backend, one remote backend,
//! or fans it out to several (§4.9 "Director algorithm").

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::future::join_all;

use ployz_manager::Manager;
use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::{daemon_port_for_name, overlay_first_host, MachineEntry};

use crate::backend::{Backend, BackendCache, LocalBackend};
use crate::wire::{Reply, RequestBody, RequestEnvelope, WireError, Wrapped};

const RPC_PORT_RANGE: (u16, u16) = (9000, 10000);

pub fn rpc_port_for(network: &str) -> u16 {
	daemon_port_for_name(network, RPC_PORT_RANGE.0, RPC_PORT_RANGE.1)
}

fn remote_dial_addr(row: &MachineEntry, port: u16) -> SocketAddr {
	match overlay_first_host(&row.subnet) {
		Ok(ip) => SocketAddr::new(ip, port),
		Err(_) => SocketAddr::new(IpAddr::V6(row.management_ip), port),
	}
}

pub struct Director {
	manager: Arc<Manager>,
	local: Arc<LocalBackend>,
	remotes: BackendCache,
	local_management_ip: ArcSwapOption<std::net::Ipv6Addr>,
}

impl Director {
	pub fn new(manager: Arc<Manager>) -> Self {
		let local = Arc::new(LocalBackend::new(manager.clone()));
		Self {
			manager,
			local,
			remotes: BackendCache::new(),
			local_management_ip: ArcSwapOption::empty(),
		}
	}

	/// Updates the address this Director considers "local" (§4.9 "The
	/// local backend is replaced atomically when identity becomes
	/// known"), called by the identity watcher.
	pub fn set_local_management_ip(&self, ip: std::net::Ipv6Addr) {
		self.local_management_ip.store(Some(Arc::new(ip)));
	}

	pub async fn flush_remote_backends(&self) {
		self.remotes.flush().await;
	}

	pub async fn handle(&self, envelope: RequestEnvelope) -> Reply {
		if envelope.proxy_authority || envelope.machines.is_none() {
			let result = self.local.dispatch(&envelope.network, envelope.body).await;
			return Reply::Single(result.map_err(|e| WireError::from(&e)));
		}

		let machines = envelope.machines.clone().unwrap_or_default();
		let targets = match self.resolve_targets(&envelope.network, &machines).await {
			Ok(t) => t,
			Err(e) => return Reply::Single(Err(WireError::from(&e))),
		};

		let calls = targets.into_iter().map(|row| {
			let body = envelope.body.clone();
			let network = envelope.network.clone();
			async move {
				let addr_label;
				let outcome = if self.is_local(&row) {
					addr_label = "local".to_string();
					self.local.dispatch(&network, body).await
				} else {
					let port = rpc_port_for(&network);
					let addr = remote_dial_addr(&row, port);
					addr_label = addr.to_string();
					let backend = self.remotes.get_or_create(addr).await;
					self.dispatch_remote(backend, &network, body).await
				};
				match outcome {
					Ok(b) => Wrapped {
						machine_addr: addr_label,
						machine_id: Some(row.id),
						error: None,
						body: Some(b),
					},
					Err(e) => Wrapped {
						machine_addr: addr_label,
						machine_id: Some(row.id),
						error: Some(e.to_string()),
						body: None,
					},
				}
			}
		});

		Reply::Many(join_all(calls).await)
	}

	async fn dispatch_remote(&self, backend: Arc<crate::backend::RemoteBackend>, network: &str, body: RequestBody) -> Result<crate::wire::ResponseBody, Error> {
		backend.dispatch(network, body).await
	}

	fn is_local(&self, row: &MachineEntry) -> bool {
		match self.local_management_ip.load().as_deref() {
			Some(ip) => *ip == row.management_ip,
			None => false,
		}
	}

	/// `"*"` expands to every known machine; otherwise each entry must
	/// match a `MachineEntry.id` (§4.9 step 3).
	async fn resolve_targets(&self, network: &str, machines: &[String]) -> Result<Vec<MachineEntry>, Error> {
		let snapshot = self.manager.list_machines(network).await?;

		if machines.iter().any(|m| m == "*") {
			return Ok(snapshot);
		}

		let mut targets = Vec::with_capacity(machines.len());
		for m in machines {
			let id = MachineId::from_str(m)?;
			let row = snapshot
				.iter()
				.find(|r| r.id == id)
				.cloned()
				.ok_or_else(|| Error::InvalidArgument(format!("machine {:?} is not a known member of network {}", m, network)))?;
			targets.push(row);
		}
		Ok(targets)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ployz_controller::fakes::{FakeContainerRuntime, FakeCorrosionRuntime, FakePlatformOps};
	use ployz_reconcile::FakeDriver;
	use ployz_registry::FakeRegistry;
	use ployz_util::model::NetworkSpec;
	use std::net::Ipv6Addr;

	fn no_op_ntp() -> ployz_manager::NtpSampleFn {
		Arc::new(|| Box::pin(async { Ok(chrono::Duration::milliseconds(0)) }))
	}

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

	async fn manager_with_network(dir: &std::path::Path) -> Arc<Manager> {
		let registry: Arc<dyn ployz_registry::RegistryClient> = Arc::new(FakeRegistry::new());
		let registry_factory: ployz_manager::RegistryFactory = Arc::new(move |_runtime_cfg, _token| registry.clone());
		let mgr = Manager::new(
			dir.to_path_buf(),
			Arc::new(FakePlatformOps::new()),
			Arc::new(FakeCorrosionRuntime::new()),
			Arc::new(FakeContainerRuntime::new()),
			registry_factory,
			Arc::new(FakeDriver::new()),
			9000,
			no_op_ntp(),
		)
		.unwrap();
		mgr.apply_network_spec(sample_spec(dir)).await.unwrap();
		mgr
	}

	fn row(id: u8, subnet: &str) -> MachineEntry {
		MachineEntry {
			id: MachineId([id; 32]),
			public_key: MachineId([id; 32]),
			subnet: subnet.to_string(),
			management_ip: format!("fd00::{}", id).parse().unwrap(),
			endpoint: None,
			last_updated: ployz_util::time::now(),
			version: 0,
		}
	}

	#[tokio::test]
	async fn proxy_authority_always_routes_local() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let manager = manager_with_network(&dir).await;
		let director = Director::new(manager);

		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: Some(vec!["*".to_string()]),
			proxy_authority: true,
			body: RequestBody::GetStatus,
		};
		match director.handle(envelope).await {
			Reply::Single(Ok(_)) => {}
			other => panic!("expected a local single reply, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn no_machines_metadata_routes_local() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let manager = manager_with_network(&dir).await;
		let director = Director::new(manager);

		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: None,
			proxy_authority: false,
			body: RequestBody::GetStatus,
		};
		match director.handle(envelope).await {
			Reply::Single(Ok(_)) => {}
			other => panic!("expected a local single reply, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn unknown_machine_id_is_invalid_argument() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let manager = manager_with_network(&dir).await;
		let director = Director::new(manager);

		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: Some(vec!["not-a-real-id".to_string()]),
			proxy_authority: false,
			body: RequestBody::GetStatus,
		};
		match director.handle(envelope).await {
			Reply::Single(Err(e)) => assert_eq!(e.kind, ployz_util::error::ErrorKind::InvalidArgument),
			other => panic!("expected an invalid-argument error, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn wildcard_fans_out_to_every_known_machine() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let manager = manager_with_network(&dir).await;
		manager
			.upsert_machine("demo", row(9, "10.210.9.0/24"), 0)
			.await
			.unwrap();
		let director = Director::new(manager);

		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: Some(vec!["*".to_string()]),
			proxy_authority: false,
			body: RequestBody::GetStatus,
		};
		match director.handle(envelope).await {
			Reply::Many(results) => assert_eq!(results.len(), 2),
			other => panic!("expected a fanned-out reply, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn a_target_matching_local_management_ip_is_dispatched_locally() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let manager = manager_with_network(&dir).await;
		let identity = manager.get_identity("demo").unwrap();
		let director = Director::new(manager);
		director.set_local_management_ip(identity.management_ip);

		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: Some(vec![identity.machine_id.to_string()]),
			proxy_authority: false,
			body: RequestBody::GetStatus,
		};
		match director.handle(envelope).await {
			Reply::Many(results) => {
				assert_eq!(results.len(), 1);
				assert_eq!(results[0].machine_addr, "local");
				assert!(results[0].error.is_none());
			}
			other => panic!("expected a fanned-out reply, got {:?}", other),
		}
	}
}
