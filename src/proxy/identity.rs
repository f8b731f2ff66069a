//! Polls `GetIdentity` until the management IP is known, then tells the
//! [`Director`] which address is local and starts the TCP listeners bound
//! to it (§4.9 "Identity watcher").

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use ployz_manager::Manager;
use ployz_util::model::overlay_first_host;

use crate::director::{rpc_port_for, Director};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches a single network's identity and binds its TCP listener once the
/// management IP is assigned. Failing to bind either address is logged and
/// left for the next poll; it never aborts the watcher.
pub async fn identity_loop(network: String, manager: Arc<Manager>, director: Arc<Director>, mut stop_signal: watch::Receiver<bool>) {
	let mut bound = false;

	while !*stop_signal.borrow() {
		match manager.get_identity(&network) {
			Ok(identity) if !identity.management_ip.is_unspecified() => {
				director.set_local_management_ip(identity.management_ip);

				if !bound {
					let port = rpc_port_for(&network);
					bound = bind_tcp_listeners(&network, identity.management_ip, &identity.subnet, port, director.clone(), stop_signal.clone()).await;
				}
			}
			Ok(_) => {}
			Err(e) => warn!("identity watcher for {}: {}", network, e),
		}

		tokio::select! {
			_ = tokio::time::sleep(POLL_INTERVAL) => {},
			_ = stop_signal.changed() => {},
		}
	}
}

async fn bind_tcp_listeners(network: &str, management_ip: Ipv6Addr, subnet: &str, port: u16, director: Arc<Director>, stop_signal: watch::Receiver<bool>) -> bool {
	let mut any = false;

	let mgmt_addr = SocketAddr::new(IpAddr::V6(management_ip), port);
	match tokio::net::TcpListener::bind(mgmt_addr).await {
		Ok(listener) => {
			info!("{}: listening on management address {}", network, mgmt_addr);
			tokio::spawn(crate::server::accept_loop(listener, director.clone(), stop_signal.clone()));
			any = true;
		}
		Err(e) => error!("{}: failed to bind management address {}: {}", network, mgmt_addr, e),
	}

	match overlay_first_host(subnet) {
		Ok(ip) => {
			let overlay_addr = SocketAddr::new(ip, port);
			match tokio::net::TcpListener::bind(overlay_addr).await {
				Ok(listener) => {
					info!("{}: listening on overlay address {}", network, overlay_addr);
					tokio::spawn(crate::server::accept_loop(listener, director, stop_signal));
					any = true;
				}
				Err(e) => error!("{}: failed to bind overlay address {}: {}", network, overlay_addr, e),
			}
		}
		Err(e) => warn!("{}: cannot derive overlay address: {}", network, e),
	}

	any
}

#[cfg(test)]
mod tests {
	use super::*;
	use ployz_controller::fakes::{FakeContainerRuntime, FakeCorrosionRuntime, FakePlatformOps};
	use ployz_reconcile::FakeDriver;
	use ployz_registry::FakeRegistry;
	use ployz_util::model::NetworkSpec;

	fn no_op_ntp() -> ployz_manager::NtpSampleFn {
		Arc::new(|| Box::pin(async { Ok(chrono::Duration::milliseconds(0)) }))
	}

	#[tokio::test]
	async fn identity_watcher_stops_promptly_on_signal() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let registry: Arc<dyn ployz_registry::RegistryClient> = Arc::new(FakeRegistry::new());
		let registry_factory: ployz_manager::RegistryFactory = Arc::new(move |_runtime_cfg, _token| registry.clone());
		let manager = Manager::new(
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
		manager
			.apply_network_spec(NetworkSpec {
				network: "demo".to_string(),
				data_root: dir.to_path_buf(),
				network_cidr: "10.210.0.0/16".to_string(),
				subnet: "10.210.1.0/24".to_string(),
				management_ip: "fd00::1".parse().unwrap(),
				advertise_endpoint: None,
				wg_port: 51820,
				corrosion_member_id: 1,
				corrosion_api_token: "secret".to_string(),
				bootstrap: vec![],
				helper_image: None,
			})
			.await
			.unwrap();

		let director = Arc::new(Director::new(manager.clone()));
		let (tx, rx) = watch::channel(false);
		let handle = tokio::spawn(identity_loop("demo".to_string(), manager, director, rx));

		tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
	}
}
