//! Production collaborators for [`crate::Controller`] (§9): a WireGuard
//! interface driver backed by `wireguard-control`, a Corrosion-process
//! runtime, and a Docker bridge-network runtime. Each has a `fakes`
//! counterpart used in tests; these are the real thing, wired up by the
//! `ployzd` binary.

use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use ployz_util::error::Error;

use crate::{CorrosionRuntime, ContainerRuntime, PlatformOps};

/// Brings a WireGuard interface up or down using the kernel (or userspace
/// fallback) backend `wireguard-control` selects, plus `ip` for address
/// assignment, which `wireguard-control` itself does not manage.
pub struct WireguardPlatformOps {
	backend: wireguard_control::Backend,
}

impl WireguardPlatformOps {
	pub fn new() -> Self {
		Self {
			backend: wireguard_control::Backend::default(),
		}
	}

	fn run_ip(&self, args: &[&str]) -> Result<(), Error> {
		let output = std::process::Command::new("ip")
			.args(args)
			.output()
			.map_err(|e| Error::Unavailable(format!("unable to run ip {:?}: {}", args, e)))?;
		if !output.status.success() {
			return Err(Error::Unavailable(format!(
				"ip {:?} failed: {}",
				args,
				String::from_utf8_lossy(&output.stderr)
			)));
		}
		Ok(())
	}
}

impl Default for WireguardPlatformOps {
	fn default() -> Self {
		Self::new()
	}
}

impl PlatformOps for WireguardPlatformOps {
	fn bring_up_interface(&self, interface: &str, private_key: &str, address: IpAddr, prefix: u8, port: u16) -> Result<(), Error> {
		let iface: wireguard_control::InterfaceName = interface
			.parse()
			.map_err(|_| Error::InvalidArgument(format!("invalid interface name {:?}", interface)))?;

		let key = wireguard_control::Key::from_base64(private_key)
			.map_err(|e| Error::Internal(format!("invalid private key: {}", e)))?;

		wireguard_control::DeviceUpdate::new()
			.set_private_key(key)
			.set_listen_port(port)
			.apply(&iface, self.backend)
			.map_err(|e| Error::Unavailable(format!("unable to create interface {}: {}", interface, e)))?;

		self.run_ip(&["link", "set", "dev", interface, "up"])?;
		self.run_ip(&["address", "add", &format!("{}/{}", address, prefix), "dev", interface])?;
		Ok(())
	}

	fn take_down_interface(&self, interface: &str) -> Result<(), Error> {
		let iface: wireguard_control::InterfaceName = interface
			.parse()
			.map_err(|_| Error::InvalidArgument(format!("invalid interface name {:?}", interface)))?;
		wireguard_control::delete_interface(&iface, self.backend)
			.map_err(|e| Error::Unavailable(format!("unable to delete interface {}: {}", interface, e)))
	}

	fn interface_exists(&self, interface: &str) -> Result<bool, Error> {
		let iface: wireguard_control::InterfaceName = interface
			.parse()
			.map_err(|_| Error::InvalidArgument(format!("invalid interface name {:?}", interface)))?;
		Ok(wireguard_control::Device::get(&iface, self.backend).is_ok())
	}
}

/// Runs the membership-store (Corrosion) process per network and polls its
/// HTTP health endpoint (§4.6).
pub struct ProcessCorrosionRuntime {
	binary: String,
	health_addr: String,
	child: Mutex<Option<Child>>,
	http: reqwest::Client,
}

impl ProcessCorrosionRuntime {
	pub fn new(binary: impl Into<String>, health_addr: impl Into<String>) -> Self {
		Self {
			binary: binary.into(),
			health_addr: health_addr.into(),
			child: Mutex::new(None),
			http: reqwest::Client::new(),
		}
	}
}

#[async_trait::async_trait]
impl CorrosionRuntime for ProcessCorrosionRuntime {
	async fn start(&self, data_dir: &Path, member_id: u64, api_token: &str) -> Result<(), Error> {
		std::fs::create_dir_all(data_dir)?;
		let child = Command::new(&self.binary)
			.arg("agent")
			.arg("--data-dir")
			.arg(data_dir)
			.arg("--member-id")
			.arg(member_id.to_string())
			.env("CORROSION_API_TOKEN", api_token)
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| Error::Unavailable(format!("unable to spawn {}: {}", self.binary, e)))?;
		*self.child.lock().await = Some(child);
		Ok(())
	}

	async fn stop(&self) -> Result<(), Error> {
		if let Some(mut child) = self.child.lock().await.take() {
			child.kill().await.ok();
		}
		Ok(())
	}

	async fn health_ready(&self) -> Result<bool, Error> {
		let url = format!("http://{}/health", self.health_addr);
		match self.http.get(&url).send().await {
			Ok(resp) => Ok(resp.status().is_success()),
			Err(_) => Ok(false),
		}
	}
}

/// Ensures the Docker bridge network backing a network's workloads
/// exists with the right subnet, by shelling out to the `docker` CLI the
/// way a small ops tool naturally would rather than depend on the full
/// Docker Engine API client.
pub struct DockerContainerRuntime;

impl DockerContainerRuntime {
	pub fn new() -> Self {
		Self
	}

	async fn docker(&self, args: &[&str]) -> Result<std::process::Output, Error> {
		Command::new("docker")
			.args(args)
			.output()
			.await
			.map_err(|e| Error::Unavailable(format!("unable to run docker {:?}: {}", args, e)))
	}
}

impl Default for DockerContainerRuntime {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerContainerRuntime {
	async fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), Error> {
		if self.network_exists(name).await? {
			return Ok(());
		}
		let output = self.docker(&["network", "create", "--subnet", subnet, name]).await?;
		if !output.status.success() {
			return Err(Error::Unavailable(format!(
				"docker network create {} failed: {}",
				name,
				String::from_utf8_lossy(&output.stderr)
			)));
		}
		Ok(())
	}

	async fn remove_network(&self, name: &str) -> Result<(), Error> {
		let output = self.docker(&["network", "rm", name]).await?;
		if !output.status.success() {
			tracing::warn!("docker network rm {} failed: {}", name, String::from_utf8_lossy(&output.stderr));
		}
		Ok(())
	}

	async fn network_exists(&self, name: &str) -> Result<bool, Error> {
		let output = self.docker(&["network", "inspect", name]).await?;
		Ok(output.status.success())
	}
}

pub fn production_platform_ops() -> Arc<dyn PlatformOps> {
	Arc::new(WireguardPlatformOps::new())
}

pub fn production_container_runtime() -> Arc<dyn ContainerRuntime> {
	Arc::new(DockerContainerRuntime::new())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wireguard_platform_ops_rejects_an_invalid_interface_name() {
		let ops = WireguardPlatformOps::new();
		let err = ops.interface_exists("not valid!").unwrap_err();
		assert_eq!(err.kind(), ployz_util::error::ErrorKind::InvalidArgument);
	}
}
