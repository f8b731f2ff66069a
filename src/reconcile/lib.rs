//! Reconciliation of the registry snapshot into a target WireGuard peer
//! set, and the driver that applies it to the kernel interface (§4.5, C5).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::{LocalState, MachineEntry};

/// Keepalive interval applied to every peer (§4.5).
pub const PERSISTENT_KEEPALIVE: Duration = Duration::from_secs(25);

/// One entry of the target peer set yielded by [`reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
	pub public_key: MachineId,
	pub allowed_ips: Vec<String>,
	pub endpoint: Option<SocketAddr>,
	pub keepalive: Duration,
}

/// Pure function: every registry row other than `local_state`'s own
/// identity becomes one [`PeerConfig`] (§4.5). `network_cidr` is taken
/// for signature parity with the contract; allowed-ips are derived
/// per-row from [`MachineEntry::allowed_ips`], not recomputed from it.
pub fn reconcile(local_state: &LocalState, registry_snapshot: &[MachineEntry], _network_cidr: &str) -> Vec<PeerConfig> {
	registry_snapshot
		.iter()
		.filter(|row| row.id != local_state.wg_public)
		.map(|row| PeerConfig {
			public_key: row.public_key,
			allowed_ips: row.allowed_ips(),
			endpoint: row.endpoint,
			keepalive: PERSISTENT_KEEPALIVE,
		})
		.collect()
}

/// Platform driver applying a target peer set to a live WireGuard
/// interface (§4.5). Implementors must be idempotent: calling
/// `apply_peer_config` twice with the same target must leave the
/// interface in the same state, and any peer present on the interface
/// but absent from `target` must be removed.
pub trait WireGuardDriver: Send + Sync {
	/// Applies `target` to `interface`, returning the number of peers
	/// now configured on it.
	fn apply_peer_config(&self, interface: &str, target: &[PeerConfig]) -> Result<usize, Error>;
}

/// Production driver against a real kernel (or userspace) WireGuard
/// interface via `wireguard-control`, grounded on the same
/// `DeviceUpdate::new().add_peer(..)` / `.remove_peer_by_key(..)` calls
/// `innernet-server` uses to converge its own peer list.
pub struct WireguardControlDriver {
	backend: wireguard_control::Backend,
}

impl WireguardControlDriver {
	pub fn new() -> Self {
		Self {
			backend: wireguard_control::Backend::default(),
		}
	}
}

impl Default for WireguardControlDriver {
	fn default() -> Self {
		Self::new()
	}
}

impl WireGuardDriver for WireguardControlDriver {
	fn apply_peer_config(&self, interface: &str, target: &[PeerConfig]) -> Result<usize, Error> {
		let iface: wireguard_control::InterfaceName = interface
			.parse()
			.map_err(|_| Error::InvalidArgument(format!("invalid interface name {:?}", interface)))?;

		let current = wireguard_control::Device::get(&iface, self.backend)
			.map_err(|e| Error::Unavailable(format!("unable to read interface {}: {}", interface, e)))?;

		let target_keys: HashSet<[u8; 32]> = target.iter().map(|p| *p.public_key.as_bytes()).collect();

		let mut update = wireguard_control::DeviceUpdate::new();
		for peer in &current.peers {
			let key_bytes = *peer.config.public_key.as_bytes();
			if !target_keys.contains(&key_bytes) {
				update = update.remove_peer_by_key(&peer.config.public_key);
			}
		}

		for peer in target {
			let key = wireguard_control::Key::from_base64(&base64_encode(peer.public_key.as_bytes()))
				.map_err(|e| Error::Internal(format!("invalid peer public key: {}", e)))?;
			let mut builder = wireguard_control::PeerConfigBuilder::new(&key)
				.set_persistent_keepalive_interval(peer.keepalive.as_secs() as u16);
			for allowed_ip in &peer.allowed_ips {
				if let Some(cidr) = parse_ip_net(allowed_ip) {
					builder = builder.add_allowed_ip(cidr.0, cidr.1);
				}
			}
			if let Some(endpoint) = peer.endpoint {
				builder = builder.set_endpoint(endpoint);
			}
			update = update.add_peer(builder);
		}

		update
			.apply(&iface, self.backend)
			.map_err(|e| Error::Unavailable(format!("unable to apply peer config to {}: {}", interface, e)))?;

		Ok(target.len())
	}
}

fn base64_encode(bytes: &[u8; 32]) -> String {
	use std::fmt::Write;
	const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
	let mut out = String::with_capacity(44);
	for chunk in bytes.chunks(3) {
		let b0 = chunk[0] as u32;
		let b1 = *chunk.get(1).unwrap_or(&0) as u32;
		let b2 = *chunk.get(2).unwrap_or(&0) as u32;
		let n = (b0 << 16) | (b1 << 8) | b2;
		let _ = write!(out, "{}", TABLE[((n >> 18) & 0x3f) as usize] as char);
		let _ = write!(out, "{}", TABLE[((n >> 12) & 0x3f) as usize] as char);
		out.push(if chunk.len() > 1 { TABLE[((n >> 6) & 0x3f) as usize] as char } else { '=' });
		out.push(if chunk.len() > 2 { TABLE[(n & 0x3f) as usize] as char } else { '=' });
	}
	out
}

fn parse_ip_net(s: &str) -> Option<(std::net::IpAddr, u8)> {
	let (addr_s, prefix_s) = s.split_once('/')?;
	Some((addr_s.parse().ok()?, prefix_s.parse().ok()?))
}

/// In-memory [`WireGuardDriver`] for tests: records the last applied
/// peer set instead of touching a real interface.
#[derive(Default)]
pub struct FakeDriver {
	pub applied: std::sync::Mutex<Vec<(String, Vec<PeerConfig>)>>,
}

impl FakeDriver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn last(&self) -> Option<(String, Vec<PeerConfig>)> {
		self.applied.lock().unwrap().last().cloned()
	}
}

impl WireGuardDriver for FakeDriver {
	fn apply_peer_config(&self, interface: &str, target: &[PeerConfig]) -> Result<usize, Error> {
		self.applied.lock().unwrap().push((interface.to_string(), target.to_vec()));
		Ok(target.len())
	}
}
