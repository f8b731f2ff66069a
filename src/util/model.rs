//! The core data model (§3): the declarative `NetworkSpec`, the
//! gossip-replicated `MachineEntry` row, and the local, disk-resident
//! `LocalState`. These are plain serde structs shared by every crate that
//! touches persistence, the registry, or the wire — the same role
//! `garage_util::data` plays for `Hash`/`Uuid` in the teacher crate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, OkOrMessage};
use crate::id::MachineId;

/// Declarative input to `ApplyNetworkSpec` (§3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
	pub network: String,
	pub data_root: std::path::PathBuf,
	pub network_cidr: String,
	pub subnet: String,
	pub management_ip: Ipv6Addr,
	#[serde(default)]
	pub advertise_endpoint: Option<SocketAddr>,
	#[serde(default)]
	pub wg_port: u16,
	pub corrosion_member_id: u64,
	pub corrosion_api_token: String,
	#[serde(default)]
	pub bootstrap: Vec<SocketAddr>,
	#[serde(default)]
	pub helper_image: Option<String>,
}

impl NetworkSpec {
	/// Normalize `network` (lowercase, trimmed) and fall back to "default"
	/// on empty input, per §3/§8 round-trip law.
	pub fn normalize(&mut self) {
		let trimmed = self.network.trim().to_lowercase();
		self.network = if trimmed.is_empty() {
			"default".to_string()
		} else {
			trimmed
		};
	}

	/// Validate the invariants stated in §3: `subnet` must parse as an
	/// IPv4 `/24` contained in `network_cidr`, a parseable IPv4 `/16`
	/// (or wider) supernet.
	pub fn validate(&self) -> Result<(), Error> {
		if self.network.trim().is_empty() {
			return Err(Error::InvalidArgument("network name must not be empty".into()));
		}
		let cidr = parse_cidr(&self.network_cidr)
			.err_invalid(&format!("network_cidr {:?} is not a valid CIDR", self.network_cidr))?;
		let subnet = parse_cidr(&self.subnet)
			.err_invalid(&format!("subnet {:?} is not a valid CIDR", self.subnet))?;
		if subnet.prefix != 24 {
			return Err(Error::InvalidArgument(format!(
				"subnet {} must be a /24",
				self.subnet
			)));
		}
		if !cidr.contains(&subnet) {
			return Err(Error::InvalidArgument(format!(
				"subnet {} is not contained in network_cidr {}",
				self.subnet, self.network_cidr
			)));
		}
		if self.corrosion_api_token.trim().is_empty() {
			return Err(Error::InvalidArgument("corrosion_api_token is required".into()));
		}
		Ok(())
	}

	/// Derive the daemon port for this network, stable across restarts,
	/// when the caller did not pin one explicitly (§6 "Daemon port
	/// derivation").
	pub fn effective_wg_port(&self) -> u16 {
		if self.wg_port != 0 {
			self.wg_port
		} else {
			daemon_port_for_name(&self.network, 1024, 65535)
		}
	}
}

trait InvalidArg<T> {
	fn err_invalid(self, msg: &str) -> Result<T, Error>;
}

impl<T> InvalidArg<T> for Option<T> {
	fn err_invalid(self, msg: &str) -> Result<T, Error> {
		self.ok_or_message(msg.to_string())
	}
}

/// A minimal IPv4 CIDR, parsed without pulling in a dedicated crate the
/// teacher doesn't already depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr4 {
	pub addr: Ipv4Addr,
	pub prefix: u8,
}

impl Cidr4 {
	pub fn contains(&self, other: &Cidr4) -> bool {
		if other.prefix < self.prefix {
			return false;
		}
		mask(self.addr, self.prefix) == mask(other.addr, self.prefix)
	}

	/// The first usable host address in this block (used to derive the
	/// overlay IPv4 a machine listens the TCP proxy on, §4.9).
	pub fn first_host(&self) -> Ipv4Addr {
		let base = u32::from(self.addr) & mask_bits(self.prefix);
		Ipv4Addr::from(base + 1)
	}
}

fn mask_bits(prefix: u8) -> u32 {
	if prefix == 0 {
		0
	} else {
		u32::MAX << (32 - prefix as u32)
	}
}

fn mask(addr: Ipv4Addr, prefix: u8) -> u32 {
	u32::from(addr) & mask_bits(prefix)
}

pub fn parse_cidr(s: &str) -> Option<Cidr4> {
	let (addr_s, prefix_s) = s.split_once('/')?;
	let addr: Ipv4Addr = addr_s.parse().ok()?;
	let prefix: u8 = prefix_s.parse().ok()?;
	if prefix > 32 {
		return None;
	}
	Some(Cidr4 { addr, prefix })
}

/// Stable hash of `name` into `[low, high)`, shared by the daemon-port
/// derivation and by the proxy's remote-dial port lookup (§6).
pub fn daemon_port_for_name(name: &str, low: u16, high: u16) -> u16 {
	use std::hash::{Hash, Hasher};
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	name.hash(&mut hasher);
	let h = hasher.finish();
	let span = (high - low) as u64;
	low + (h % span.max(1)) as u16
}

/// `(NetworkSpec, enabled)` as persisted by `ployz_store` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSpec {
	pub spec: NetworkSpec,
	pub enabled: bool,
}

/// A row in the gossip-replicated membership registry (§3, §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEntry {
	pub id: MachineId,
	pub public_key: MachineId,
	pub subnet: String,
	pub management_ip: Ipv6Addr,
	#[serde(default)]
	pub endpoint: Option<SocketAddr>,
	pub last_updated: DateTime<Utc>,
	pub version: i64,
}

impl MachineEntry {
	/// `allowed-ips` this peer should be granted on the WireGuard
	/// interface (§4.5): its own `/32` management IP, union its `/24`
	/// subnet.
	pub fn allowed_ips(&self) -> Vec<String> {
		vec![
			format!("{}/128", self.management_ip),
			self.subnet.clone(),
		]
	}
}

/// Local, disk-resident state created by `Controller::Start` (§3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalState {
	pub wg_public: MachineId,
	pub wg_private: String,
	pub subnet: String,
	pub management: Ipv6Addr,
	pub advertise: Option<SocketAddr>,
	pub cidr: String,
	pub wg_interface: String,
	pub wg_port: u16,
	pub corrosion_member_id: u64,
	pub corrosion_api_token: String,
	pub phase: NetworkPhase,
}

/// Lifecycle phase surfaced on `LocalState`/`GetStatus` (§4.8), distinct
/// from the supervisor's own FSM in `ployz_phases`: this is the coarse,
/// user-facing summary ("configuring", "running", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPhase {
	Configuring,
	Running,
	Degraded,
	Stopped,
}

impl std::fmt::Display for NetworkPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			NetworkPhase::Configuring => "configuring",
			NetworkPhase::Running => "running",
			NetworkPhase::Degraded => "degraded",
			NetworkPhase::Stopped => "stopped",
		};
		write!(f, "{}", s)
	}
}

/// Resolve a machine's overlay-facing first-host IPv4 address from its
/// `/24` subnet string (§4.9 "identity watcher").
pub fn overlay_first_host(subnet: &str) -> Result<IpAddr, Error> {
	let cidr = parse_cidr(subnet).ok_or_message(format!("invalid subnet {:?}", subnet))?;
	Ok(IpAddr::V4(cidr.first_host()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_spec() -> NetworkSpec {
		NetworkSpec {
			network: "  Demo  ".to_string(),
			data_root: "/var/lib/ployz".into(),
			network_cidr: "10.210.0.0/16".to_string(),
			subnet: "10.210.1.0/24".to_string(),
			management_ip: "fd00::1".parse().unwrap(),
			advertise_endpoint: None,
			wg_port: 51820,
			corrosion_member_id: 1,
			corrosion_api_token: "secret".to_string(),
			bootstrap: vec![],
			helper_image: None,
		}
	}

	#[test]
	fn normalize_lowercases_and_trims() {
		let mut spec = sample_spec();
		spec.normalize();
		assert_eq!(spec.network, "demo");
	}

	#[test]
	fn normalize_empty_defaults_to_default() {
		let mut spec = sample_spec();
		spec.network = "   ".to_string();
		spec.normalize();
		assert_eq!(spec.network, "default");
	}

	#[test]
	fn validate_accepts_contained_subnet() {
		let spec = sample_spec();
		assert!(spec.validate().is_ok());
	}

	#[test]
	fn validate_rejects_subnet_outside_cidr() {
		let mut spec = sample_spec();
		spec.subnet = "10.211.1.0/24".to_string();
		assert!(spec.validate().is_err());
	}

	#[test]
	fn validate_rejects_non_24_subnet() {
		let mut spec = sample_spec();
		spec.subnet = "10.210.0.0/23".to_string();
		assert!(spec.validate().is_err());
	}

	#[test]
	fn effective_wg_port_is_stable_when_zero() {
		let mut spec = sample_spec();
		spec.wg_port = 0;
		let a = spec.effective_wg_port();
		let b = spec.effective_wg_port();
		assert_eq!(a, b);
		assert!(a >= 1024);
	}

	#[test]
	fn cidr_contains_is_prefix_aware() {
		let cidr = parse_cidr("10.210.0.0/16").unwrap();
		let subnet = parse_cidr("10.210.1.0/24").unwrap();
		let other = parse_cidr("10.211.1.0/24").unwrap();
		assert!(cidr.contains(&subnet));
		assert!(!cidr.contains(&other));
	}

	#[test]
	fn first_host_is_base_plus_one() {
		let cidr = parse_cidr("10.210.2.0/24").unwrap();
		assert_eq!(cidr.first_host(), "10.210.2.1".parse::<Ipv4Addr>().unwrap());
	}

	#[test]
	fn machine_entry_allowed_ips_union_management_and_subnet() {
		let entry = MachineEntry {
			id: MachineId([1u8; 32]),
			public_key: MachineId([1u8; 32]),
			subnet: "10.210.2.0/24".to_string(),
			management_ip: "fd00::2".parse().unwrap(),
			endpoint: None,
			last_updated: Utc::now(),
			version: 1,
		};
		let ips = entry.allowed_ips();
		assert_eq!(ips, vec!["fd00::2/128".to_string(), "10.210.2.0/24".to_string()]);
	}
}
