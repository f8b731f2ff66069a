//! The on-wire request/response shapes and framing (§6 expansion).
//!
//! Frames are a `u32` big-endian length prefix followed by a MessagePack
//! body, the same encoding `ployz_util::persister` already uses for its
//! on-disk values — `rmp-serde` is an existing `ployz_util` dependency, so
//! the wire format adds no new serialization stack.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::{MachineEntry, NetworkSpec};

/// Largest frame this codec accepts, a defensive bound against a
/// corrupt or hostile peer sending a bogus length prefix.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One call envelope (§4.9, §6): the method plus the proxy-routing
/// metadata the Director inspects before the body reaches any backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
	pub network: String,
	/// `None` is a one-to-one call to the local backend (§4.9 step 2).
	/// `Some(["*"])` or `Some([ids...])` selects proxy fan-out targets.
	#[serde(default)]
	pub machines: Option<Vec<String>>,
	/// Set by the Director on the hop it forwards, so the receiving
	/// daemon's own Director short-circuits to its local backend
	/// (§4.9 step 1, §5 "no proxy loops").
	#[serde(default)]
	pub proxy_authority: bool,
	pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
	ApplyNetworkSpec(NetworkSpec),
	DisableNetwork { purge: bool },
	GetStatus,
	GetIdentity,
	ListMachines,
	UpsertMachine { row: MachineEntry, expected_version: i64 },
	RemoveMachine { id: MachineId },
	TriggerReconcile,
	GetPeerHealth,
}

impl RequestBody {
	pub fn method_name(&self) -> &'static str {
		match self {
			RequestBody::ApplyNetworkSpec(_) => "ApplyNetworkSpec",
			RequestBody::DisableNetwork { .. } => "DisableNetwork",
			RequestBody::GetStatus => "GetStatus",
			RequestBody::GetIdentity => "GetIdentity",
			RequestBody::ListMachines => "ListMachines",
			RequestBody::UpsertMachine { .. } => "UpsertMachine",
			RequestBody::RemoveMachine { .. } => "RemoveMachine",
			RequestBody::TriggerReconcile => "TriggerReconcile",
			RequestBody::GetPeerHealth => "GetPeerHealth",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireApplyResult {
	pub network: String,
	pub supervisor_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRuntimeNode {
	pub phase: String,
	pub required: bool,
	pub healthy: bool,
	pub error: Option<ployz_util::error::PreconditionCode>,
	pub hint: Option<String>,
}

impl From<&ployz_manager::RuntimeNode> for WireRuntimeNode {
	fn from(n: &ployz_manager::RuntimeNode) -> Self {
		Self {
			phase: n.phase.clone(),
			required: n.required,
			healthy: n.healthy,
			error: n.error,
			hint: n.hint.clone(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRuntimeTree {
	pub config: WireRuntimeNode,
	pub network: WireRuntimeNode,
	pub wireguard: WireRuntimeNode,
	pub corrosion: WireRuntimeNode,
	pub docker: WireRuntimeNode,
	pub supervisor: WireRuntimeNode,
	pub clock: WireRuntimeNode,
}

impl From<&ployz_manager::RuntimeTree> for WireRuntimeTree {
	fn from(t: &ployz_manager::RuntimeTree) -> Self {
		Self {
			config: (&t.config).into(),
			network: (&t.network).into(),
			wireguard: (&t.wireguard).into(),
			corrosion: (&t.corrosion).into(),
			docker: (&t.docker).into(),
			supervisor: (&t.supervisor).into(),
			clock: (&t.clock).into(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireNetworkStatus {
	pub network: String,
	pub configured: bool,
	pub supervisor_phase: String,
	pub runtime_tree: WireRuntimeTree,
	pub clock_offset_ms: Option<i64>,
}

impl From<&ployz_manager::NetworkStatus> for WireNetworkStatus {
	fn from(s: &ployz_manager::NetworkStatus) -> Self {
		Self {
			network: s.network.clone(),
			configured: s.configured,
			supervisor_phase: format!("{:?}", s.supervisor_phase).to_lowercase(),
			runtime_tree: (&s.runtime_tree).into(),
			clock_offset_ms: s.clock_health.offset.map(|d| d.num_milliseconds()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireIdentity {
	pub machine_id: MachineId,
	pub management_ip: std::net::Ipv6Addr,
	pub subnet: String,
	pub advertise_endpoint: Option<SocketAddr>,
}

impl From<&ployz_manager::Identity> for WireIdentity {
	fn from(i: &ployz_manager::Identity) -> Self {
		Self {
			machine_id: i.machine_id,
			management_ip: i.management_ip,
			subnet: i.subnet.clone(),
			advertise_endpoint: i.advertise_endpoint,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealthResponse {
	pub node_id: MachineId,
	pub ntp_phase: String,
	pub peer_lag: Vec<(MachineId, Option<u64>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
	Ok,
	ApplyResult(WireApplyResult),
	Status(WireNetworkStatus),
	Identity(WireIdentity),
	Machines(Vec<MachineEntry>),
	PeerHealth(Vec<PeerHealthResponse>),
}

/// One-to-many wrapper (§4.9 "One-to-many response handling", §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wrapped {
	pub machine_addr: String,
	pub machine_id: Option<MachineId>,
	pub error: Option<String>,
	pub body: Option<ResponseBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
	/// The local-only path (§4.9 steps 1-2): a single unwrapped result.
	Single(Result<ResponseBody, WireError>),
	/// The fan-out path (§4.9 step 4): one entry per resolved backend.
	Many(Vec<Wrapped>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
	pub kind: ployz_util::error::ErrorKind,
	pub message: String,
	pub precondition: Option<ployz_util::error::PreconditionFailure>,
}

impl From<&Error> for WireError {
	fn from(e: &Error) -> Self {
		Self {
			kind: e.kind(),
			message: e.to_string(),
			precondition: e.precondition().cloned(),
		}
	}
}

impl From<WireError> for Error {
	fn from(e: WireError) -> Error {
		match e.precondition {
			Some(p) => Error::Precondition(p),
			None => Error::Message(e.message),
		}
	}
}

/// Read one length-prefixed MessagePack frame from `reader`.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
	let mut len_buf = [0u8; 4];
	match reader.read_exact(&mut len_buf).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e),
	}
	let len = u32::from_be_bytes(len_buf);
	if len > MAX_FRAME_LEN {
		return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame exceeds maximum length"));
	}
	let mut body = vec![0u8; len as usize];
	reader.read_exact(&mut body).await?;
	Ok(Some(body))
}

/// Write one length-prefixed MessagePack frame to `writer`.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
	let len = (body.len() as u32).to_be_bytes();
	writer.write_all(&len).await?;
	writer.write_all(body).await?;
	writer.flush().await
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
	Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, Error> {
	Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_round_trips_over_a_duplex_pipe() {
		let (mut a, mut b) = tokio::io::duplex(4096);
		let body = encode(&RequestBody::GetStatus).unwrap();
		write_frame(&mut a, &body).await.unwrap();
		let got = read_frame(&mut b).await.unwrap().unwrap();
		let decoded: RequestBody = decode(&got).unwrap();
		assert!(matches!(decoded, RequestBody::GetStatus));
	}

	#[tokio::test]
	async fn read_frame_returns_none_on_clean_eof() {
		let (a, mut b) = tokio::io::duplex(4096);
		drop(a);
		assert!(read_frame(&mut b).await.unwrap().is_none());
	}

	#[test]
	fn method_name_matches_the_rpc_surface() {
		assert_eq!(RequestBody::GetStatus.method_name(), "GetStatus");
		assert_eq!(RequestBody::TriggerReconcile.method_name(), "TriggerReconcile");
	}
}
