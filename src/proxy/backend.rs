//! Local and remote RPC backends, and the lazily-populated cache of
//! remote connections (§4.9 "Backend cache").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use ployz_manager::Manager;
use ployz_util::error::Error;

use crate::wire::{self, PeerHealthResponse, RequestBody, ResponseBody, WireApplyResult};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(15);
/// 500ms, 1s, 2s, 4s, 8s, 15s(capped) — six attempts before giving up on
/// one dial (§4.9).
const RECONNECT_ATTEMPTS: u32 = 6;

/// One RPC destination, local or remote (§4.9 step 4).
#[async_trait]
pub trait Backend: Send + Sync {
	async fn dispatch(&self, network: &str, body: RequestBody) -> Result<ResponseBody, Error>;
}

/// Dispatches directly into the in-process [`Manager`] (§4.9 steps 1-2).
pub struct LocalBackend {
	manager: Arc<Manager>,
}

impl LocalBackend {
	pub fn new(manager: Arc<Manager>) -> Self {
		Self { manager }
	}
}

#[async_trait]
impl Backend for LocalBackend {
	async fn dispatch(&self, network: &str, body: RequestBody) -> Result<ResponseBody, Error> {
		match body {
			RequestBody::ApplyNetworkSpec(spec) => {
				let result = self.manager.apply_network_spec(spec).await?;
				Ok(ResponseBody::ApplyResult(WireApplyResult {
					network: result.network,
					supervisor_running: result.supervisor_running,
				}))
			}
			RequestBody::DisableNetwork { purge } => {
				self.manager.disable_network(network, purge).await?;
				Ok(ResponseBody::Ok)
			}
			RequestBody::GetStatus => {
				let status = self.manager.get_status(network).await?;
				Ok(ResponseBody::Status((&status).into()))
			}
			RequestBody::GetIdentity => {
				let identity = self.manager.get_identity(network)?;
				Ok(ResponseBody::Identity((&identity).into()))
			}
			RequestBody::ListMachines => {
				let rows = self.manager.list_machines(network).await?;
				Ok(ResponseBody::Machines(rows))
			}
			RequestBody::UpsertMachine { row, expected_version } => {
				self.manager.upsert_machine(network, row, expected_version).await?;
				Ok(ResponseBody::Ok)
			}
			RequestBody::RemoveMachine { id } => {
				self.manager.remove_machine(network, id).await?;
				Ok(ResponseBody::Ok)
			}
			RequestBody::TriggerReconcile => {
				self.manager.trigger_reconcile(network).await?;
				Ok(ResponseBody::Ok)
			}
			RequestBody::GetPeerHealth => {
				let health = self.manager.peer_health(network).await?;
				Ok(ResponseBody::PeerHealth(vec![PeerHealthResponse {
					node_id: health.node_id,
					ntp_phase: format!("{:?}", health.ntp_phase).to_lowercase(),
					peer_lag: health
						.peer_lag
						.into_iter()
						.map(|(id, lag)| (id, lag.map(|d| d.num_milliseconds().max(0) as u64)))
						.collect(),
				}]))
			}
		}
	}
}

/// Dispatches over a TCP connection to another daemon's external socket
/// (§4.9 step 4), serializing concurrent calls through a mutex the way a
/// single persistent connection naturally must.
pub struct RemoteBackend {
	addr: SocketAddr,
	conn: Mutex<Option<(BufReader<tokio::net::tcp::OwnedReadHalf>, BufWriter<tokio::net::tcp::OwnedWriteHalf>)>>,
}

impl RemoteBackend {
	fn new(addr: SocketAddr) -> Self {
		Self {
			addr,
			conn: Mutex::new(None),
		}
	}

	async fn connect(&self) -> Result<(), Error> {
		let stream = dial_with_backoff(self.addr, RECONNECT_ATTEMPTS).await?;
		let (read_half, write_half) = stream.into_split();
		*self.conn.lock().await = Some((BufReader::new(read_half), BufWriter::new(write_half)));
		Ok(())
	}
}

#[async_trait]
impl Backend for RemoteBackend {
	async fn dispatch(&self, network: &str, body: RequestBody) -> Result<ResponseBody, Error> {
		let envelope = wire::RequestEnvelope {
			network: network.to_string(),
			machines: None,
			proxy_authority: true,
			body,
		};
		let encoded = wire::encode(&envelope)?;

		let mut guard = self.conn.lock().await;
		if guard.is_none() {
			drop(guard);
			self.connect().await?;
			guard = self.conn.lock().await;
		}
		let (reader, writer) = guard
			.as_mut()
			.ok_or_else(|| Error::Internal("remote backend connection missing after connect".into()))?;

		if wire::write_frame(writer, &encoded).await.is_err() {
			*guard = None;
			return Err(Error::Unavailable(format!("connection to {} dropped mid-write", self.addr)));
		}
		let frame = match wire::read_frame(reader).await {
			Ok(Some(f)) => f,
			Ok(None) | Err(_) => {
				*guard = None;
				return Err(Error::Unavailable(format!("connection to {} dropped mid-read", self.addr)));
			}
		};
		drop(guard);

		let reply: wire::Reply = wire::decode(&frame)?;
		match reply {
			wire::Reply::Single(Ok(body)) => Ok(body),
			wire::Reply::Single(Err(e)) => Err(e.into()),
			wire::Reply::Many(_) => Err(Error::Internal("proxy-authority request unexpectedly fanned out remotely".into())),
		}
	}
}

/// Remote backends keyed by dial address, created lazily and shared
/// across calls (§4.9 "Backend cache"); reconnection backs off
/// exponentially, capped at 15s.
pub struct BackendCache {
	remotes: Mutex<HashMap<SocketAddr, Arc<RemoteBackend>>>,
}

impl BackendCache {
	pub fn new() -> Self {
		Self {
			remotes: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the cached backend for `addr`, or a new one. Does not dial
	/// eagerly: the first `dispatch` call connects, and a future
	/// `dispatch` after a dropped connection retries with backoff.
	pub async fn get_or_create(&self, addr: SocketAddr) -> Arc<RemoteBackend> {
		let mut remotes = self.remotes.lock().await;
		remotes
			.entry(addr)
			.or_insert_with(|| Arc::new(RemoteBackend::new(addr)))
			.clone()
	}

	/// `FlushRemoteBackends` (§4.9): drop every cached connection.
	pub async fn flush(&self) {
		self.remotes.lock().await.clear();
	}
}

impl Default for BackendCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Dials `addr`, retrying with exponential backoff starting at 500ms and
/// capped at 15s (§4.9), until `attempts` is exhausted.
pub async fn dial_with_backoff(addr: SocketAddr, attempts: u32) -> Result<TcpStream, Error> {
	let mut delay = RECONNECT_INITIAL_DELAY;
	let mut last_err = None;
	for attempt in 0..attempts.max(1) {
		match TcpStream::connect(addr).await {
			Ok(stream) => return Ok(stream),
			Err(e) => {
				last_err = Some(e);
				if attempt + 1 < attempts {
					tokio::time::sleep(delay).await;
					delay = std::cmp::min(delay * 2, RECONNECT_MAX_DELAY);
				}
			}
		}
	}
	Err(Error::Unavailable(format!(
		"unable to dial {} after {} attempts: {}",
		addr,
		attempts,
		last_err.map(|e| e.to_string()).unwrap_or_default()
	)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn get_or_create_returns_the_same_backend_for_an_address() {
		let cache = BackendCache::new();
		let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
		let a = cache.get_or_create(addr).await;
		let b = cache.get_or_create(addr).await;
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[tokio::test]
	async fn flush_drops_cached_backends() {
		let cache = BackendCache::new();
		let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
		let a = cache.get_or_create(addr).await;
		cache.flush().await;
		let b = cache.get_or_create(addr).await;
		assert!(!Arc::ptr_eq(&a, &b));
	}

	#[tokio::test]
	async fn dial_with_backoff_surfaces_unavailable_after_exhausting_attempts() {
		let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
		let err = dial_with_backoff(addr, 2).await.unwrap_err();
		assert_eq!(err.kind(), ployz_util::error::ErrorKind::Unavailable);
	}
}
