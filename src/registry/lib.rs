//! Client for the gossip-replicated peer registry (§4.3, C3).
//!
//! The registry itself — storage, replication, conflict resolution — is
//! an external Corrosion process reachable over HTTP; this crate only
//! speaks its client contract, the way `garage_rpc`'s consul-discovery
//! feature speaks Consul's HTTP API rather than reimplementing Consul.
//! [`HttpRegistry`] is the production implementation; [`FakeRegistry`]
//! backs unit tests for every crate that depends on [`RegistryClient`]
//! without a Corrosion process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::MachineEntry;

/// A single change delivered by [`RegistryClient::subscribe_machines`]
/// (§4.3). Delivery is at-least-once: consumers must treat `Added` and
/// `Updated` as idempotent upserts, keyed on `id`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
	Added(MachineEntry),
	Updated(MachineEntry),
	Deleted(MachineId),
	/// The subscriber must discard its working set and re-read
	/// `list_machines` before applying any further event.
	Resync,
}

/// The live half of a `subscribe_machines` result: a channel of
/// [`ChangeEvent`]s that ends when the underlying connection is lost.
/// Per §4.3, ending is not an error the caller handles inline — the
/// caller (`ployz_supervisor`) re-subscribes with bounded retry.
pub struct ChangeStream {
	rx: tokio::sync::mpsc::Receiver<ChangeEvent>,
}

impl ChangeStream {
	pub fn new(rx: tokio::sync::mpsc::Receiver<ChangeEvent>) -> Self {
		Self { rx }
	}

	/// Await the next event, or `None` if the stream has ended.
	pub async fn next(&mut self) -> Option<ChangeEvent> {
		self.rx.recv().await
	}
}

/// The registry's client contract (§4.3). Implementors must make every
/// call respect the given cancellation: no call may block indefinitely
/// once `cancel` resolves.
#[async_trait]
pub trait RegistryClient: Send + Sync {
	async fn ensure_machine_table(&self, network: &str) -> Result<(), Error>;

	/// Returns `Conflict` iff `expected_version` does not match the
	/// currently stored version for `row.id` (§4.3). On success the
	/// stored version becomes `expected_version + 1`.
	async fn upsert_machine(
		&self,
		network: &str,
		row: &MachineEntry,
		expected_version: i64,
	) -> Result<(), Error>;

	async fn list_machines(&self, network: &str) -> Result<Vec<MachineEntry>, Error>;

	/// Returns the current snapshot plus a live [`ChangeStream`] of
	/// subsequent changes (§4.3).
	async fn subscribe_machines(
		&self,
		network: &str,
	) -> Result<(Vec<MachineEntry>, ChangeStream), Error>;

	/// Removes a machine row, delivered to other subscribers as
	/// [`ChangeEvent::Deleted`] (§6 `RemoveMachine`).
	async fn remove_machine(&self, network: &str, id: MachineId) -> Result<(), Error>;
}

/// HTTP-backed implementation against a Corrosion-compatible API,
/// authenticated with the network's `corrosion_api_token` (§3, §6). The
/// shape mirrors `garage_rpc::consul::ConsulDiscovery`: a `reqwest`
/// client plus a base URL, one request per call, errors folded into
/// [`Error::Unavailable`] when the transport itself fails.
pub struct HttpRegistry {
	client: reqwest::Client,
	base_url: String,
	api_token: String,
	poll_interval: Duration,
}

impl HttpRegistry {
	pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into(),
			api_token: api_token.into(),
			poll_interval: Duration::from_secs(2),
		}
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	fn table_url(&self, network: &str) -> String {
		format!("{}/v1/networks/{}/machines", self.base_url, network)
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.bearer_auth(&self.api_token)
	}
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
	row: &'a MachineEntry,
	expected_version: i64,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
	events: Vec<WireChangeEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireChangeEvent {
	Added { row: MachineEntry },
	Updated { row: MachineEntry },
	Deleted { id: MachineId },
	Resync,
}

impl From<WireChangeEvent> for ChangeEvent {
	fn from(e: WireChangeEvent) -> ChangeEvent {
		match e {
			WireChangeEvent::Added { row } => ChangeEvent::Added(row),
			WireChangeEvent::Updated { row } => ChangeEvent::Updated(row),
			WireChangeEvent::Deleted { id } => ChangeEvent::Deleted(id),
			WireChangeEvent::Resync => ChangeEvent::Resync,
		}
	}
}

#[async_trait]
impl RegistryClient for HttpRegistry {
	async fn ensure_machine_table(&self, network: &str) -> Result<(), Error> {
		let resp = self
			.authed(self.client.put(self.table_url(network)))
			.send()
			.await
			.map_err(|e| Error::Unavailable(format!("registry unreachable: {}", e)))?;
		check_status(resp).await?;
		Ok(())
	}

	async fn upsert_machine(
		&self,
		network: &str,
		row: &MachineEntry,
		expected_version: i64,
	) -> Result<(), Error> {
		let resp = self
			.authed(self.client.post(self.table_url(network)))
			.json(&UpsertRequest { row, expected_version })
			.send()
			.await
			.map_err(|e| Error::Unavailable(format!("registry unreachable: {}", e)))?;
		if resp.status() == reqwest::StatusCode::CONFLICT {
			return Err(Error::Conflict(format!(
				"machine {} version changed concurrently",
				row.id
			)));
		}
		check_status(resp).await?;
		Ok(())
	}

	async fn list_machines(&self, network: &str) -> Result<Vec<MachineEntry>, Error> {
		let resp = self
			.authed(self.client.get(self.table_url(network)))
			.send()
			.await
			.map_err(|e| Error::Unavailable(format!("registry unreachable: {}", e)))?;
		let resp = check_status(resp).await?;
		resp.json::<Vec<MachineEntry>>()
			.await
			.map_err(|e| Error::Internal(format!("malformed registry response: {}", e)))
	}

	async fn subscribe_machines(
		&self,
		network: &str,
	) -> Result<(Vec<MachineEntry>, ChangeStream), Error> {
		let snapshot = self.list_machines(network).await?;

		let (tx, rx) = tokio::sync::mpsc::channel(64);
		let client = self.client.clone();
		let watch_url = format!("{}/watch", self.table_url(network));
		let token = self.api_token.clone();
		let interval = self.poll_interval;

		tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				let resp = match client.get(&watch_url).bearer_auth(&token).send().await {
					Ok(r) => r,
					Err(e) => {
						tracing::warn!("registry watch request failed: {}", e);
						continue;
					}
				};
				let body: WatchResponse = match resp.json().await {
					Ok(b) => b,
					Err(e) => {
						tracing::warn!("registry watch response malformed: {}", e);
						continue;
					}
				};
				for event in body.events {
					if tx.send(event.into()).await.is_err() {
						return;
					}
				}
			}
		});

		Ok((snapshot, ChangeStream::new(rx)))
	}

	async fn remove_machine(&self, network: &str, id: MachineId) -> Result<(), Error> {
		let resp = self
			.authed(self.client.delete(format!("{}/{}", self.table_url(network), id)))
			.send()
			.await
			.map_err(|e| Error::Unavailable(format!("registry unreachable: {}", e)))?;
		check_status(resp).await?;
		Ok(())
	}
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
	if resp.status().is_success() {
		Ok(resp)
	} else {
		let status = resp.status();
		let body = resp.text().await.unwrap_or_default();
		Err(Error::Unavailable(format!(
			"registry returned {}: {}",
			status, body
		)))
	}
}

/// In-memory [`RegistryClient`] for tests: per-network table of rows
/// keyed by id, optimistic-concurrency checked the same way
/// [`HttpRegistry`] is, with subscribers fed from a broadcast of every
/// accepted write.
pub struct FakeRegistry {
	tables: Mutex<HashMap<String, HashMap<MachineId, MachineEntry>>>,
	subscribers: Mutex<Vec<(String, tokio::sync::mpsc::Sender<ChangeEvent>)>>,
}

impl FakeRegistry {
	pub fn new() -> Self {
		Self {
			tables: Mutex::new(HashMap::new()),
			subscribers: Mutex::new(Vec::new()),
		}
	}

	fn broadcast(&self, network: &str, event: ChangeEvent) {
		let mut subs = self.subscribers.lock().unwrap();
		subs.retain(|(net, tx)| net != network || tx.try_send(event.clone()).is_ok());
	}
}

impl Default for FakeRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl RegistryClient for FakeRegistry {
	async fn ensure_machine_table(&self, network: &str) -> Result<(), Error> {
		self.tables
			.lock()
			.unwrap()
			.entry(network.to_string())
			.or_default();
		Ok(())
	}

	async fn upsert_machine(
		&self,
		network: &str,
		row: &MachineEntry,
		expected_version: i64,
	) -> Result<(), Error> {
		let mut tables = self.tables.lock().unwrap();
		let table = tables.entry(network.to_string()).or_default();
		let stored_version = table.get(&row.id).map(|r| r.version).unwrap_or(0);
		if stored_version != expected_version {
			return Err(Error::Conflict(format!(
				"machine {} version changed concurrently",
				row.id
			)));
		}
		let mut stored = row.clone();
		stored.version = expected_version + 1;
		let is_new = !table.contains_key(&row.id);
		table.insert(row.id, stored.clone());
		drop(tables);
		self.broadcast(
			network,
			if is_new {
				ChangeEvent::Added(stored)
			} else {
				ChangeEvent::Updated(stored)
			},
		);
		Ok(())
	}

	async fn list_machines(&self, network: &str) -> Result<Vec<MachineEntry>, Error> {
		let tables = self.tables.lock().unwrap();
		Ok(tables
			.get(network)
			.map(|t| t.values().cloned().collect())
			.unwrap_or_default())
	}

	async fn subscribe_machines(
		&self,
		network: &str,
	) -> Result<(Vec<MachineEntry>, ChangeStream), Error> {
		let snapshot = self.list_machines(network).await?;
		let (tx, rx) = tokio::sync::mpsc::channel(64);
		self.subscribers.lock().unwrap().push((network.to_string(), tx));
		Ok((snapshot, ChangeStream::new(rx)))
	}

	/// Remove a machine directly, bypassing the upsert/version path, and
	/// notify subscribers.
	async fn remove_machine(&self, network: &str, id: MachineId) -> Result<(), Error> {
		let removed = self
			.tables
			.lock()
			.unwrap()
			.get_mut(network)
			.map(|t| t.remove(&id).is_some())
			.unwrap_or(false);
		if removed {
			self.broadcast(network, ChangeEvent::Deleted(id));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

	fn sample_row(id: u8) -> MachineEntry {
		MachineEntry {
			id: MachineId([id; 32]),
			public_key: MachineId([id; 32]),
			subnet: format!("10.210.{}.0/24", id),
			management_ip: format!("fd00::{}", id).parse().unwrap(),
			endpoint: None,
			last_updated: Utc::now(),
			version: 0,
		}
	}

	#[tokio::test]
	async fn upsert_then_list_round_trips() {
		let reg = FakeRegistry::new();
		reg.ensure_machine_table("demo").await.unwrap();
		reg.upsert_machine("demo", &sample_row(1), 0).await.unwrap();

		let rows = reg.list_machines("demo").await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].version, 1);
	}

	#[tokio::test]
	async fn upsert_with_stale_expected_version_conflicts() {
		let reg = FakeRegistry::new();
		reg.upsert_machine("demo", &sample_row(1), 0).await.unwrap();

		let err = reg.upsert_machine("demo", &sample_row(1), 0).await.unwrap_err();
		assert_eq!(err.kind(), ployz_util::error::ErrorKind::Conflict);
	}

	#[tokio::test]
	async fn subscribe_delivers_snapshot_then_changes() {
		let reg = FakeRegistry::new();
		reg.upsert_machine("demo", &sample_row(1), 0).await.unwrap();

		let (snapshot, mut stream) = reg.subscribe_machines("demo").await.unwrap();
		assert_eq!(snapshot.len(), 1);

		reg.upsert_machine("demo", &sample_row(2), 0).await.unwrap();
		match stream.next().await.unwrap() {
			ChangeEvent::Added(row) => assert_eq!(row.id, MachineId([2u8; 32])),
			other => panic!("expected Added, got {:?}", other),
		}

		reg.remove_machine("demo", MachineId([1u8; 32])).await.unwrap();
		match stream.next().await.unwrap() {
			ChangeEvent::Deleted(id) => assert_eq!(id, MachineId([1u8; 32])),
			other => panic!("expected Deleted, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn different_networks_are_isolated() {
		let reg = FakeRegistry::new();
		reg.upsert_machine("a", &sample_row(1), 0).await.unwrap();
		reg.upsert_machine("b", &sample_row(2), 0).await.unwrap();

		assert_eq!(reg.list_machines("a").await.unwrap().len(), 1);
		assert_eq!(reg.list_machines("b").await.unwrap().len(), 1);
	}
}
