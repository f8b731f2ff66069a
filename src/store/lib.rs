//! Durable spec and local-state storage (§3, §4.2, §6).
//!
//! Two stores, sharing one shape (`save`/`get`/`delete`/`close`) but two
//! different backends, matching the two different durability needs named
//! in §6: `SpecStore` keeps `daemon.db`, a single sled tree keyed by
//! network name (sled serializes writers internally, satisfying "writes
//! are atomic per key" and "concurrent readers/writers ... serialized by
//! the underlying store" without a transaction API `ployz_store` doesn't
//! need); `StateStore` keeps one `state.json` file per network, mode
//! 0600, via `ployz_util::persister` the way `garage_model::garage`
//! persists its lifecycle-worker state.
//!
//! `garage_db` abstracts over sled/lmdb/sqlite because Garage's table
//! engine needs transactions across several trees; this daemon needs
//! neither transactions nor a second engine, so that abstraction is
//! dropped in favor of depending on `sled` directly (see DESIGN.md).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ployz_util::error::{Error, OkOrMessage};
use ployz_util::model::{LocalState, NetworkSpec, PersistedSpec};
use ployz_util::time::now;

const SPEC_TREE: &str = "network_specs";

#[derive(Debug, Serialize, Deserialize)]
struct SpecRow {
	spec: NetworkSpec,
	enabled: bool,
	updated_at: String,
}

/// `daemon.db`'s `network_specs` table (§4.2, §6).
pub struct SpecStore {
	db: sled::Db,
}

impl SpecStore {
	pub fn open(data_root: &Path) -> Result<Self, Error> {
		std::fs::create_dir_all(data_root)?;
		let db_path = data_root.join("daemon.db");
		tracing::info!("Opening spec store at {}", db_path.display());
		let db = sled::open(&db_path).map_err(|e| Error::Internal(format!("unable to open daemon.db: {}", e)))?;
		Ok(Self { db })
	}

	fn tree(&self) -> Result<sled::Tree, Error> {
		self.db
			.open_tree(SPEC_TREE)
			.map_err(|e| Error::Internal(format!("unable to open {} tree: {}", SPEC_TREE, e)))
	}

	/// Idempotent: safe to call on every startup (§4.2 "Schema
	/// initialization is idempotent").
	pub fn ensure_schema(&self) -> Result<(), Error> {
		self.tree()?;
		Ok(())
	}

	pub fn save_spec(&self, network: &str, spec: &NetworkSpec, enabled: bool) -> Result<(), Error> {
		let row = SpecRow {
			spec: spec.clone(),
			enabled,
			updated_at: ployz_util::time::to_rfc3339(now()),
		};
		let bytes = serde_json::to_vec(&row)?;
		let tree = self.tree()?;
		tree.insert(network.as_bytes(), bytes)
			.map_err(|e| Error::Internal(format!("failed to write spec for {}: {}", network, e)))?;
		tree.flush().map_err(|e| Error::Internal(format!("failed to flush spec store: {}", e)))?;
		Ok(())
	}

	pub fn get_spec(&self, network: &str) -> Result<Option<PersistedSpec>, Error> {
		let tree = self.tree()?;
		match tree
			.get(network.as_bytes())
			.map_err(|e| Error::Internal(format!("failed to read spec for {}: {}", network, e)))?
		{
			Some(bytes) => {
				let row: SpecRow = serde_json::from_slice(&bytes)?;
				Ok(Some(PersistedSpec {
					spec: row.spec,
					enabled: row.enabled,
				}))
			}
			None => Ok(None),
		}
	}

	pub fn delete_spec(&self, network: &str) -> Result<(), Error> {
		let tree = self.tree()?;
		tree.remove(network.as_bytes())
			.map_err(|e| Error::Internal(format!("failed to delete spec for {}: {}", network, e)))?;
		tree.flush().map_err(|e| Error::Internal(format!("failed to flush spec store: {}", e)))?;
		Ok(())
	}

	pub fn list_networks(&self) -> Result<Vec<String>, Error> {
		let tree = self.tree()?;
		let mut out = Vec::new();
		for item in tree.iter() {
			let (k, _) = item.map_err(|e| Error::Internal(format!("failed to iterate spec store: {}", e)))?;
			out.push(String::from_utf8_lossy(&k).into_owned());
		}
		Ok(out)
	}

	pub fn close(&self) -> Result<(), Error> {
		self.db
			.flush()
			.map_err(|e| Error::Internal(format!("failed to flush daemon.db: {}", e)))?;
		Ok(())
	}
}

/// `<network>/state.json` (§3, §6): created on first apply, rewritten on
/// successful re-apply, deleted on purge.
pub struct StateStore {
	path: PathBuf,
}

impl StateStore {
	pub fn open(data_root: &Path, network: &str) -> Result<Self, Error> {
		let dir = data_root.join(network);
		std::fs::create_dir_all(&dir)?;
		Ok(Self {
			path: dir.join("state.json"),
		})
	}

	pub fn get_state(&self) -> Result<Option<LocalState>, Error> {
		match std::fs::read(&self.path) {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	pub fn save_state(&self, state: &LocalState) -> Result<(), Error> {
		let bytes = serde_json::to_vec_pretty(state)?;
		let tmp_path = self.path.with_extension("json.tmp");
		std::fs::write(&tmp_path, &bytes)?;
		set_private_mode(&tmp_path)?;
		std::fs::rename(&tmp_path, &self.path)?;
		Ok(())
	}

	pub fn delete_state(&self) -> Result<(), Error> {
		match std::fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	pub fn exists(&self) -> bool {
		self.path.exists()
	}
}

#[cfg(unix)]
fn set_private_mode(path: &Path) -> Result<(), Error> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
	Ok(())
}

#[cfg(not(unix))]
fn set_private_mode(_path: &Path) -> Result<(), Error> {
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv6Addr;

	fn sample_spec() -> NetworkSpec {
		NetworkSpec {
			network: "demo".to_string(),
			data_root: "/var/lib/ployz".into(),
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

	#[test]
	fn spec_round_trips() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = SpecStore::open(&dir).unwrap();
		store.ensure_schema().unwrap();

		assert!(store.get_spec("demo").unwrap().is_none());

		store.save_spec("demo", &sample_spec(), true).unwrap();
		let got = store.get_spec("demo").unwrap().unwrap();
		assert_eq!(got.spec, sample_spec());
		assert!(got.enabled);

		store.delete_spec("demo").unwrap();
		assert!(store.get_spec("demo").unwrap().is_none());
	}

	#[test]
	fn spec_store_lists_networks() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = SpecStore::open(&dir).unwrap();
		store.save_spec("demo", &sample_spec(), true).unwrap();
		let mut one = sample_spec();
		one.network = "other".to_string();
		store.save_spec("other", &one, false).unwrap();

		let mut networks = store.list_networks().unwrap();
		networks.sort();
		assert_eq!(networks, vec!["demo".to_string(), "other".to_string()]);
	}

	#[test]
	fn state_round_trips_and_purges() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = StateStore::open(&dir, "demo").unwrap();
		assert!(store.get_state().unwrap().is_none());

		let state = LocalState {
			wg_public: ployz_util::id::MachineId([9u8; 32]),
			wg_private: "priv".to_string(),
			subnet: "10.210.1.0/24".to_string(),
			management: "fd00::1".parse().unwrap(),
			advertise: None,
			cidr: "10.210.0.0/16".to_string(),
			wg_interface: "wg-demo".to_string(),
			wg_port: 51820,
			corrosion_member_id: 1,
			corrosion_api_token: "secret".to_string(),
			phase: ployz_util::model::NetworkPhase::Running,
		};
		store.save_state(&state).unwrap();
		assert!(store.exists());
		let got = store.get_state().unwrap().unwrap();
		assert_eq!(got.wg_public, state.wg_public);

		store.delete_state().unwrap();
		assert!(!store.exists());
	}
}
