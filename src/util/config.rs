//! Per-user CLI configuration file (§6): a YAML mapping of cluster name to
//! connection parameters, with `current_cluster` selecting the default and
//! `PLOYZ_CLUSTER` overriding it, plus migration of the legacy single-socket
//! JSON format. Modeled after `garage_util::config`'s `read_config`, with
//! `toml` swapped for `serde_yaml` per §6.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, OkOrMessage};

pub const CLUSTER_ENV_VAR: &str = "PLOYZ_CLUSTER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
	#[serde(default)]
	pub current_cluster: Option<String>,
	#[serde(default)]
	pub clusters: BTreeMap<String, ClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
	pub network: String,
	pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
	#[serde(flatten)]
	pub target: ConnectionTarget,
	#[serde(default)]
	pub ssh_key_file: Option<PathBuf>,
	#[serde(default)]
	pub data_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionTarget {
	Unix { unix: PathBuf },
	Ssh { ssh: String },
	Tcp { tcp: SocketAddr },
}

/// The legacy single-cluster JSON format this system migrates away from.
#[derive(Debug, Clone, Deserialize)]
struct LegacyJsonConfig {
	socket: PathBuf,
}

impl CliConfig {
	/// Read the config file at `path`, transparently migrating a legacy
	/// JSON config (renaming it to `.bak`) the first time it is read.
	pub fn read(path: &Path) -> Result<CliConfig, Error> {
		if !path.exists() {
			return Ok(CliConfig {
				current_cluster: None,
				clusters: BTreeMap::new(),
			});
		}
		let raw = std::fs::read_to_string(path)?;

		match serde_yaml::from_str::<CliConfig>(&raw) {
			Ok(cfg) => Ok(cfg),
			Err(yaml_err) => match serde_json::from_str::<LegacyJsonConfig>(&raw) {
				Ok(legacy) => {
					info!(
						"Migrating legacy JSON config at {} to the YAML cluster format",
						path.display()
					);
					let migrated = migrate_legacy(legacy);
					let backup = path.with_extension("bak");
					std::fs::rename(path, &backup)?;
					migrated.write(path)?;
					Ok(migrated)
				}
				Err(_) => Err(Error::InvalidArgument(format!(
					"unable to parse config file {} as YAML ({}) or as a legacy JSON config",
					path.display(),
					yaml_err
				))),
			},
		}
	}

	pub fn write(&self, path: &Path) -> Result<(), Error> {
		let yaml = serde_yaml::to_string(self)?;
		std::fs::write(path, yaml)?;
		Ok(())
	}

	/// Resolve the cluster to use: `PLOYZ_CLUSTER` env var wins, otherwise
	/// `current_cluster`, otherwise an error (§6).
	pub fn resolve_cluster<'a>(&'a self, env_override: Option<&str>) -> Result<(&'a str, &'a ClusterConfig), Error> {
		let name = env_override
			.map(|s| s.to_string())
			.or_else(|| self.current_cluster.clone())
			.ok_or_message("no cluster selected: set current_cluster in the config file or the PLOYZ_CLUSTER environment variable")?;
		let (key, cfg) = self
			.clusters
			.get_key_value(name.as_str())
			.ok_or_message(format!("unknown cluster {:?}", name))?;
		Ok((key.as_str(), cfg))
	}
}

fn migrate_legacy(legacy: LegacyJsonConfig) -> CliConfig {
	let mut clusters = BTreeMap::new();
	clusters.insert(
		"default".to_string(),
		ClusterConfig {
			network: "default".to_string(),
			connections: vec![Connection {
				target: ConnectionTarget::Unix { unix: legacy.socket },
				ssh_key_file: None,
				data_root: None,
			}],
		},
	);
	CliConfig {
		current_cluster: Some("default".to_string()),
		clusters,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_yields_empty_config() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let path = dir.join("ployz.yaml");
		let cfg = CliConfig::read(&path).unwrap();
		assert!(cfg.clusters.is_empty());
	}

	#[test]
	fn round_trips_yaml() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let path = dir.join("ployz.yaml");
		let mut clusters = BTreeMap::new();
		clusters.insert(
			"prod".to_string(),
			ClusterConfig {
				network: "prod".to_string(),
				connections: vec![Connection {
					target: ConnectionTarget::Tcp {
						tcp: "10.0.0.1:7946".parse().unwrap(),
					},
					ssh_key_file: None,
					data_root: None,
				}],
			},
		);
		let cfg = CliConfig {
			current_cluster: Some("prod".to_string()),
			clusters,
		};
		cfg.write(&path).unwrap();

		let read_back = CliConfig::read(&path).unwrap();
		let (name, cluster) = read_back.resolve_cluster(None).unwrap();
		assert_eq!(name, "prod");
		assert_eq!(cluster.network, "prod");
	}

	#[test]
	fn env_override_wins_over_current_cluster() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let path = dir.join("ployz.yaml");
		let mut clusters = BTreeMap::new();
		clusters.insert(
			"a".to_string(),
			ClusterConfig {
				network: "a".to_string(),
				connections: vec![],
			},
		);
		clusters.insert(
			"b".to_string(),
			ClusterConfig {
				network: "b".to_string(),
				connections: vec![],
			},
		);
		let cfg = CliConfig {
			current_cluster: Some("a".to_string()),
			clusters,
		};
		cfg.write(&path).unwrap();

		let read_back = CliConfig::read(&path).unwrap();
		let (name, _) = read_back.resolve_cluster(Some("b")).unwrap();
		assert_eq!(name, "b");
	}

	#[test]
	fn migrates_legacy_json_and_backs_it_up() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let path = dir.join("ployz.yaml");
		std::fs::write(&path, r#"{"socket": "/tmp/ployzd.sock"}"#).unwrap();

		let cfg = CliConfig::read(&path).unwrap();
		let (name, cluster) = cfg.resolve_cluster(None).unwrap();
		assert_eq!(name, "default");
		match &cluster.connections[0].target {
			ConnectionTarget::Unix { unix } => assert_eq!(unix, Path::new("/tmp/ployzd.sock")),
			other => panic!("expected unix connection, got {:?}", other),
		}
		assert!(path.with_extension("bak").exists());
	}
}
