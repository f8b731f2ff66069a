//! CLI subcommands and their dispatch against a connected [`super::Client`]
//! (§6 "RPC surface").

use std::path::PathBuf;

use structopt::StructOpt;

use format_table::format_table;
use ployz_proxy::wire::{Reply, RequestBody, ResponseBody, WireError};
use ployz_util::error::Error;
use ployz_util::id::MachineId;
use ployz_util::model::{MachineEntry, NetworkSpec};

use super::Client;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Apply (create or update) a network's spec from a YAML file.
	Apply {
		#[structopt(long)]
		spec_file: PathBuf,
	},
	/// Stop and unconfigure a network.
	Disable {
		#[structopt(long)]
		purge: bool,
	},
	/// Show the runtime status tree for a network.
	Status,
	/// Show this machine's identity within the network.
	Identity,
	/// List known machines in the network's membership registry.
	Machines,
	/// Insert or update one machine's registry row.
	UpsertMachine {
		#[structopt(long)]
		machine_file: PathBuf,
		#[structopt(long, default_value = "0")]
		expected_version: i64,
	},
	/// Remove a machine from the registry by id.
	RemoveMachine {
		#[structopt(long)]
		id: String,
	},
	/// Force an immediate reconcile pass instead of waiting for the next
	/// scheduled one.
	Reconcile,
	/// Show NTP and peer-freshness health for this machine.
	PeerHealth,
}

pub async fn dispatch(cmd: Command, network: &str, client: &mut Client) -> Result<(), Error> {
	match cmd {
		Command::Apply { spec_file } => {
			let raw = std::fs::read_to_string(&spec_file)?;
			let spec: NetworkSpec = serde_yaml::from_str(&raw)?;
			let reply = client.call(network, RequestBody::ApplyNetworkSpec(spec)).await?;
			match single(reply)? {
				ResponseBody::ApplyResult(r) => {
					println!("network {} applied, supervisor running: {}", r.network, r.supervisor_running);
					Ok(())
				}
				other => unexpected(other),
			}
		}
		Command::Disable { purge } => {
			let reply = client.call(network, RequestBody::DisableNetwork { purge }).await?;
			single(reply)?;
			println!("network {} disabled", network);
			Ok(())
		}
		Command::Status => {
			let reply = client.call(network, RequestBody::GetStatus).await?;
			match single(reply)? {
				ResponseBody::Status(s) => {
					println!("network: {}", s.network);
					println!("configured: {}", s.configured);
					println!("supervisor phase: {}", s.supervisor_phase);
					let mut rows = vec!["COMPONENT\tHEALTHY\tPHASE".to_string()];
					for (name, node) in [
						("config", &s.runtime_tree.config),
						("network", &s.runtime_tree.network),
						("wireguard", &s.runtime_tree.wireguard),
						("corrosion", &s.runtime_tree.corrosion),
						("docker", &s.runtime_tree.docker),
						("supervisor", &s.runtime_tree.supervisor),
						("clock", &s.runtime_tree.clock),
					] {
						rows.push(format!("{}\t{}\t{}", name, node.healthy, node.phase));
					}
					format_table(rows);
					Ok(())
				}
				other => unexpected(other),
			}
		}
		Command::Identity => {
			let reply = client.call(network, RequestBody::GetIdentity).await?;
			match single(reply)? {
				ResponseBody::Identity(id) => {
					println!("machine id: {}", id.machine_id);
					println!("management ip: {}", id.management_ip);
					println!("subnet: {}", id.subnet);
					if let Some(endpoint) = id.advertise_endpoint {
						println!("advertise endpoint: {}", endpoint);
					}
					Ok(())
				}
				other => unexpected(other),
			}
		}
		Command::Machines => {
			let reply = client.call(network, RequestBody::ListMachines).await?;
			match single(reply)? {
				ResponseBody::Machines(rows) => {
					let mut table = vec!["ID\tSUBNET\tMANAGEMENT IP\tVERSION".to_string()];
					for row in rows {
						table.push(format!("{}\t{}\t{}\t{}", row.id, row.subnet, row.management_ip, row.version));
					}
					format_table(table);
					Ok(())
				}
				other => unexpected(other),
			}
		}
		Command::UpsertMachine { machine_file, expected_version } => {
			let raw = std::fs::read_to_string(&machine_file)?;
			let row: MachineEntry = serde_yaml::from_str(&raw)?;
			let reply = client
				.call(network, RequestBody::UpsertMachine { row, expected_version })
				.await?;
			single(reply)?;
			println!("machine upserted");
			Ok(())
		}
		Command::RemoveMachine { id } => {
			let id = id.parse::<MachineId>()?;
			let reply = client.call(network, RequestBody::RemoveMachine { id }).await?;
			single(reply)?;
			println!("machine {} removed", id);
			Ok(())
		}
		Command::Reconcile => {
			let reply = client.call(network, RequestBody::TriggerReconcile).await?;
			single(reply)?;
			println!("reconcile triggered");
			Ok(())
		}
		Command::PeerHealth => {
			let reply = client.call(network, RequestBody::GetPeerHealth).await?;
			match single(reply)? {
				ResponseBody::PeerHealth(entries) => {
					let mut table = vec!["NODE\tNTP PHASE\tPEER\tLAG (ms)".to_string()];
					for entry in entries {
						if entry.peer_lag.is_empty() {
							table.push(format!("{}\t{}\t-\t-", entry.node_id, entry.ntp_phase));
						}
						for (peer, lag) in entry.peer_lag {
							table.push(format!(
								"{}\t{}\t{}\t{}",
								entry.node_id,
								entry.ntp_phase,
								peer,
								lag.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string())
							));
						}
					}
					format_table(table);
					Ok(())
				}
				other => unexpected(other),
			}
		}
	}
}

fn single(reply: Reply) -> Result<ResponseBody, Error> {
	match reply {
		Reply::Single(result) => result.map_err(|e: WireError| e.into()),
		Reply::Many(_) => Err(Error::Internal("expected a single reply for a one-to-one call".into())),
	}
}

fn unexpected(body: ResponseBody) -> Result<(), Error> {
	Err(Error::Internal(format!("unexpected response shape: {:?}", body)))
}
