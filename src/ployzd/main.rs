//! `ployzd`: the WireGuard overlay control-plane daemon and its CLI client.

mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;

use ployz_controller::platform::{production_container_runtime, production_platform_ops, ProcessCorrosionRuntime};
use ployz_manager::Manager;
use ployz_proxy::ProxyServer;
use ployz_reconcile::WireguardControlDriver;
use ployz_registry::HttpRegistry;
use ployz_util::config::CliConfig;
use ployz_util::error::Error;

use cli::cmd::Command;

#[derive(StructOpt, Debug)]
#[structopt(name = "ployzd", about = "WireGuard overlay control plane")]
struct Opt {
	/// Path to the per-user cluster config file.
	#[structopt(long, env = "PLOYZ_CONFIG", default_value = "~/.config/ployz/config.yaml")]
	config_file: PathBuf,

	/// Cluster to operate on, overriding `current_cluster` in the config
	/// file (§6).
	#[structopt(long, env = "PLOYZ_CLUSTER")]
	cluster: Option<String>,

	#[structopt(subcommand)]
	cmd: TopCommand,
}

#[derive(StructOpt, Debug)]
enum TopCommand {
	/// Run the daemon: bind sockets, restore persisted networks, serve
	/// RPCs forever.
	Server {
		#[structopt(long, env = "PLOYZ_DATA_ROOT", default_value = "/var/lib/ployz")]
		data_root: PathBuf,
		#[structopt(long, env = "PLOYZ_SOCKET")]
		socket: Option<PathBuf>,
		#[structopt(long, default_value = "corrosion")]
		corrosion_binary: String,
	},
	#[structopt(flatten)]
	Client(Command),
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "ployzd=info,ployz_manager=info,ployz_supervisor=info");
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let opt = Opt::from_args();
	let res = run(opt).await;
	if let Err(e) = res {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

async fn run(opt: Opt) -> Result<(), Error> {
	match opt.cmd {
		TopCommand::Server {
			data_root,
			socket,
			corrosion_binary,
		} => run_server(data_root, socket, corrosion_binary).await,
		TopCommand::Client(cmd) => run_client(opt.config_file, opt.cluster, cmd).await,
	}
}

/// Wires the production collaborators together, restores persisted
/// networks, and serves RPCs until a termination signal arrives (§4.8,
/// §4.9).
async fn run_server(data_root: PathBuf, socket: Option<PathBuf>, corrosion_binary: String) -> Result<(), Error> {
	let external_socket = socket.unwrap_or_else(cli::default_external_socket_path);

	let platform = production_platform_ops();
	let corrosion = Arc::new(ProcessCorrosionRuntime::new(corrosion_binary, "127.0.0.1:8181"));
	let containers = production_container_runtime();
	let registry_factory: ployz_manager::RegistryFactory = Arc::new(|runtime_cfg, api_token| {
		Arc::new(HttpRegistry::new(runtime_cfg.registry_api.clone(), api_token.to_string())) as Arc<dyn ployz_registry::RegistryClient>
	});
	let driver = Arc::new(WireguardControlDriver::new());
	let ntp_sample: ployz_manager::NtpSampleFn = Arc::new(|| Box::pin(ployz_health::ntp::sample_offset(ployz_health::ntp::DEFAULT_NTP_SERVER)));

	let manager = Manager::new(data_root, platform, corrosion, containers, registry_factory, driver, 51821, ntp_sample)?;

	let server = ProxyServer::new(manager, external_socket);
	server.serve().await?;

	shutdown_signal().await;
	server.stop().await;
	Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};
	let mut term = signal(SignalKind::terminate()).expect("unable to install SIGTERM handler");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {},
		_ = term.recv() => {},
	}
}

#[cfg(not(unix))]
async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

async fn run_client(config_file: PathBuf, cluster_override: Option<String>, cmd: Command) -> Result<(), Error> {
	let config_file = expand_tilde(config_file);
	let config = CliConfig::read(&config_file)?;
	let (_, cluster) = config.resolve_cluster(cluster_override.as_deref())?;

	let mut client = cli::Client::dial(&cluster.connections).await?;
	cli::cmd::dispatch(cmd, &cluster.network, &mut client).await
}

fn expand_tilde(path: PathBuf) -> PathBuf {
	if let Ok(stripped) = path.strip_prefix("~") {
		if let Some(home) = std::env::var_os("HOME") {
			return PathBuf::from(home).join(stripped);
		}
	}
	path
}
