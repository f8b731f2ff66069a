//! RPC server and transparent proxy director for the ployz daemon (§4.9).
//!
//! [`ProxyServer`] owns the internal and external Unix socket listeners,
//! the [`Director`] that routes external requests, and one identity
//! watcher per managed network. Its lifecycle is the [`ServePhase`] FSM:
//! `StartingInternal -> StartingProxy -> WaitingForIdentity -> Serving`,
//! with `ShuttingDown` reachable from any of those on `stop`.

pub mod backend;
pub mod director;
pub mod identity;
pub mod server;
pub mod wire;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use ployz_manager::Manager;
use ployz_phases::{PhaseCell, ServePhase};
use ployz_util::error::Error;

pub use backend::{Backend, BackendCache, LocalBackend, RemoteBackend};
pub use director::Director;
pub use server::SocketPaths;

/// Derives the internal socket path from the external one, mirroring the
/// teacher's `<stem>-internal<ext>` convention (§6 "Socket layout").
pub fn derive_socket_paths(external: &Path) -> SocketPaths {
	let stem = external.file_stem().and_then(|s| s.to_str()).unwrap_or("ployzd");
	let ext = external.extension().and_then(|s| s.to_str());
	let internal_name = match ext {
		Some(ext) => format!("{}-internal.{}", stem, ext),
		None => format!("{}-internal", stem),
	};
	let internal = external.with_file_name(internal_name);
	SocketPaths {
		internal,
		external: external.to_path_buf(),
	}
}

/// Ties the internal/external Unix socket listeners, the Director, and one
/// identity watcher per network into a single supervised lifecycle.
pub struct ProxyServer {
	phase: PhaseCell<ServePhase>,
	manager: Arc<Manager>,
	director: Arc<Director>,
	sockets: SocketPaths,
	stop_tx: watch::Sender<bool>,
	stop_rx: watch::Receiver<bool>,
}

impl ProxyServer {
	pub fn new(manager: Arc<Manager>, external_socket: PathBuf) -> Arc<Self> {
		let sockets = derive_socket_paths(&external_socket);
		let director = Arc::new(Director::new(manager.clone()));
		let (stop_tx, stop_rx) = watch::channel(false);
		Arc::new(Self {
			phase: PhaseCell::new(),
			manager,
			director,
			sockets,
			stop_tx,
			stop_rx,
		})
	}

	pub fn phase(&self) -> ServePhase {
		self.phase.get()
	}

	/// Binds both Unix sockets, spawns their accept loops, then starts one
	/// identity watcher per persisted network (§4.9).
	pub async fn serve(self: &Arc<Self>) -> Result<(), Error> {
		self.phase.transition(ServePhase::StartingInternal);
		let internal_listener = server::bind_unix_socket(&self.sockets.internal)?;
		tokio::spawn(server::internal_accept_loop(internal_listener, self.manager.clone(), self.stop_rx.clone()));

		self.phase.transition(ServePhase::StartingProxy);
		let external_listener = server::bind_external_unix_socket(&self.sockets.external)?;
		tokio::spawn(server::external_accept_loop(external_listener, self.director.clone(), self.stop_rx.clone()));

		self.phase.transition(ServePhase::WaitingForIdentity);
		for network in self.manager.enabled_networks()? {
			self.spawn_identity_watcher(network);
		}

		self.phase.transition(ServePhase::Serving);
		info!("proxy server listening: internal={:?} external={:?}", self.sockets.internal, self.sockets.external);
		Ok(())
	}

	fn spawn_identity_watcher(self: &Arc<Self>, network: String) {
		let manager = self.manager.clone();
		let director = self.director.clone();
		let stop_rx = self.stop_rx.clone();
		tokio::spawn(identity::identity_loop(network, manager, director, stop_rx));
	}

	/// Starts a watcher for a network applied after `serve` has already
	/// run, so newly-enabled networks get TCP listeners without a restart.
	pub fn track_network(self: &Arc<Self>, network: impl Into<String>) {
		self.spawn_identity_watcher(network.into());
	}

	/// Signals every accept loop and identity watcher to stop. Does not
	/// wait for in-flight connections to drain; callers needing that
	/// should race this against a timeout of their own, the way
	/// `Supervisor::stop` bounds its own shutdown at 30s.
	pub async fn stop(&self) {
		self.phase.transition(ServePhase::ShuttingDown);
		let _ = self.stop_tx.send(true);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn derives_the_internal_socket_name_from_the_external_one() {
		let paths = derive_socket_paths(Path::new("/var/run/ployzd.sock"));
		assert_eq!(paths.internal, Path::new("/var/run/ployzd-internal.sock"));
	}

	#[test]
	fn derives_the_internal_socket_name_with_no_extension() {
		let paths = derive_socket_paths(Path::new("/tmp/ployzd"));
		assert_eq!(paths.internal, Path::new("/tmp/ployzd-internal"));
	}
}
