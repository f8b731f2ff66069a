//! Listener loops for the three transports named in §4.9/§6: the internal
//! Unix socket (direct `Manager` access, no Director), the external Unix
//! socket (proxied through the Director), and the per-network TCP listeners
//! the identity watcher starts once a management IP is known.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{error, info, warn};

use ployz_manager::Manager;

use crate::backend::{Backend, LocalBackend};
use crate::director::Director;
use crate::wire::{self, Reply, RequestEnvelope, WireError};

/// Serves one connection: reads frames until the peer closes, dispatching
/// each through `route` and writing back the reply.
async fn serve_connection<S, F, Fut>(mut stream: S, route: F)
where
	S: AsyncRead + AsyncWrite + Unpin,
	F: Fn(RequestEnvelope) -> Fut,
	Fut: std::future::Future<Output = Reply>,
{
	loop {
		let frame = match wire::read_frame(&mut stream).await {
			Ok(Some(f)) => f,
			Ok(None) => return,
			Err(e) => {
				warn!("connection read error: {}", e);
				return;
			}
		};

		let envelope: RequestEnvelope = match wire::decode(&frame) {
			Ok(e) => e,
			Err(e) => {
				warn!("malformed request: {}", e);
				return;
			}
		};

		let reply = route(envelope).await;
		let encoded = match wire::encode(&reply) {
			Ok(b) => b,
			Err(e) => {
				error!("failed to encode reply: {}", e);
				return;
			}
		};
		if let Err(e) = wire::write_frame(&mut stream, &encoded).await {
			warn!("connection write error: {}", e);
			return;
		}
	}
}

/// Accepts connections on the internal Unix socket and dispatches them
/// directly to the [`LocalBackend`] (§6 "internal socket"): no Director,
/// no proxy fan-out, trusted local callers only.
pub async fn internal_accept_loop(listener: UnixListener, manager: Arc<Manager>, mut stop_signal: watch::Receiver<bool>) {
	let local = Arc::new(LocalBackend::new(manager));
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, _) = match accepted {
					Ok(pair) => pair,
					Err(e) => { warn!("internal socket accept error: {}", e); continue; }
				};
				let local = local.clone();
				tokio::spawn(async move {
					serve_connection(stream, |envelope: RequestEnvelope| {
						let local = local.clone();
						async move {
							let result = local.dispatch(&envelope.network, envelope.body).await;
							Reply::Single(result.map_err(|e| WireError::from(&e)))
						}
					})
					.await;
				});
			}
			_ = stop_signal.changed() => return,
		}
	}
}

/// Accepts connections on the external Unix socket and routes them through
/// the [`Director`] (§6 "external socket"): the entry point for CLI clients
/// and for other daemons acting as proxy clients.
pub async fn external_accept_loop(listener: UnixListener, director: Arc<Director>, mut stop_signal: watch::Receiver<bool>) {
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, _) = match accepted {
					Ok(pair) => pair,
					Err(e) => { warn!("external socket accept error: {}", e); continue; }
				};
				let director = director.clone();
				tokio::spawn(async move {
					serve_connection(stream, |envelope: RequestEnvelope| {
						let director = director.clone();
						async move { director.handle(envelope).await }
					})
					.await;
				});
			}
			_ = stop_signal.changed() => return,
		}
	}
}

/// Accepts connections on a per-network TCP listener (management or overlay
/// address) and routes them through the Director with `proxy-authority`
/// implicitly honored by the sender (§4.9 step 1, §5 "no proxy loops").
pub async fn accept_loop(listener: TcpListener, director: Arc<Director>, mut stop_signal: watch::Receiver<bool>) {
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => { warn!("tcp accept error: {}", e); continue; }
				};
				info!("accepted proxy connection from {}", peer);
				let director = director.clone();
				tokio::spawn(async move {
					serve_connection(stream, |envelope: RequestEnvelope| {
						let director = director.clone();
						async move { director.handle(envelope).await }
					})
					.await;
				});
			}
			_ = stop_signal.changed() => return,
		}
	}
}

/// Removes a stale socket file left behind by an unclean shutdown before
/// binding a fresh `UnixListener` at the same path.
pub fn bind_unix_socket(path: &Path) -> std::io::Result<UnixListener> {
	if path.exists() {
		std::fs::remove_file(path)?;
	}
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	UnixListener::bind(path)
}

/// Binds the external socket and applies the permissions and group
/// ownership §6 "Socket layout" requires for it specifically: mode 0660
/// owned by group `ployz` if that group exists on Linux, mode 0666 on
/// macOS. The internal socket has no such requirement and keeps
/// `bind_unix_socket`'s default mode.
pub fn bind_external_unix_socket(path: &Path) -> std::io::Result<UnixListener> {
	let listener = bind_unix_socket(path)?;
	secure_external_socket(path)?;
	Ok(listener)
}

#[cfg(target_os = "linux")]
fn secure_external_socket(path: &Path) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
	match nix::unistd::Group::from_name("ployz") {
		Ok(Some(group)) => nix::unistd::chown(path, None, Some(group.gid))
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?,
		Ok(None) => {}
		Err(e) => warn!("unable to look up the ployz group, leaving socket group unchanged: {}", e),
	}
	Ok(())
}

#[cfg(not(target_os = "linux"))]
fn secure_external_socket(path: &Path) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
}

#[derive(Debug, Clone)]
pub struct SocketPaths {
	pub internal: PathBuf,
	pub external: PathBuf,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{RequestBody, ResponseBody};
	use ployz_controller::fakes::{FakeContainerRuntime, FakeCorrosionRuntime, FakePlatformOps};
	use ployz_reconcile::FakeDriver;
	use ployz_registry::FakeRegistry;
	use ployz_util::model::NetworkSpec;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	fn no_op_ntp() -> ployz_manager::NtpSampleFn {
		Arc::new(|| Box::pin(async { Ok(chrono::Duration::milliseconds(0)) }))
	}

	async fn manager(dir: &std::path::Path) -> Arc<Manager> {
		let registry: Arc<dyn ployz_registry::RegistryClient> = Arc::new(FakeRegistry::new());
		let registry_factory: ployz_manager::RegistryFactory = Arc::new(move |_runtime_cfg, _token| registry.clone());
		let mgr = Manager::new(
			dir.to_path_buf(),
			Arc::new(FakePlatformOps::new()),
			Arc::new(FakeCorrosionRuntime::new()),
			Arc::new(FakeContainerRuntime::new()),
			registry_factory,
			Arc::new(FakeDriver::new()),
			9000,
			no_op_ntp(),
		)
		.unwrap();
		mgr.apply_network_spec(NetworkSpec {
			network: "demo".to_string(),
			data_root: dir.to_path_buf(),
			network_cidr: "10.210.0.0/16".to_string(),
			subnet: "10.210.1.0/24".to_string(),
			management_ip: "fd00::1".parse().unwrap(),
			advertise_endpoint: None,
			wg_port: 51820,
			corrosion_member_id: 1,
			corrosion_api_token: "secret".to_string(),
			bootstrap: vec![],
			helper_image: None,
		})
		.await
		.unwrap();
		mgr
	}

	#[tokio::test]
	async fn internal_socket_serves_a_get_status_call() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sock_path = dir.join("internal.sock");
		let listener = bind_unix_socket(&sock_path).unwrap();
		let (_tx, rx) = watch::channel(false);
		let mgr = manager(&dir).await;
		tokio::spawn(internal_accept_loop(listener, mgr, rx));

		let mut client = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: None,
			proxy_authority: false,
			body: RequestBody::GetStatus,
		};
		let encoded = wire::encode(&envelope).unwrap();
		wire::write_frame(&mut client, &encoded).await.unwrap();
		let frame = wire::read_frame(&mut client).await.unwrap().unwrap();
		let reply: Reply = wire::decode(&frame).unwrap();
		match reply {
			Reply::Single(Ok(ResponseBody::Status(_))) => {}
			other => panic!("unexpected reply: {:?}", other),
		}
	}

	#[tokio::test]
	async fn external_socket_routes_through_the_director() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sock_path = dir.join("external.sock");
		let listener = bind_unix_socket(&sock_path).unwrap();
		let (_tx, rx) = watch::channel(false);
		let mgr = manager(&dir).await;
		let director = Arc::new(Director::new(mgr));
		tokio::spawn(external_accept_loop(listener, director, rx));

		let mut client = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
		let envelope = RequestEnvelope {
			network: "demo".to_string(),
			machines: None,
			proxy_authority: false,
			body: RequestBody::GetIdentity,
		};
		let encoded = wire::encode(&envelope).unwrap();
		wire::write_frame(&mut client, &encoded).await.unwrap();
		let frame = wire::read_frame(&mut client).await.unwrap().unwrap();
		let reply: Reply = wire::decode(&frame).unwrap();
		match reply {
			Reply::Single(Ok(ResponseBody::Identity(_))) => {}
			other => panic!("unexpected reply: {:?}", other),
		}
	}

	#[tokio::test]
	async fn rebinding_a_stale_socket_path_succeeds() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sock_path = dir.join("stale.sock");
		std::fs::write(&sock_path, b"not a socket").unwrap();
		bind_unix_socket(&sock_path).unwrap();
	}

	#[cfg(target_os = "linux")]
	#[tokio::test]
	async fn external_socket_gets_mode_0660() {
		use std::os::unix::fs::PermissionsExt;
		let dir = mktemp::Temp::new_dir().unwrap();
		let sock_path = dir.join("external.sock");
		let _listener = bind_external_unix_socket(&sock_path).unwrap();
		let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o660);
	}
}
