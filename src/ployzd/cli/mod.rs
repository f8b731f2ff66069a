//! Client-side transport: dials one of a cluster's configured
//! connections (§6 "Config file") and speaks the length-prefixed
//! MessagePack protocol [`ployz_proxy::wire`] defines.

pub mod cmd;

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use ployz_proxy::wire::{self, Reply, RequestBody, RequestEnvelope};
use ployz_util::config::{Connection, ConnectionTarget};
use ployz_util::error::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SSH_FORWARD_SETTLE: Duration = Duration::from_millis(300);
const SSH_FORWARD_RETRIES: u32 = 10;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// An open connection to a daemon's external socket, plus the SSH child
/// process keeping a forwarded tunnel alive, if any (dropping it tears
/// the tunnel down).
pub struct Client {
	stream: Box<dyn Stream>,
	_ssh_tunnel: Option<tokio::process::Child>,
}

impl Client {
	/// Tries each connection in order (§6 allows more than one per
	/// cluster for redundancy), returning the first that succeeds.
	pub async fn dial(connections: &[Connection]) -> Result<Self, Error> {
		let mut last_err = None;
		for conn in connections {
			match Self::dial_one(conn).await {
				Ok(client) => return Ok(client),
				Err(e) => last_err = Some(e),
			}
		}
		Err(last_err.unwrap_or_else(|| Error::InvalidArgument("no connections configured for this cluster".into())))
	}

	async fn dial_one(conn: &Connection) -> Result<Self, Error> {
		match &conn.target {
			ConnectionTarget::Unix { unix } => {
				let stream = UnixStream::connect(unix)
					.await
					.map_err(|e| Error::Unavailable(format!("unable to connect to {}: {}", unix.display(), e)))?;
				Ok(Self {
					stream: Box::new(stream),
					_ssh_tunnel: None,
				})
			}
			ConnectionTarget::Tcp { tcp } => {
				let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(tcp))
					.await
					.map_err(|_| Error::Unavailable(format!("timed out connecting to {}", tcp)))?
					.map_err(|e| Error::Unavailable(format!("unable to connect to {}: {}", tcp, e)))?;
				Ok(Self {
					stream: Box::new(stream),
					_ssh_tunnel: None,
				})
			}
			ConnectionTarget::Ssh { ssh } => Self::dial_ssh(ssh, conn.ssh_key_file.as_deref()).await,
		}
	}

	/// Forwards a local TCP port to the remote's external Unix socket
	/// over `ssh -L`, then connects to that local port. The `ssh`
	/// process is kept alive for the life of the connection.
	async fn dial_ssh(target: &str, key_file: Option<&std::path::Path>) -> Result<Self, Error> {
		let local_port = {
			let probe = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| Error::Unavailable(format!("no free local port for the ssh tunnel: {}", e)))?;
			probe.local_addr().map_err(|e| Error::Internal(e.to_string()))?.port()
		};
		let remote_socket = default_external_socket_path();

		let mut cmd = tokio::process::Command::new("ssh");
		cmd.arg("-N")
			.arg("-L")
			.arg(format!("127.0.0.1:{}:{}", local_port, remote_socket.display()))
			.arg("-o")
			.arg("ExitOnForwardFailure=yes")
			.arg(target);
		if let Some(key) = key_file {
			cmd.arg("-i").arg(key);
		}
		let child = cmd
			.stdin(std::process::Stdio::null())
			.stdout(std::process::Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| Error::Unavailable(format!("unable to spawn ssh: {}", e)))?;

		let addr: std::net::SocketAddr = format!("127.0.0.1:{}", local_port).parse().unwrap();
		let mut attempt = 0;
		loop {
			tokio::time::sleep(SSH_FORWARD_SETTLE).await;
			match TcpStream::connect(addr).await {
				Ok(stream) => {
					return Ok(Self {
						stream: Box::new(stream),
						_ssh_tunnel: Some(child),
					})
				}
				Err(e) => {
					attempt += 1;
					if attempt >= SSH_FORWARD_RETRIES {
						return Err(Error::Unavailable(format!("ssh tunnel to {} did not come up: {}", target, e)));
					}
				}
			}
		}
	}

	pub async fn call(&mut self, network: &str, body: RequestBody) -> Result<Reply, Error> {
		let envelope = RequestEnvelope {
			network: network.to_string(),
			machines: None,
			proxy_authority: false,
			body,
		};
		let encoded = wire::encode(&envelope)?;
		wire::write_frame(&mut self.stream, &encoded).await?;
		let frame = wire::read_frame(&mut self.stream)
			.await?
			.ok_or_else(|| Error::Unavailable("connection closed before a reply arrived".into()))?;
		wire::decode(&frame)
	}

	/// As [`Self::call`], but sets `machines` so the receiving daemon's
	/// Director fans the request out (§4.9 step 3).
	pub async fn call_fanned_out(&mut self, network: &str, machines: Vec<String>, body: RequestBody) -> Result<Reply, Error> {
		let envelope = RequestEnvelope {
			network: network.to_string(),
			machines: Some(machines),
			proxy_authority: false,
			body,
		};
		let encoded = wire::encode(&envelope)?;
		wire::write_frame(&mut self.stream, &encoded).await?;
		let frame = wire::read_frame(&mut self.stream)
			.await?
			.ok_or_else(|| Error::Unavailable("connection closed before a reply arrived".into()))?;
		wire::decode(&frame)
	}
}

/// §6 "Socket layout": `/var/run/ployzd.sock` on Linux, `/tmp/ployzd.sock`
/// elsewhere.
pub fn default_external_socket_path() -> PathBuf {
	if cfg!(target_os = "linux") {
		PathBuf::from("/var/run/ployzd.sock")
	} else {
		PathBuf::from("/tmp/ployzd.sock")
	}
}
