//! Clock-offset health check against a reference time source (§4.4).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;

use ployz_util::error::Error;

/// Reference server used by the production [`sample_offset`] when the
/// daemon doesn't override it. Plain UDP/123, no authentication: this is
/// a clock-skew smoke check, not a security boundary.
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org:123";

const SNTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01).
const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Offsets larger than this are reported as `UnhealthyOffset` rather
/// than `Healthy`. Not specified numerically by the contract; chosen to
/// match the kind of clock skew that causes gossip conflict-resolution
/// (last-writer-wins by timestamp, §8) to misbehave (open question,
/// recorded in DESIGN.md).
const DEFAULT_MAX_HEALTHY_OFFSET: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NtpPhase {
	Unchecked,
	Healthy,
	UnhealthyOffset,
	Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NtpStatus {
	pub phase: NtpPhase,
	pub offset: Option<chrono::Duration>,
	pub error: Option<String>,
}

impl NtpStatus {
	fn unchecked() -> Self {
		Self {
			phase: NtpPhase::Unchecked,
			offset: None,
			error: None,
		}
	}
}

type OffsetFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<chrono::Duration, Error>> + Send>> + Send + Sync>;

/// Queries `server` with a minimal SNTP (RFC 4330) request and returns the
/// local clock's offset from it: positive means the local clock is ahead.
///
/// Uses the classic four-timestamp formula `((T2-T1)+(T3-T4))/2`, where
/// `T1`/`T4` are this machine's send/receive times and `T2`/`T3` are the
/// server's receive/transmit times out of the reply packet.
pub async fn sample_offset(server: &str) -> Result<chrono::Duration, Error> {
	let socket = UdpSocket::bind("0.0.0.0:0")
		.await
		.map_err(|e| Error::Unavailable(format!("unable to open a UDP socket for NTP: {}", e)))?;
	socket
		.connect(server)
		.await
		.map_err(|e| Error::Unavailable(format!("unable to resolve NTP server {}: {}", server, e)))?;

	let mut request = [0u8; 48];
	request[0] = 0b00_100_011; // LI = 0 (no warning), VN = 4, Mode = 3 (client)
	let t1 = system_time_to_ntp(SystemTime::now());
	request[40..48].copy_from_slice(&t1.to_be_bytes());

	tokio::time::timeout(SNTP_TIMEOUT, socket.send(&request))
		.await
		.map_err(|_| Error::Unavailable(format!("timed out sending NTP request to {}", server)))?
		.map_err(|e| Error::Unavailable(format!("unable to send NTP request to {}: {}", server, e)))?;

	let mut reply = [0u8; 48];
	tokio::time::timeout(SNTP_TIMEOUT, socket.recv(&mut reply))
		.await
		.map_err(|_| Error::Unavailable(format!("timed out waiting for an NTP reply from {}", server)))?
		.map_err(|e| Error::Unavailable(format!("unable to read NTP reply from {}: {}", server, e)))?;
	let t4 = system_time_to_ntp(SystemTime::now());

	let t2 = u64::from_be_bytes(reply[32..40].try_into().unwrap());
	let t3 = u64::from_be_bytes(reply[40..48].try_into().unwrap());

	let offset_ticks = ((t2 as i128 - t1 as i128) + (t3 as i128 - t4 as i128)) / 2;
	Ok(ntp_ticks_to_duration(offset_ticks))
}

/// Encodes a [`SystemTime`] as a 64-bit NTP timestamp (32-bit seconds
/// since 1900-01-01, 32-bit fraction).
fn system_time_to_ntp(time: SystemTime) -> u64 {
	let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
	let seconds = since_unix.as_secs() + NTP_UNIX_EPOCH_DELTA;
	let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
	(seconds << 32) | fraction
}

/// Converts a signed difference of 64-bit NTP timestamps (32.32
/// fixed-point seconds) into a [`chrono::Duration`].
fn ntp_ticks_to_duration(ticks: i128) -> chrono::Duration {
	let millis = ticks * 1000 / (1i128 << 32);
	chrono::Duration::milliseconds(millis as i64)
}

/// Periodically samples a reference clock offset (default every 60s,
/// §4.4) and classifies it against [`DEFAULT_MAX_HEALTHY_OFFSET`]. The
/// sampling function is injectable: the production implementation
/// queries a reference NTP server over UDP, tests supply a deterministic
/// fake.
pub struct NtpChecker {
	interval: Duration,
	max_healthy_offset: Duration,
	sample: OffsetFn,
	status: Mutex<NtpStatus>,
}

impl NtpChecker {
	pub fn new(sample: OffsetFn) -> Self {
		Self {
			interval: DEFAULT_INTERVAL,
			max_healthy_offset: DEFAULT_MAX_HEALTHY_OFFSET,
			sample,
			status: Mutex::new(NtpStatus::unchecked()),
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	pub fn with_max_healthy_offset(mut self, max: Duration) -> Self {
		self.max_healthy_offset = max;
		self
	}

	pub fn status(&self) -> NtpStatus {
		self.status.lock().unwrap().clone()
	}

	async fn check_once(&self) {
		let max_offset = chrono::Duration::from_std(self.max_healthy_offset)
			.unwrap_or(chrono::Duration::milliseconds(500));
		let next = match (self.sample)().await {
			Ok(offset) => NtpStatus {
				phase: if offset.abs() <= max_offset {
					NtpPhase::Healthy
				} else {
					NtpPhase::UnhealthyOffset
				},
				offset: Some(offset),
				error: None,
			},
			Err(e) => NtpStatus {
				phase: NtpPhase::Error,
				offset: None,
				error: Some(e.to_string()),
			},
		};
		*self.status.lock().unwrap() = next;
	}

	pub async fn run(&self, mut stop_signal: tokio::sync::watch::Receiver<bool>) {
		while !*stop_signal.borrow() {
			let restart_at = Instant::now() + self.interval;
			self.check_once().await;
			tokio::select! {
				_ = tokio::time::sleep_until(restart_at.into()) => {},
				_ = stop_signal.changed() => {},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn offset_of(ms: i64) -> OffsetFn {
		Arc::new(move || Box::pin(async move { Ok(chrono::Duration::milliseconds(ms)) }))
	}

	fn failing() -> OffsetFn {
		Arc::new(|| Box::pin(async { Err(Error::Unavailable("no reference clock".into())) }))
	}

	#[tokio::test]
	async fn starts_unchecked() {
		let checker = NtpChecker::new(offset_of(0));
		assert_eq!(checker.status().phase, NtpPhase::Unchecked);
	}

	#[tokio::test]
	async fn small_offset_is_healthy() {
		let checker = NtpChecker::new(offset_of(10));
		checker.check_once().await;
		assert_eq!(checker.status().phase, NtpPhase::Healthy);
	}

	#[tokio::test]
	async fn large_offset_is_unhealthy() {
		let checker = NtpChecker::new(offset_of(5_000));
		checker.check_once().await;
		assert_eq!(checker.status().phase, NtpPhase::UnhealthyOffset);
	}

	#[tokio::test]
	async fn sample_failure_reports_error_phase() {
		let checker = NtpChecker::new(failing());
		checker.check_once().await;
		let status = checker.status();
		assert_eq!(status.phase, NtpPhase::Error);
		assert!(status.error.is_some());
	}

	#[tokio::test]
	async fn negative_offset_is_compared_by_magnitude() {
		let checker = NtpChecker::new(offset_of(-5_000));
		checker.check_once().await;
		assert_eq!(checker.status().phase, NtpPhase::UnhealthyOffset);
	}

	#[test]
	fn ntp_round_trip_preserves_sub_second_precision() {
		let now = SystemTime::now();
		let ticks = system_time_to_ntp(now);
		let back = UNIX_EPOCH + Duration::from_secs((ticks >> 32) - NTP_UNIX_EPOCH_DELTA);
		let drift = now.duration_since(back).unwrap_or_else(|e| e.duration());
		assert!(drift < Duration::from_secs(1));
	}

	#[test]
	fn zero_tick_delta_is_zero_offset() {
		assert_eq!(ntp_ticks_to_duration(0), chrono::Duration::zero());
	}

	#[test]
	fn one_full_tick_second_is_one_thousand_milliseconds() {
		assert_eq!(ntp_ticks_to_duration(1i128 << 32), chrono::Duration::milliseconds(1000));
	}
}
