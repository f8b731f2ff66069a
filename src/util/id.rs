//! Cluster-wide machine identity.
//!
//! A [`MachineId`] is a WireGuard public key (32 raw bytes, Curve25519).
//! It is kept distinct from a bare `[u8; 32]` so that hex rendering,
//! parsing and serialization live in one place, the way
//! `garage_util::data::Uuid` centralizes its own hex-based `Display`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, OkOrMessage};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(pub [u8; 32]);

impl MachineId {
	pub const fn zero() -> Self {
		MachineId([0u8; 32])
	}

	pub fn from_slice(s: &[u8]) -> Option<Self> {
		if s.len() != 32 {
			return None;
		}
		let mut b = [0u8; 32];
		b.copy_from_slice(s);
		Some(MachineId(b))
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}
}

impl FromStr for MachineId {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		let bytes = hex::decode(s).map_err(|e| Error::InvalidArgument(format!(
			"invalid machine id {:?}: {}",
			s, e
		)))?;
		MachineId::from_slice(&bytes)
			.ok_or_message(format!("invalid machine id {:?}: expected 32 bytes, got {}", s, bytes.len()))
	}
}

impl fmt::Display for MachineId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for MachineId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "MachineId({})", self.to_hex())
	}
}

impl Serialize for MachineId {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for MachineId {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		MachineId::from_str(&s).map_err(serde::de::Error::custom)
	}
}
