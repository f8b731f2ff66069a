//! Error taxonomy shared by the whole daemon.
//!
//! Local functions return [`Error`]; the RPC boundary (see `ployz_proxy`)
//! maps each variant to a wire status code and, for [`Error::Precondition`],
//! attaches the structured detail carried in [`PreconditionFailure`].

use err_derive::Error;

/// The closed set of precondition codes a caller can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PreconditionCode {
	/// `network.not_configured`
	NetworkNotConfigured,
	/// `runtime.not_ready_for_services`
	RuntimeNotReadyForServices,
	/// `deploy.no_machines_available`
	DeployNoMachinesAvailable,
	/// `network.destroy.has_workloads`
	NetworkDestroyHasWorkloads,
	/// `network.destroy.has_machines`
	NetworkDestroyHasMachines,
}

impl PreconditionCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			PreconditionCode::NetworkNotConfigured => "network.not_configured",
			PreconditionCode::RuntimeNotReadyForServices => "runtime.not_ready_for_services",
			PreconditionCode::DeployNoMachinesAvailable => "deploy.no_machines_available",
			PreconditionCode::NetworkDestroyHasWorkloads => "network.destroy.has_workloads",
			PreconditionCode::NetworkDestroyHasMachines => "network.destroy.has_machines",
		}
	}
}

impl std::fmt::Display for PreconditionCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Structured detail attached to a [`Error::Precondition`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PreconditionFailure {
	pub code: PreconditionCode,
	pub subject: String,
	pub message: String,
	pub hint: Option<String>,
}

impl PreconditionFailure {
	pub fn new(code: PreconditionCode, subject: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			code,
			subject: subject.into(),
			message: message.into(),
			hint: None,
		}
	}

	pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
		self.hint = Some(hint.into());
		self
	}
}

impl std::fmt::Display for PreconditionFailure {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({}): {}", self.code, self.subject, self.message)
	}
}

/// The daemon-wide error type.
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "{}", _0)]
	Message(String),

	#[error(display = "Not found: {}", _0)]
	NotFound(String),

	#[error(display = "Invalid argument: {}", _0)]
	InvalidArgument(String),

	#[error(display = "Conflict: {}", _0)]
	Conflict(String),

	#[error(display = "Unavailable: {}", _0)]
	Unavailable(String),

	#[error(display = "{}", _0)]
	Precondition(PreconditionFailure),

	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "YAML error: {}", _0)]
	Yaml(#[error(source)] serde_yaml::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),

	#[error(display = "MessagePack encode error: {}", _0)]
	MsgpackEncode(#[error(source)] rmp_serde::encode::Error),

	#[error(display = "MessagePack decode error: {}", _0)]
	MsgpackDecode(#[error(source)] rmp_serde::decode::Error),

	#[error(display = "Internal error: {}", _0)]
	Internal(String),
}

/// The kind of [`Error`], used to pick a wire status code independently of
/// the human-readable message carried inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
	NotFound,
	InvalidArgument,
	Conflict,
	Unavailable,
	Precondition,
	Internal,
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::NotFound(_) => ErrorKind::NotFound,
			Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
			Error::Conflict(_) => ErrorKind::Conflict,
			Error::Unavailable(_) => ErrorKind::Unavailable,
			Error::Precondition(_) => ErrorKind::Precondition,
			Error::Message(m) => last_chance_classify(m),
			Error::Io(_)
			| Error::Yaml(_)
			| Error::Json(_)
			| Error::MsgpackEncode(_)
			| Error::MsgpackDecode(_)
			| Error::Internal(_) => ErrorKind::Internal,
		}
	}

	pub fn precondition(&self) -> Option<&PreconditionFailure> {
		match self {
			Error::Precondition(p) => Some(p),
			_ => None,
		}
	}

	pub fn unexpected_rpc_message(m: impl std::fmt::Debug) -> Error {
		Error::Message(format!("Unexpected RPC response: {:?}", m))
	}
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.to_string())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

/// Last-chance classification of a free-form message into an [`ErrorKind`],
/// applied when an error crossed a boundary (e.g. a collaborator trait, or
/// a deserialized wire error) without retaining its original typed kind.
pub fn last_chance_classify(message: &str) -> ErrorKind {
	let m = message.to_lowercase();
	if m.contains("is not initialized") {
		ErrorKind::NotFound
	} else if m.contains("is required") || m.contains("must be") || m.contains("parse ") {
		ErrorKind::InvalidArgument
	} else if m.contains("connect to docker") || m.contains("docker daemon") {
		ErrorKind::Unavailable
	} else {
		ErrorKind::Internal
	}
}

/// Extension trait turning `Option<T>` into `Result<T, Error>` with a
/// message, mirroring `garage_util::error::OkOrMessage`.
pub trait OkOrMessage<T> {
	fn ok_or_message(self, msg: impl Into<String>) -> Result<T, Error>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message(self, msg: impl Into<String>) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(msg.into()))
	}
}

/// Extension trait prefixing an error with context, mirroring
/// `garage_util::error::Error::err_context`.
pub trait ErrContext<T> {
	fn err_context(self, msg: impl Into<String>) -> Result<T, Error>;
}

impl<T, E: std::fmt::Display> ErrContext<T> for Result<T, E> {
	fn err_context(self, msg: impl Into<String>) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", msg.into(), e)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_not_found() {
		assert_eq!(
			last_chance_classify("network demo is not initialized"),
			ErrorKind::NotFound
		);
	}

	#[test]
	fn classifies_invalid_argument() {
		assert_eq!(
			last_chance_classify("subnet is required"),
			ErrorKind::InvalidArgument
		);
		assert_eq!(
			last_chance_classify("failed to parse CIDR"),
			ErrorKind::InvalidArgument
		);
	}

	#[test]
	fn classifies_unavailable() {
		assert_eq!(
			last_chance_classify("cannot connect to docker daemon"),
			ErrorKind::Unavailable
		);
	}

	#[test]
	fn falls_back_to_internal() {
		assert_eq!(last_chance_classify("something broke"), ErrorKind::Internal);
	}

	#[test]
	fn precondition_carries_structured_code() {
		let err = Error::Precondition(PreconditionFailure::new(
			PreconditionCode::NetworkDestroyHasWorkloads,
			"demo",
			"2 workloads are still scheduled",
		));
		assert_eq!(err.kind(), ErrorKind::Precondition);
		assert_eq!(
			err.precondition().unwrap().code.as_str(),
			"network.destroy.has_workloads"
		);
	}
}
