//! Version/feature string plumbing, used by the CLI's `--version` output
//! and included in the panic banner. Mirrors `garage_util::version`.

use std::sync::OnceLock;

static VERSION: OnceLock<String> = OnceLock::new();
static FEATURES: OnceLock<Vec<&'static str>> = OnceLock::new();

pub fn init_version(git_version: &str) {
	let _ = VERSION.set(git_version.to_string());
}

pub fn init_features(features: &[&'static str]) {
	let _ = FEATURES.set(features.to_vec());
}

pub fn ployz_version() -> &'static str {
	VERSION.get().map(|s| s.as_str()).unwrap_or("unknown")
}

pub fn features() -> &'static [&'static str] {
	FEATURES.get().map(|v| v.as_slice()).unwrap_or(&[])
}
