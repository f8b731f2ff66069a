//! Small-file persistence for local, non-transactional state (e.g. the
//! supervisor's backoff counters across restarts). Writes are atomic
//! (write to a temp file, then rename) and the format is MessagePack,
//! the same encoding `garage_util::persister` uses for its own
//! `PersisterShared` values.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

pub struct Persister<T> {
	path: PathBuf,
	_marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Persister<T> {
	pub fn new(base_dir: &Path, file_name: &str) -> Self {
		Self {
			path: base_dir.join(file_name),
			_marker: PhantomData,
		}
	}

	pub fn load(&self) -> Result<Option<T>, Error> {
		match std::fs::read(&self.path) {
			Ok(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	pub fn save(&self, value: &T) -> Result<(), Error> {
		let bytes = rmp_serde::to_vec_named(value)?;
		let tmp_path = self.path.with_extension("tmp");
		std::fs::write(&tmp_path, &bytes)?;
		std::fs::rename(&tmp_path, &self.path)?;
		Ok(())
	}

	pub fn delete(&self) -> Result<(), Error> {
		match std::fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	pub fn exists(&self) -> bool {
		self.path.exists()
	}
}

/// A [`Persister`] plus an in-memory cached copy guarded by a lock, for
/// values that are read far more often than they are written (e.g. the
/// supervisor's phase/backoff state, read on every status request).
pub struct PersisterShared<T> {
	persister: Persister<T>,
	cached: RwLock<Option<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> PersisterShared<T> {
	pub fn new(base_dir: &Path, file_name: &str) -> Result<Self, Error> {
		let persister = Persister::new(base_dir, file_name);
		let cached = persister.load()?;
		Ok(Self {
			persister,
			cached: RwLock::new(cached),
		})
	}

	pub fn get(&self) -> Option<T> {
		self.cached.read().unwrap().clone()
	}

	pub fn set(&self, value: T) -> Result<(), Error> {
		self.persister.save(&value)?;
		*self.cached.write().unwrap() = Some(value);
		Ok(())
	}
}
