//! In-memory filesystem layer.

use crate::fs::{FileStat, Filesystem, normalize_path};
use crate::prelude::*;

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct MemFs {
  files: RwLock<HashMap<String, Vec<u8>>>,
  dirs: RwLock<HashSet<String>>,
}

impl MemFs {
  pub fn new() -> Self {
    Self::default()
  }

  /// Convenience constructor used by tests and archive extraction.
  pub fn with_files<I, P, B>(files: I) -> Self
  where
    I: IntoIterator<Item = (P, B)>,
    P: AsRef<str>,
    B: Into<Vec<u8>>,
  {
    let fs = Self::new();
    for (path, data) in files {
      fs.write_file(&normalize_path(path.as_ref()), &data.into()).unwrap();
    }
    fs
  }

  fn is_dir(&self, path: &str) -> bool {
    if self.dirs.read().contains(path) {
      return true;
    }
    let prefix = format!("{}/", path.trim_end_matches('/'));
    self.files.read().keys().any(|k| k.starts_with(&prefix))
  }
}

impl Filesystem for MemFs {
  fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
    if let Some(data) = self.files.read().get(path) {
      return Ok(data.clone());
    }
    if self.is_dir(path) {
      return Err(FsError::IsDirectory(path.to_string()));
    }
    Err(FsError::NotFound(path.to_string()))
  }

  fn stat(&self, path: &str) -> Result<FileStat, FsError> {
    if let Some(data) = self.files.read().get(path) {
      return Ok(FileStat {
        is_dir: false,
        size: data.len() as u64,
      });
    }
    if self.is_dir(path) {
      return Ok(FileStat { is_dir: true, size: 0 });
    }
    Err(FsError::NotFound(path.to_string()))
  }

  fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
    self.files.write().insert(path.to_string(), data.to_vec());
    Ok(())
  }

  fn mkdir_all(&self, path: &str) -> Result<(), FsError> {
    self.dirs.write().insert(path.trim_end_matches('/').to_string());
    Ok(())
  }
}
