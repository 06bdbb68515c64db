//! Host-OS filesystem layer.

use crate::fs::{FileStat, Filesystem, to_host_path};
use crate::prelude::*;

use std::fs;

#[derive(Debug, Default)]
pub struct OsFs {}

impl OsFs {
  pub fn new() -> Self {
    Self {}
  }
}

fn io_error(path: &str, e: std::io::Error) -> FsError {
  match e.kind() {
    std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
    _ => FsError::Io {
      path: path.to_string(),
      message: e.to_string(),
    },
  }
}

impl Filesystem for OsFs {
  fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
    let host = to_host_path(path);
    let meta = fs::metadata(&host).map_err(|e| io_error(path, e))?;
    if meta.is_dir() {
      return Err(FsError::IsDirectory(path.to_string()));
    }
    fs::read(&host).map_err(|e| io_error(path, e))
  }

  fn stat(&self, path: &str) -> Result<FileStat, FsError> {
    let host = to_host_path(path);
    let meta = fs::metadata(&host).map_err(|e| io_error(path, e))?;
    Ok(FileStat {
      is_dir: meta.is_dir(),
      size: meta.len(),
    })
  }

  fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
    fs::write(to_host_path(path), data).map_err(|e| io_error(path, e))
  }

  fn mkdir_all(&self, path: &str) -> Result<(), FsError> {
    fs::create_dir_all(to_host_path(path)).map_err(|e| io_error(path, e))
  }
}
