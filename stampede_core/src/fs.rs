//! Layered virtual filesystems.
//!
//! Every byte a test reads goes through a [`FsMap`]: a map from URL scheme
//! (`file`, `https`, ...) to a [`Filesystem`] implementation. The archive
//! writer re-creates the exact same layers on another host, which is what
//! makes a bundled test reproducible.

use crate::prelude::*;

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use mem::MemFs;
pub use os::OsFs;

pub mod mem;
pub mod os;

#[cfg(test)]
mod fs_tests;

/// File metadata, the subset the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
  pub is_dir: bool,
  pub size: u64,
}

/// A filesystem bound to one URL scheme. Paths are always absolute,
/// forward-slash separated, rooted at `/`.
pub trait Filesystem: Send + Sync + std::fmt::Debug {
  fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError>;

  fn stat(&self, path: &str) -> Result<FileStat, FsError>;

  /// Used only by archive extraction.
  fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError>;

  /// Used only by archive extraction.
  fn mkdir_all(&self, path: &str) -> Result<(), FsError>;

  /// Restrict subsequent reads to paths already read before. A no-op for
  /// layers that don't support gating; the `file` layer is wrapped in
  /// [`GatedFs`] which does.
  fn gate_to_opened(&self, _on: bool) {}
}

/// A gating wrapper that remembers every path read through it. Once gated,
/// a read of an unseen path fails with
/// [`FsError::PathNeverOpenedDuringInit`], so spawning a VU can never race
/// against on-disk changes made after the init phase.
#[derive(Debug)]
pub struct GatedFs {
  inner: Arc<dyn Filesystem>,
  gated: AtomicBool,
  seen: RwLock<HashSet<String>>,
}

impl GatedFs {
  pub fn new(inner: Arc<dyn Filesystem>) -> Self {
    Self {
      inner,
      gated: AtomicBool::new(false),
      seen: RwLock::new(HashSet::new()),
    }
  }

  fn check(&self, path: &str) -> Result<(), FsError> {
    if self.gated.load(Ordering::Acquire) && !self.seen.read().contains(path) {
      return Err(FsError::PathNeverOpenedDuringInit(path.to_string()));
    }
    Ok(())
  }
}

impl Filesystem for GatedFs {
  fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
    self.check(path)?;
    let data = self.inner.read_file(path)?;
    self.seen.write().insert(path.to_string());
    Ok(data)
  }

  fn stat(&self, path: &str) -> Result<FileStat, FsError> {
    self.check(path)?;
    self.inner.stat(path)
  }

  fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
    self.inner.write_file(path, data)
  }

  fn mkdir_all(&self, path: &str) -> Result<(), FsError> {
    self.inner.mkdir_all(path)
  }

  fn gate_to_opened(&self, on: bool) {
    self.gated.store(on, Ordering::Release);
  }
}

/// The scheme-keyed filesystem layers of one test run.
#[derive(Debug, Clone)]
pub struct FsMap {
  layers: Arc<RwLock<HashMap<String, Arc<dyn Filesystem>>>>,
}

impl FsMap {
  pub fn new() -> Self {
    Self {
      layers: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  /// The default layering for a live run: the host filesystem behind a
  /// gating wrapper on `file`, plus an empty in-memory `https` layer that
  /// archive extraction may fill.
  pub fn os_defaults() -> Self {
    let map = Self::new();
    map.set_layer("file", Arc::new(GatedFs::new(Arc::new(OsFs::new()))));
    map.set_layer("https", Arc::new(MemFs::new()));
    map
  }

  /// An all-in-memory layering. Used by tests and archive re-hydration.
  pub fn mem_defaults() -> Self {
    let map = Self::new();
    map.set_layer("file", Arc::new(GatedFs::new(Arc::new(MemFs::new()))));
    map.set_layer("https", Arc::new(MemFs::new()));
    map
  }

  pub fn set_layer(&self, scheme: &str, fs: Arc<dyn Filesystem>) {
    self.layers.write().insert(scheme.to_string(), fs);
  }

  pub fn layer(&self, scheme: &str) -> Option<Arc<dyn Filesystem>> {
    self.layers.read().get(scheme).cloned()
  }

  pub fn schemes(&self) -> Vec<String> {
    let mut schemes: Vec<String> =
      self.layers.read().keys().cloned().collect();
    schemes.sort();
    schemes
  }

  /// Flip the `file` layer to allow-only-previously-opened. Called by the
  /// bundle once the init phase completes.
  pub fn gate_file_layer(&self, on: bool) {
    if let Some(layer) = self.layer("file") {
      layer.gate_to_opened(on);
    }
  }
}

impl Default for FsMap {
  fn default() -> Self {
    Self::new()
  }
}

/// Normalizes an absolute, possibly OS-specific path into the internal
/// forward-slash form. Windows drive letters keep their leading slash, e.g.
/// `C:\scripts\a.js` becomes `/C:/scripts/a.js`.
pub fn normalize_path(path: &str) -> String {
  let mut p = path.replace('\\', "/");
  if !p.starts_with('/') {
    p.insert(0, '/');
  }
  // Squash `.` and `..` segments.
  let mut out: Vec<&str> = Vec::new();
  for seg in p.split('/') {
    match seg {
      "" | "." => {}
      ".." => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  format!("/{}", out.join("/"))
}

/// Converts an internal path back into a host [`PathBuf`].
pub fn to_host_path(path: &str) -> PathBuf {
  #[cfg(windows)]
  {
    // Strip the artificial leading slash in front of drive letters.
    let trimmed = path.trim_start_matches('/');
    if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
      return PathBuf::from(trimmed.replace('/', "\\"));
    }
  }
  Path::new(path).to_path_buf()
}
