use super::*;
use crate::prelude::*;
use std::sync::Arc;

#[test]
fn normalize_path1() {
  assert_eq!(normalize_path("/a/b/c.js"), "/a/b/c.js");
  assert_eq!(normalize_path("/a/./b/../c.js"), "/a/c.js");
  assert_eq!(normalize_path("C:\\scripts\\a.js"), "/C:/scripts/a.js");
  assert_eq!(normalize_path("/a//b.js"), "/a/b.js");
}

#[test]
fn mem_fs1() {
  let fs = MemFs::with_files([("/a/b.js", "hello")]);
  assert_eq!(fs.read_file("/a/b.js").unwrap(), b"hello");
  assert!(matches!(
    fs.read_file("/a/c.js"),
    Err(FsError::NotFound(_))
  ));
  // A path that is a prefix of stored files behaves as a directory.
  assert!(matches!(
    fs.read_file("/a"),
    Err(FsError::IsDirectory(_))
  ));
  assert!(fs.stat("/a").unwrap().is_dir);
  assert!(!fs.stat("/a/b.js").unwrap().is_dir);
}

#[test]
fn gated_fs1() {
  let inner = Arc::new(MemFs::with_files([
    ("/seen.js", "a"),
    ("/unseen.js", "b"),
  ]));
  let gated = GatedFs::new(inner);

  // Before gating everything is readable.
  assert!(gated.read_file("/seen.js").is_ok());

  gated.gate_to_opened(true);
  assert!(gated.read_file("/seen.js").is_ok());
  assert!(matches!(
    gated.read_file("/unseen.js"),
    Err(FsError::PathNeverOpenedDuringInit(_))
  ));

  gated.gate_to_opened(false);
  assert!(gated.read_file("/unseen.js").is_ok());
}

#[test]
fn fs_map_gate1() {
  let map = FsMap::mem_defaults();
  let file = map.layer("file").unwrap();
  file.write_file("/x.js", b"1").unwrap();
  assert!(file.read_file("/x.js").is_ok());

  map.gate_file_layer(true);
  assert!(matches!(
    file.read_file("/never.js"),
    Err(FsError::PathNeverOpenedDuringInit(_))
  ));
  // Previously read paths stay readable for every VU.
  assert!(file.read_file("/x.js").is_ok());
}
