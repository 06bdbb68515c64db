use super::*;
use crate::fs::{FsMap, MemFs};
use std::sync::Arc;

fn pwd() -> Url {
  Url::parse("file:///scripts/main.js").unwrap()
}

#[test]
fn resolve_builtin1() {
  assert_eq!(
    resolve(&pwd(), "k6").unwrap().as_str(),
    "builtin://k6"
  );
  assert_eq!(
    resolve(&pwd(), "k6/http").unwrap().as_str(),
    "builtin://k6/http"
  );
  // `k6-utils` is a user file, not a builtin.
  assert!(!is_builtin("k6-utils"));
}

#[test]
fn resolve_absolute1() {
  assert_eq!(
    resolve(&pwd(), "/lib/a.js").unwrap().as_str(),
    "file:///lib/a.js"
  );
  assert_eq!(
    resolve(&pwd(), "C:\\lib\\a.js").unwrap().as_str(),
    "file:///C:/lib/a.js"
  );
}

#[test]
fn resolve_relative1() {
  assert_eq!(
    resolve(&pwd(), "./a.js").unwrap().as_str(),
    "file:///scripts/a.js"
  );
  assert_eq!(
    resolve(&pwd(), "../a.js").unwrap().as_str(),
    "file:///a.js"
  );
  // Relative imports resolve against the requiring module, not the root.
  let dep = Url::parse("file:///scripts/lib/dep.js").unwrap();
  assert_eq!(
    resolve(&dep, "./leaf.js").unwrap().as_str(),
    "file:///scripts/lib/leaf.js"
  );
}

#[test]
fn resolve_escape1() {
  // Climbing above the virtual root is a path error, not a clamp.
  assert!(matches!(
    resolve(&pwd(), "../../a.js"),
    Err(ResolveError::InvalidSpecifier { .. })
  ));
}

#[test]
fn resolve_remote1() {
  assert_eq!(
    resolve(&pwd(), "https://example.com/lib.js").unwrap().as_str(),
    "https://example.com/lib.js"
  );
  // Relative to a remote module stays remote.
  let remote = Url::parse("https://example.com/dir/mod.js").unwrap();
  assert_eq!(
    resolve(&remote, "./dep.js").unwrap().as_str(),
    "https://example.com/dir/dep.js"
  );
}

#[test]
fn resolve_empty1() {
  assert!(matches!(
    resolve(&pwd(), ""),
    Err(ResolveError::InvalidSpecifier { .. })
  ));
}

#[test]
fn fs_key1() {
  let file = Url::parse("file:///a/b.js").unwrap();
  assert_eq!(fs_key(&file), "/a/b.js");
  let https = Url::parse("https://example.com/lib/a.js").unwrap();
  assert_eq!(fs_key(&https), "/example.com/lib/a.js");
}

#[test]
fn load1() {
  let fs = FsMap::new();
  fs.set_layer("file", Arc::new(MemFs::with_files([("/a.js", "x")])));

  let hit = Url::parse("file:///a.js").unwrap();
  assert_eq!(load(&fs, &hit).unwrap(), b"x");

  let miss = Url::parse("file:///b.js").unwrap();
  assert!(load(&fs, &miss).is_err());

  // No handler declared for the scheme.
  let remote = Url::parse("ftp://x/y.js").unwrap();
  assert!(load(&fs, &remote).is_err());
}

#[test]
fn resolve_main1() {
  let cwd = std::path::Path::new("/work");
  assert_eq!(
    resolve_main(cwd, "script.js").unwrap().as_str(),
    "file:///work/script.js"
  );
  assert_eq!(
    resolve_main(cwd, "/abs/script.js").unwrap().as_str(),
    "file:///abs/script.js"
  );
  assert_eq!(
    resolve_main(cwd, "https://example.com/s.js").unwrap().as_str(),
    "https://example.com/s.js"
  );
}
