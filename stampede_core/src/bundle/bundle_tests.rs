use super::*;
use crate::bundle::options::Options;
use crate::prelude::*;
use crate::test::{make_bundle, make_bundle_with, mem_fs, tokio_handle, MAIN_URL};
use serde_json::json;
use std::sync::Arc;

fn external(value: serde_json::Value) -> Options {
  Options::from_json(value).unwrap()
}

#[test]
fn minimal_bundle1() {
  let bundle = make_bundle("export default function () {}").unwrap();
  assert_eq!(bundle.exports, vec!["default".to_string()]);
  assert!(bundle.has_export("default"));
  assert_eq!(bundle.compat_mode, CompatMode::Extended);
  assert_eq!(bundle.programs.len(), 1);
}

#[test]
fn options_parsed_and_merged1() {
  let script = r#"
    export const options = { vus: 10, duration: "30s" };
    export default function () {}
  "#;
  let bundle = make_bundle_with(
    script,
    &[],
    RuntimeOptions::default(),
    external(json!({"vus": 20})),
  )
  .unwrap();
  // External overrides win for explicitly-set fields only.
  assert_eq!(bundle.options.vus, Some(20));
  assert_eq!(
    bundle.options.duration.unwrap().0,
    std::time::Duration::from_secs(30)
  );
}

#[test]
fn exports_not_object1() {
  let err = make_bundle("module.exports = function () {};")
    .unwrap_err()
    .to_string();
  assert!(err.contains("must be an object"), "{err}");
}

#[test]
fn no_exported_functions1() {
  let err = make_bundle("export const options = {};")
    .unwrap_err()
    .to_string();
  assert!(err.contains("export at least one function"), "{err}");

  // Setup alone is not a runnable script either.
  let err = make_bundle("export function setup() {}")
    .unwrap_err()
    .to_string();
  assert!(err.contains("export at least one function"), "{err}");
}

#[test]
fn setup_teardown_shape1() {
  let err = make_bundle("export var setup = 5;\nexport default function () {}")
    .unwrap_err()
    .to_string();
  assert!(err.contains("setup must be a function"), "{err}");

  let err =
    make_bundle("export var teardown = 5;\nexport default function () {}")
      .unwrap_err()
      .to_string();
  assert!(err.contains("teardown must be a function"), "{err}");

  let bundle = make_bundle(
    "export function setup() {}\nexport function teardown() {}\nexport default function () {}",
  )
  .unwrap();
  assert!(bundle.has_export("setup"));
  assert!(bundle.has_export("teardown"));
}

#[test]
fn named_scenario_exports1() {
  let bundle = make_bundle(
    "export default function () {}\nexport function browse() {}\nexport const notAFunction = 1;",
  )
  .unwrap();
  assert!(bundle.has_export("browse"));
  assert!(!bundle.has_export("notAFunction"));
}

#[test]
fn unknown_builtin_module1() {
  let err = make_bundle(
    "import x from \"k6/nope\";\nexport default function () {}",
  )
  .unwrap_err()
  .to_string();
  assert!(err.contains("unknown builtin module"), "{err}");
}

#[test]
fn module_not_found1() {
  let err = make_bundle(
    "import x from \"./missing.js\";\nexport default function () {}",
  )
  .unwrap_err()
  .to_string();
  assert!(err.contains("not found"), "{err}");
}

#[test]
fn relative_imports_and_cycles1() {
  // a.js and b.js import each other; CommonJS hands the partial exports
  // object to the re-entrant require.
  let script = r#"
    import { fromA } from "./lib/a.js";
    export const options = {};
    export default function () {}
    if (fromA !== "a:b") { throw new Error("got " + fromA); }
  "#;
  let bundle = make_bundle_with(
    script,
    &[
      (
        "/scripts/lib/a.js",
        r#"
          var b = require("./b.js");
          module.exports.fromA = "a:" + b.name;
        "#,
      ),
      (
        "/scripts/lib/b.js",
        r#"
          var a = require("./a.js"); // partial during the cycle
          module.exports.name = "b";
          module.exports.sawPartialA = typeof a === "object";
        "#,
      ),
    ],
    RuntimeOptions::default(),
    Options::default(),
  )
  .unwrap();
  assert_eq!(bundle.programs.len(), 3);
  assert!(bundle.programs.contains("file:///scripts/lib/a.js"));
  assert!(bundle.programs.contains("file:///scripts/lib/b.js"));
}

#[test]
fn open_records_files1() {
  let script = r#"
    const text = open("./data.txt");
    if (text !== "payload") { throw new Error("bad read: " + text); }
    const bin = open("./data.txt", "b");
    if (!(bin instanceof ArrayBuffer)) { throw new Error("not a buffer"); }
    if (bin.byteLength !== 7) { throw new Error("bad length"); }
    export default function () {}
  "#;
  let bundle = make_bundle_with(
    script,
    &[("/scripts/data.txt", "payload")],
    RuntimeOptions::default(),
    Options::default(),
  )
  .unwrap();
  assert!(bundle.files.contains_key("file:///scripts/data.txt"));
}

#[test]
fn open_errors1() {
  // Missing file.
  let err = make_bundle("open(\"./nope.txt\");\nexport default function () {}")
    .unwrap_err()
    .to_string();
  assert!(err.contains("not found"), "{err}");

  // Directory.
  let err = make_bundle_with(
    "open(\"./sub\");\nexport default function () {}",
    &[("/scripts/sub/inner.txt", "x")],
    RuntimeOptions::default(),
    Options::default(),
  )
  .unwrap_err()
  .to_string();
  assert!(err.contains("is a directory"), "{err}");

  // Empty path.
  let err = make_bundle("open(\"\");\nexport default function () {}")
    .unwrap_err()
    .to_string();
  assert!(err.contains("non-empty"), "{err}");
}

#[test]
fn forbidden_in_init_context1() {
  let cases = [
    ("import http from \"k6/http\";\nhttp.get(\"http://x/\");", "http.request"),
    ("import { check } from \"k6\";\ncheck(1, { ok: 1 });", "check"),
    ("import { group } from \"k6\";\ngroup(\"g\", function () {});", "group"),
  ];
  for (snippet, op) in cases {
    let script = format!("{snippet}\nexport default function () {{}}");
    let err = make_bundle(&script).unwrap_err().to_string();
    assert!(
      err.contains("not allowed in the init context"),
      "{op}: {err}"
    );
  }
}

#[test]
fn base_mode_bundle1() {
  let runtime_options = RuntimeOptions {
    compat_mode: Some(CompatMode::Base),
    ..Default::default()
  };

  let es5 = "module.exports.default = function () {};";
  let bundle = make_bundle_with(
    es5,
    &[],
    runtime_options.clone(),
    Options::default(),
  )
  .unwrap();
  assert_eq!(bundle.compat_mode, CompatMode::Base);
  assert!(bundle.has_export("default"));

  let es6 = "export default () => {};";
  let err =
    make_bundle_with(es6, &[], runtime_options, Options::default())
      .unwrap_err()
      .to_string();
  assert!(err.contains("base compatibility mode"), "{err}");
}

#[test]
fn env_snapshot1() {
  let runtime_options = RuntimeOptions {
    env: crate::prelude::HashMap::from_iter([(
      "STAGE".to_string(),
      "dev".to_string(),
    )]),
    ..Default::default()
  };
  let script = r#"
    if (__ENV.STAGE !== "dev") { throw new Error("missing env"); }
    if (__VU !== 0) { throw new Error("init runs as VU 0"); }
    export default function () {}
  "#;
  make_bundle_with(script, &[], runtime_options, Options::default()).unwrap();
}

#[test]
fn archive_preserves_bundle1() {
  let script = r#"
    import { greeting } from "./lib.js";
    const data = open("./data.txt");
    export const options = { vus: 7 };
    export default function () {}
  "#;
  let bundle = make_bundle_with(
    script,
    &[
      ("/scripts/lib.js", "export const greeting = \"hi\";"),
      ("/scripts/data.txt", "payload"),
    ],
    RuntimeOptions::default(),
    Options::default(),
  )
  .unwrap();

  let archive = bundle.make_archive();
  assert_eq!(archive.meta.filename, MAIN_URL);
  assert_eq!(archive.meta.options.vus, Some(7));
  assert!(archive.files.contains_key("file:///scripts/lib.js"));
  assert!(archive.files.contains_key("file:///scripts/data.txt"));

  let mut buffer = vec![];
  archive.write(&mut buffer).unwrap();
  let read = crate::bundle::archive::Archive::read(buffer.as_slice()).unwrap();

  // Re-hydration on a host with nothing but the archive.
  let again = Bundle::from_archive(
    read,
    RuntimeOptions::default(),
    Options::default(),
    Arc::new(crate::metrics::MetricRegistry::new()),
    tokio_handle(),
  )
  .unwrap();
  assert_eq!(again.options.vus, Some(7));
  assert_eq!(again.exports, bundle.exports);
  assert_eq!(again.files, bundle.files);

  // Runtime overrides win over recorded options.
  let mut buffer = vec![];
  bundle.make_archive().write(&mut buffer).unwrap();
  let read = crate::bundle::archive::Archive::read(buffer.as_slice()).unwrap();
  let overridden = Bundle::from_archive(
    read,
    RuntimeOptions::default(),
    Options::from_json(serde_json::json!({"vus": 2})).unwrap(),
    Arc::new(crate::metrics::MetricRegistry::new()),
    tokio_handle(),
  )
  .unwrap();
  assert_eq!(overridden.options.vus, Some(2));
}

#[test]
fn options_evaluate_twice1() {
  // Evaluating options on the same bundle is stable.
  let bundle = make_bundle(
    "export const options = { vus: 3, tags: { a: \"1\" } };\nexport default function () {}",
  )
  .unwrap();
  let once = (*bundle.options).clone();
  let twice = (*bundle.options).clone();
  assert_eq!(once, twice);
}

#[test]
fn gating_after_init1() {
  let script = r#"
    const seen = open("./data.txt");
    export default function () {}
  "#;
  let fs = mem_fs(script, &[
    ("/scripts/data.txt", "payload"),
    ("/scripts/never.txt", "hidden"),
  ]);
  let bundle = Bundle::new(
    script.as_bytes(),
    url::Url::parse(MAIN_URL).unwrap(),
    fs.clone(),
    RuntimeOptions::default(),
    Options::default(),
    Arc::new(crate::metrics::MetricRegistry::new()),
    tokio_handle(),
  )
  .unwrap();
  let _ = bundle;

  let layer = fs.layer("file").unwrap();
  // Seen during init: still readable for VU spawning.
  assert!(layer.read_file("/scripts/data.txt").is_ok());
  // Never opened during init: gated.
  assert!(matches!(
    layer.read_file("/scripts/never.txt"),
    Err(FsError::PathNeverOpenedDuringInit(_))
  ));
}
