use super::*;
use crate::fs::{FsMap, MemFs};
use std::sync::Arc;

fn url() -> Url {
  Url::parse("file:///t.js").unwrap()
}

#[test]
fn compat_mode_parse1() {
  assert_eq!("base".parse::<CompatMode>().unwrap(), CompatMode::Base);
  assert_eq!(
    "extended".parse::<CompatMode>().unwrap(),
    CompatMode::Extended
  );
  assert!("es6".parse::<CompatMode>().is_err());
  assert_eq!(CompatMode::default(), CompatMode::Extended);
  assert_eq!(CompatMode::Base.to_string(), "base");
}

#[test]
fn base_accepts_es51() {
  let src = "var x = 1;\nfunction f(a) { return a + x; }\nmodule.exports.default = f;";
  let program = compile(&url(), src, CompatMode::Base, None).unwrap();
  assert_eq!(program.code, src);
}

#[test]
fn base_rejects_es61() {
  // Every construct points at its own location.
  let cases = [
    ("var f = () => 1;", "arrow"),
    ("class A {}", "class"),
    ("let x = 1;", "let/const"),
    ("const x = 1;", "let/const"),
    ("var s = `tpl`;", "template"),
    ("f(...args);", "spread"),
    ("var [a, b] = pair;", "destructuring"),
    ("for (var x of xs) {}", "for-of"),
    ("function* g() {}", "generator"),
    ("async function a() {}", "async"),
    ("import x from './a.js';", "module"),
    ("export default function () {};", "module"),
    ("var o = { x };", "shorthand"),
  ];
  for (src, hint) in cases {
    match compile(&url(), src, CompatMode::Base, None) {
      Err(CompileError::Syntax { line, message, .. }) => {
        assert_eq!(line, 1, "{src}");
        assert!(
          message.contains("base compatibility mode"),
          "{src} -> {message}"
        );
      }
      other => panic!("expected syntax error for {hint} ({src}), got {other:?}"),
    }
  }
}

#[test]
fn base_error_position1() {
  let src = "var ok = 1;\nvar bad = () => 2;\n";
  match compile(&url(), src, CompatMode::Base, None) {
    Err(CompileError::Syntax { line, .. }) => assert_eq!(line, 2),
    other => panic!("expected syntax error, got {other:?}"),
  }
}

#[test]
fn genuine_syntax_error1() {
  let src = "function ( {";
  assert!(matches!(
    compile(&url(), src, CompatMode::Base, None),
    Err(CompileError::Syntax { .. })
  ));
  assert!(matches!(
    compile(&url(), src, CompatMode::Extended, None),
    Err(CompileError::Syntax { .. })
  ));
}

#[test]
fn extended_accepts_es61() {
  let src = "const f = (x) => x ** 2;\nmodule.exports.default = f;";
  let program = compile(&url(), src, CompatMode::Extended, None).unwrap();
  // No module syntax, so the source passes through untouched.
  assert_eq!(program.code, src);
}

#[test]
fn inline_source_map1() {
  use base64::Engine;
  let map = br#"{"version":3,"sources":["orig.ts"],"names":[],"mappings":"AAAA"}"#;
  let b64 = base64::engine::general_purpose::STANDARD.encode(map);
  let src = format!(
    "var x = 1;\n//# sourceMappingURL=data:application/json;base64,{b64}\n"
  );
  let program = compile(&url(), &src, CompatMode::Extended, None).unwrap();
  assert_eq!(program.source_map.as_deref(), Some(map.as_slice()));
}

#[test]
fn external_source_map1() {
  let map = br#"{"version":3,"sources":["orig.ts"],"names":[],"mappings":"AAAA"}"#;
  let fs = FsMap::new();
  fs.set_layer("file", Arc::new(MemFs::with_files([("/t.js.map", map.as_slice())])));

  let src = "var x = 1;\n//# sourceMappingURL=t.js.map\n";
  let program = compile(&url(), src, CompatMode::Extended, Some(&fs)).unwrap();
  assert_eq!(program.source_map.as_deref(), Some(map.as_slice()));

  // An unreachable map target is logged, not fatal.
  let src = "var x = 1;\n//# sourceMappingURL=missing.js.map\n";
  let program = compile(&url(), src, CompatMode::Extended, Some(&fs)).unwrap();
  assert!(program.source_map.is_none());
}
