use crate::js::compiler::{CompatMode, compile};
use url::Url;

fn rewrite(src: &str) -> String {
  let url = Url::parse("file:///t.js").unwrap();
  let program = compile(&url, src, CompatMode::Extended, None).unwrap();
  program.code
}

#[test]
fn default_import1() {
  let out = rewrite(r#"import http from "k6/http"; http.get("x");"#);
  assert!(out.contains(r#"require("k6/http")"#), "{out}");
  assert!(out.contains("$$default"), "{out}");
}

#[test]
fn named_import1() {
  let out = rewrite(r#"import { check, group as g } from "k6";"#);
  assert!(out.contains(r#"require("k6")"#), "{out}");
  assert!(out.contains("var check = $$module_1.check"), "{out}");
  assert!(out.contains("var g = $$module_1.group"), "{out}");
}

#[test]
fn namespace_import1() {
  let out = rewrite(r#"import * as crypto from "k6/crypto";"#);
  assert!(out.contains("var crypto = $$module_1"), "{out}");
}

#[test]
fn side_effect_import1() {
  let out = rewrite(r#"import "./setup.js";"#);
  assert!(out.contains(r#"require("./setup.js")"#), "{out}");
}

#[test]
fn export_default_function1() {
  let out = rewrite("export default function () { return 1; }");
  assert!(out.contains("module.exports.default = function"), "{out}");
}

#[test]
fn export_default_named_function1() {
  let out = rewrite("export default function main() { return main; }");
  assert!(out.contains("function main()"), "{out}");
  assert!(out.contains("module.exports.default = main"), "{out}");
}

#[test]
fn export_decl1() {
  let out = rewrite("export function setup() {}\nexport const options = {};");
  assert!(out.contains("module.exports.setup = setup"), "{out}");
  assert!(out.contains("module.exports.options = options"), "{out}");
}

#[test]
fn export_named_local1() {
  // The assignment lands after the declaration even when the export
  // statement comes first.
  let out = rewrite("export { teardown };\nfunction teardown() {}");
  let decl = out.find("function teardown").unwrap();
  let assign = out.find("module.exports.teardown = teardown").unwrap();
  assert!(assign > decl, "{out}");
}

#[test]
fn export_from1() {
  let out = rewrite(r#"export { helper as aid } from "./lib.js";"#);
  assert!(out.contains(r#"require("./lib.js")"#), "{out}");
  assert!(out.contains("module.exports.aid = $$module_1.helper"), "{out}");
}

#[test]
fn export_all1() {
  let out = rewrite(r#"export * from "./lib.js";"#);
  assert!(out.contains("$$reexport(module.exports, require(\"./lib.js\"))"), "{out}");
}

#[test]
fn destructured_export1() {
  let out = rewrite("export var { a, b: c } = obj;");
  assert!(out.contains("module.exports.a = a"), "{out}");
  assert!(out.contains("module.exports.c = c"), "{out}");
}

#[test]
fn plain_script_untouched1() {
  let url = Url::parse("file:///t.js").unwrap();
  let src = "var x = 1;\nmodule.exports.default = function () { return x; };";
  let program = compile(&url, src, CompatMode::Extended, None).unwrap();
  assert_eq!(program.code, src);
  assert!(program.source_map.is_none());
}

#[test]
fn source_map_emitted1() {
  let url = Url::parse("file:///t.js").unwrap();
  let src = "import x from \"./a.js\";\nexport default function () { return x; }";
  let program = compile(&url, src, CompatMode::Extended, None).unwrap();
  let map = program.source_map.expect("rewrite keeps a source map");
  let parsed = sourcemap::SourceMap::from_slice(&map).unwrap();
  assert!(parsed.get_token_count() > 0);
}
