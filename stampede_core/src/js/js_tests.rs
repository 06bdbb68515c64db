use super::err::{JsError, SourceMapCache};

fn map_for(generated_line: u32, src_line: u32) -> Vec<u8> {
  let mut builder = sourcemap::SourceMapBuilder::new(None);
  let src = builder.add_source("file:///orig.ts");
  builder.add_raw(generated_line, 0, src_line, 4, Some(src), None, false);
  let map = builder.into_sourcemap();
  let mut out = vec![];
  map.to_writer(&mut out).unwrap();
  out
}

#[test]
fn sourcemap_cache_lookup1() {
  let mut cache = SourceMapCache::new();
  cache.insert_raw("file:///t.js", map_for(9, 2));

  // Generated line 10 (1-based) maps back to original line 3.
  assert_eq!(cache.map_position("file:///t.js", 10, 0), Some((3, 4)));
  assert_eq!(cache.map_position("file:///other.js", 10, 0), None);
}

#[test]
fn sourcemap_cache_malformed1() {
  let mut cache = SourceMapCache::new();
  cache.insert_raw("file:///t.js", b"not a map".to_vec());
  // Malformed maps are ignored, not fatal.
  assert_eq!(cache.map_position("file:///t.js", 1, 0), None);
}

#[test]
fn resolve_stack1() {
  let mut cache = SourceMapCache::new();
  cache.insert_raw("file:///t.js", map_for(9, 2));

  let stack = "Error: boom\n    at run (file:///t.js:10:0)\n    at file:///plain.js:1:1";
  let resolved = cache.resolve_stack(stack);
  assert!(resolved.contains("file:///t.js:3:4"), "{resolved}");
  // Positions without a map stay as they were.
  assert!(resolved.contains("file:///plain.js:1:1"), "{resolved}");
}

#[test]
fn js_error_display1() {
  let error = JsError {
    message: "Uncaught Error: boom".to_string(),
    resource_name: "file:///t.js".to_string(),
    line: 3,
    column: 7,
    stack: None,
  };
  assert_eq!(error.to_string(), "Uncaught Error: boom (file:///t.js:3:7)");

  let with_stack = JsError {
    stack: Some("Error: boom\n    at file:///t.js:3:7".to_string()),
    ..error
  };
  assert!(with_stack.to_string().contains("at file:///t.js:3:7"));
}
