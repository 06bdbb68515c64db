//! Guest-side errors with source-mapped stacks.

use crate::prelude::*;

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::rc::Rc;

/// Matches `url:line:column` triples inside a rendered stack trace.
static STACK_POSITION_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"((?:[a-zA-Z][a-zA-Z0-9+.-]*://)[^\s():]+):(\d+):(\d+)").unwrap());

/// A guest exception carried across the native boundary. Positions refer to
/// the original sources once a source map has been applied.
#[derive(Debug, Clone)]
pub struct JsError {
  pub message: String,
  pub resource_name: String,
  pub line: u32,
  pub column: u32,
  pub stack: Option<String>,
}

impl fmt::Display for JsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.stack {
      Some(stack) if !stack.is_empty() => write!(f, "{stack}"),
      _ => write!(
        f,
        "{} ({}:{}:{})",
        self.message, self.resource_name, self.line, self.column
      ),
    }
  }
}

impl std::error::Error for JsError {}

impl JsError {
  /// Builds a [`JsError`] from a caught v8 exception value, resolving stack
  /// positions through `maps` when present.
  pub fn from_v8_exception(
    scope: &mut v8::HandleScope,
    exception: v8::Local<v8::Value>,
    maps: Option<&mut SourceMapCache>,
  ) -> JsError {
    let msg = v8::Exception::create_message(scope, exception);
    let message = msg.get(scope).to_rust_string_lossy(scope);
    let resource_name = msg
      .get_script_resource_name(scope)
      .map(|name| name.to_rust_string_lossy(scope))
      .unwrap_or_else(|| "<unknown>".to_string());
    let mut line = msg.get_line_number(scope).unwrap_or(0) as u32;
    let mut column = msg.get_start_column() as u32;

    // Prefer the `stack` property when the exception carries one.
    let stack = exception
      .to_object(scope)
      .and_then(|obj| {
        let key = v8::String::new(scope, "stack")?;
        obj.get(scope, key.into())
      })
      .filter(|v| v.is_string())
      .map(|v| v.to_rust_string_lossy(scope));

    let stack = match (stack, maps) {
      (Some(stack), Some(maps)) => {
        if let Some((l, c)) = maps.map_position(&resource_name, line, column) {
          line = l;
          column = c;
        }
        Some(maps.resolve_stack(&stack))
      }
      (stack, _) => stack,
    };

    JsError {
      message,
      resource_name,
      line,
      column,
      stack,
    }
  }

  /// A synthetic error for failures with no exception object, e.g. a
  /// rejection whose reason is `null` or `undefined`.
  pub fn from_reason(message: String) -> JsError {
    JsError {
      message,
      resource_name: "<unknown>".to_string(),
      line: 0,
      column: 0,
      stack: None,
    }
  }
}

/// Lazily parsed source maps keyed by program URL. Attached maps cost
/// nothing until the first stack actually renders.
#[derive(Default)]
pub struct SourceMapCache {
  raw: HashMap<String, Vec<u8>>,
  parsed: HashMap<String, Option<Rc<sourcemap::SourceMap>>>,
}

impl SourceMapCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert_raw(&mut self, url: &str, bytes: Vec<u8>) {
    self.raw.insert(url.to_string(), bytes);
    self.parsed.remove(url);
  }

  fn lookup(&mut self, url: &str) -> Option<Rc<sourcemap::SourceMap>> {
    if let Some(parsed) = self.parsed.get(url) {
      return parsed.clone();
    }
    let parsed = self.raw.get(url).and_then(|bytes| {
      match sourcemap::SourceMap::from_slice(bytes) {
        Ok(map) => Some(Rc::new(map)),
        Err(e) => {
          warn!("ignoring malformed source map for {url}: {e}");
          None
        }
      }
    });
    self.parsed.insert(url.to_string(), parsed.clone());
    parsed
  }

  /// Maps a 1-based generated position back to the original source.
  pub fn map_position(
    &mut self,
    url: &str,
    line: u32,
    column: u32,
  ) -> Option<(u32, u32)> {
    let map = self.lookup(url)?;
    let token = map.lookup_token(line.saturating_sub(1), column)?;
    Some((token.get_src_line() + 1, token.get_src_col()))
  }

  /// Rewrites every `url:line:col` occurrence in a rendered stack through
  /// the attached maps.
  pub fn resolve_stack(&mut self, stack: &str) -> String {
    let mut out = String::with_capacity(stack.len());
    let mut last = 0;
    for caps in STACK_POSITION_REGEX.captures_iter(stack).collect::<Vec<_>>() {
      let whole = caps.get(0).unwrap();
      let url = &caps[1];
      let line: u32 = caps[2].parse().unwrap_or(0);
      let column: u32 = caps[3].parse().unwrap_or(0);

      out.push_str(&stack[last..whole.start()]);
      match self.map_position(url, line, column) {
        Some((l, c)) => out.push_str(&format!("{url}:{l}:{c}")),
        None => out.push_str(whole.as_str()),
      }
      last = whole.end();
    }
    out.push_str(&stack[last..]);
    out
  }
}
