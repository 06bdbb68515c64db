//! Source compilation: compat-mode enforcement and the CommonJS rewrite.
//!
//! V8 executes modern JavaScript natively, so the `extended` pipeline only
//! has to rewrite module syntax (`import`/`export`) into the CommonJS form
//! the runtime links with `require`. `base` mode accepts ES5 scripts only
//! and rejects newer constructs with the original source position, the way
//! an ES5-only engine would.

use crate::fs::FsMap;
use crate::js::rewrite;
use crate::loader;
use crate::prelude::*;

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use swc_common::sync::Lrc;
use swc_common::{FileName, SourceMap as SwcSourceMap, Span, Spanned};
use swc_ecma_ast as ast;
use swc_ecma_parser::lexer::Lexer;
use swc_ecma_parser::{EsSyntax, Parser, StringInput, Syntax};
use swc_ecma_visit::{Visit, VisitWith};
use url::Url;

#[cfg(test)]
mod compiler_tests;

/// Matches a `sourceMappingURL` comment; the last one in the file wins.
static SOURCE_MAPPING_URL_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?m)^//[#@]\s*sourceMappingURL=(\S+)\s*$").unwrap());

/// Script compatibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatMode {
  /// ES5 only, no rewrites.
  Base,
  /// Modern syntax; module syntax is rewritten to CommonJS.
  Extended,
}

impl Default for CompatMode {
  fn default() -> Self {
    CompatMode::Extended
  }
}

impl FromStr for CompatMode {
  type Err = ContractError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "base" => Ok(CompatMode::Base),
      "extended" => Ok(CompatMode::Extended),
      other => Err(ContractError::InvalidOption(format!(
        "invalid compatibility mode {other:?}"
      ))),
    }
  }
}

impl std::fmt::Display for CompatMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CompatMode::Base => write!(f, "base"),
      CompatMode::Extended => write!(f, "extended"),
    }
  }
}

/// An immutable compiled representation of one source file. `code` is what
/// V8 compiles inside each runtime; `original` is what the archive stores.
#[derive(Debug, Clone)]
pub struct Program {
  pub url: String,
  pub code: String,
  pub original: String,
  pub source_map: Option<Vec<u8>>,
}

/// Compiles `source` under the given compatibility mode. `fs` is consulted
/// to fetch an external `sourceMappingURL` target; failing to fetch one is
/// logged, never fatal.
pub fn compile(
  url: &Url,
  source: &str,
  mode: CompatMode,
  fs: Option<&FsMap>,
) -> Result<Program, CompileError> {
  let cm: Lrc<SwcSourceMap> = Default::default();
  let fm = cm.new_source_file(
    FileName::Custom(url.to_string()).into(),
    source.to_string(),
  );

  let lexer = Lexer::new(
    Syntax::Es(EsSyntax::default()),
    ast::EsVersion::EsNext,
    StringInput::from(&*fm),
    None,
  );
  let mut parser = Parser::new_from(lexer);

  let program = match parser.parse_program() {
    Ok(program) => program,
    Err(e) => return Err(syntax_error(&cm, url, e.span(), &e.kind().msg())),
  };
  if let Some(e) = parser.take_errors().into_iter().next() {
    return Err(syntax_error(&cm, url, e.span(), &e.kind().msg()));
  }

  match mode {
    CompatMode::Base => {
      if let Some((span, what)) = Es5Guard::check(&program) {
        return Err(syntax_error(
          &cm,
          url,
          span,
          &format!("{what} is not available in base compatibility mode"),
        ));
      }
      Ok(Program {
        url: url.to_string(),
        code: source.to_string(),
        original: source.to_string(),
        source_map: load_external_map(url, source, fs),
      })
    }
    CompatMode::Extended => match program {
      ast::Program::Script(_) => Ok(Program {
        url: url.to_string(),
        code: source.to_string(),
        original: source.to_string(),
        source_map: load_external_map(url, source, fs),
      }),
      ast::Program::Module(module) => {
        let (code, map) = rewrite::module_to_commonjs(cm, module, url)?;
        Ok(Program {
          url: url.to_string(),
          code,
          original: source.to_string(),
          source_map: Some(map),
        })
      }
    },
  }
}

fn syntax_error(
  cm: &SwcSourceMap,
  url: &Url,
  span: Span,
  message: &str,
) -> CompileError {
  let loc = cm.lookup_char_pos(span.lo());
  CompileError::Syntax {
    url: url.to_string(),
    line: loc.line as u32,
    column: loc.col_display as u32,
    message: message.to_string(),
  }
}

/// Fetches the map referenced by a `sourceMappingURL` comment, if any.
/// Inline base64 data URIs decode directly; anything else resolves against
/// the file's URL and loads through the filesystems.
fn load_external_map(
  url: &Url,
  source: &str,
  fs: Option<&FsMap>,
) -> Option<Vec<u8>> {
  let caps = SOURCE_MAPPING_URL_REGEX
    .captures_iter(source)
    .last()?;
  let target = caps.get(1)?.as_str();

  if let Some(data) = target.strip_prefix("data:") {
    let b64 = data.split(',').nth(1)?;
    return match base64::engine::general_purpose::STANDARD.decode(b64) {
      Ok(bytes) => Some(bytes),
      Err(e) => {
        warn!("ignoring malformed inline source map for {url}: {e}");
        None
      }
    };
  }

  let fs = fs?;
  let resolved = match loader::resolve(url, target) {
    Ok(resolved) => resolved,
    Err(e) => {
      warn!("could not resolve source map {target:?} for {url}: {e}");
      return None;
    }
  };
  match loader::load(fs, &resolved) {
    Ok(bytes) => Some(bytes),
    Err(e) => {
      warn!("could not load source map {resolved} for {url}: {e}");
      None
    }
  }
}

/// Flags the first ES6-specific construct in a parsed program. What
/// survives this guard is plain ES5 and compiles anywhere.
#[derive(Default)]
struct Es5Guard {
  violation: Option<(Span, &'static str)>,
}

impl Es5Guard {
  fn check(program: &ast::Program) -> Option<(Span, &'static str)> {
    let mut guard = Es5Guard::default();
    program.visit_with(&mut guard);
    guard.violation
  }

  fn flag(&mut self, span: Span, what: &'static str) {
    if self.violation.is_none() {
      self.violation = Some((span, what));
    }
  }

  fn done(&self) -> bool {
    self.violation.is_some()
  }
}

impl Visit for Es5Guard {
  fn visit_module_decl(&mut self, n: &ast::ModuleDecl) {
    self.flag(n.span(), "module syntax");
  }

  fn visit_arrow_expr(&mut self, n: &ast::ArrowExpr) {
    self.flag(n.span, "an arrow function");
  }

  fn visit_class(&mut self, n: &ast::Class) {
    self.flag(n.span, "a class");
  }

  fn visit_var_decl(&mut self, n: &ast::VarDecl) {
    if n.kind != ast::VarDeclKind::Var {
      self.flag(n.span, "a let/const declaration");
    }
    if !self.done() {
      n.visit_children_with(self);
    }
  }

  fn visit_tpl(&mut self, n: &ast::Tpl) {
    self.flag(n.span, "a template literal");
  }

  fn visit_tagged_tpl(&mut self, n: &ast::TaggedTpl) {
    self.flag(n.span, "a template literal");
  }

  fn visit_spread_element(&mut self, n: &ast::SpreadElement) {
    self.flag(n.expr.span(), "a spread element");
  }

  fn visit_expr_or_spread(&mut self, n: &ast::ExprOrSpread) {
    if let Some(span) = n.spread {
      self.flag(span, "a spread element");
    }
    if !self.done() {
      n.visit_children_with(self);
    }
  }

  fn visit_rest_pat(&mut self, n: &ast::RestPat) {
    self.flag(n.span, "a rest parameter");
  }

  fn visit_array_pat(&mut self, n: &ast::ArrayPat) {
    self.flag(n.span, "a destructuring pattern");
  }

  fn visit_object_pat(&mut self, n: &ast::ObjectPat) {
    self.flag(n.span, "a destructuring pattern");
  }

  fn visit_assign_pat(&mut self, n: &ast::AssignPat) {
    self.flag(n.span, "a default parameter");
  }

  fn visit_function(&mut self, n: &ast::Function) {
    if n.is_async {
      self.flag(n.span, "an async function");
    } else if n.is_generator {
      self.flag(n.span, "a generator function");
    }
    if !self.done() {
      n.visit_children_with(self);
    }
  }

  fn visit_for_of_stmt(&mut self, n: &ast::ForOfStmt) {
    self.flag(n.span, "a for-of statement");
  }

  fn visit_await_expr(&mut self, n: &ast::AwaitExpr) {
    self.flag(n.span, "an await expression");
  }

  fn visit_yield_expr(&mut self, n: &ast::YieldExpr) {
    self.flag(n.span, "a yield expression");
  }

  fn visit_opt_chain_expr(&mut self, n: &ast::OptChainExpr) {
    self.flag(n.span, "optional chaining");
  }

  fn visit_bin_expr(&mut self, n: &ast::BinExpr) {
    match n.op {
      ast::BinaryOp::NullishCoalescing => {
        self.flag(n.span, "the nullish coalescing operator")
      }
      ast::BinaryOp::Exp => self.flag(n.span, "the exponentiation operator"),
      _ => {}
    }
    if !self.done() {
      n.visit_children_with(self);
    }
  }

  fn visit_prop(&mut self, n: &ast::Prop) {
    match n {
      ast::Prop::Shorthand(i) => self.flag(i.span, "a shorthand property"),
      ast::Prop::Method(m) => self.flag(m.function.span, "a method property"),
      _ => {}
    }
    if !self.done() {
      n.visit_children_with(self);
    }
  }

  fn visit_computed_prop_name(&mut self, n: &ast::ComputedPropName) {
    self.flag(n.span, "a computed property name");
  }
}
