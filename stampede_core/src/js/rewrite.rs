//! ES module syntax to CommonJS rewrite.
//!
//! `import`/`export` declarations become `require` calls and
//! `module.exports` assignments; everything else passes through untouched.
//! The emitted code keeps statement order, and a source map back to the
//! original file is produced for stack resolution.
//!
//! Two tiny helpers are provided by the runtime bootstrap (see
//! `runtime/bootstrap.js`): `$$default` picks a module's default export with
//! CommonJS interop, `$$reexport` copies the named exports of one module
//! onto another.

use crate::prelude::*;

use std::io;
use swc_atoms::Atom;
use swc_common::source_map::LineCol;
use swc_common::sync::Lrc;
use swc_common::{BytePos, DUMMY_SP, SourceMap as SwcSourceMap};
use swc_ecma_ast as ast;
use swc_ecma_codegen::text_writer::JsWriter;
use swc_ecma_codegen::Emitter;
use url::Url;

#[cfg(test)]
mod rewrite_tests;

/// Rewrites a parsed ES module into a CommonJS script, returning the code
/// and its source map.
pub fn module_to_commonjs(
  cm: Lrc<SwcSourceMap>,
  module: ast::Module,
  url: &Url,
) -> Result<(String, Vec<u8>), CompileError> {
  let mut cx = Rewriter::default();

  for item in module.body {
    match item {
      ast::ModuleItem::Stmt(stmt) => cx.body.push(stmt),
      ast::ModuleItem::ModuleDecl(decl) => cx.module_decl(decl),
    }
  }

  let mut body = cx.body;
  body.extend(cx.tail);

  let script = ast::Program::Script(ast::Script {
    span: module.span,
    body,
    shebang: None,
  });

  emit(cm, &script, url)
}

fn emit(
  cm: Lrc<SwcSourceMap>,
  program: &ast::Program,
  url: &Url,
) -> Result<(String, Vec<u8>), CompileError> {
  let mut buffer = vec![];
  let mut mappings: Vec<(BytePos, LineCol)> = vec![];

  {
    let cfg = swc_ecma_codegen::Config::default()
      .with_target(ast::EsVersion::EsNext);
    let mut emitter = Emitter {
      cfg,
      cm: cm.clone(),
      comments: None,
      wr: JsWriter::new(cm.clone(), "\n", &mut buffer, Some(&mut mappings)),
    };
    emitter.emit_program(program).map_err(|e: io::Error| {
      CompileError::Transpile {
        url: url.to_string(),
        message: e.to_string(),
      }
    })?;
  }

  let code = String::from_utf8_lossy(&buffer).to_string();
  let map = build_source_map(&cm, &mappings, url);
  Ok((code, map))
}

/// Builds a plain source map from the emitter's position pairs. The map is
/// trusted verbatim by the stack resolver.
fn build_source_map(
  cm: &SwcSourceMap,
  mappings: &[(BytePos, LineCol)],
  url: &Url,
) -> Vec<u8> {
  let mut builder = sourcemap::SourceMapBuilder::new(None);
  let src_id = builder.add_source(url.as_str());

  for (pos, generated) in mappings {
    if pos.0 == 0 {
      continue;
    }
    let loc = cm.lookup_char_pos(*pos);
    builder.add_raw(
      generated.line,
      generated.col,
      (loc.line as u32).saturating_sub(1),
      loc.col_display as u32,
      Some(src_id),
      None,
      false,
    );
  }

  let map = builder.into_sourcemap();
  let mut out = vec![];
  // Serialisation into a Vec cannot fail.
  map.to_writer(&mut out).unwrap();
  out
}

#[derive(Default)]
struct Rewriter {
  body: Vec<ast::Stmt>,
  /// Named local exports resolve at the end of the module so declarations
  /// further down the file are in scope.
  tail: Vec<ast::Stmt>,
  counter: usize,
}

impl Rewriter {
  fn module_decl(&mut self, decl: ast::ModuleDecl) {
    match decl {
      ast::ModuleDecl::Import(import) => self.import_decl(import),
      ast::ModuleDecl::ExportDecl(export) => self.export_decl(export),
      ast::ModuleDecl::ExportDefaultDecl(export) => {
        self.export_default_decl(export)
      }
      ast::ModuleDecl::ExportDefaultExpr(export) => {
        self.body.push(export_assign("default", *export.expr));
      }
      ast::ModuleDecl::ExportNamed(export) => self.export_named(export),
      ast::ModuleDecl::ExportAll(export) => {
        // $$reexport(module.exports, require("src"));
        let call = call_expr(
          ident_expr("$$reexport"),
          vec![module_exports(), require_call(&export.src.value)],
        );
        self.body.push(expr_stmt(call));
      }
      // TypeScript-only forms cannot come out of an ES parse.
      _ => {}
    }
  }

  fn import_decl(&mut self, import: ast::ImportDecl) {
    let src = import.src.value.clone();

    // Side-effect import: `import "module";`
    if import.specifiers.is_empty() {
      self.body.push(expr_stmt(require_call(&src)));
      return;
    }

    let tmp = self.fresh_binding();
    self.body.push(var_stmt(&tmp, require_call(&src)));

    for spec in import.specifiers {
      match spec {
        ast::ImportSpecifier::Default(d) => {
          let init =
            call_expr(ident_expr("$$default"), vec![ident_expr(&tmp)]);
          self.body.push(var_stmt(&d.local.sym, init));
        }
        ast::ImportSpecifier::Namespace(ns) => {
          self.body.push(var_stmt(&ns.local.sym, ident_expr(&tmp)));
        }
        ast::ImportSpecifier::Named(named) => {
          let imported = match &named.imported {
            Some(ast::ModuleExportName::Ident(i)) => i.sym.to_string(),
            Some(ast::ModuleExportName::Str(s)) => s.value.to_string(),
            None => named.local.sym.to_string(),
          };
          let init = if imported == "default" {
            call_expr(ident_expr("$$default"), vec![ident_expr(&tmp)])
          } else {
            member_expr(ident_expr(&tmp), &imported)
          };
          self.body.push(var_stmt(&named.local.sym, init));
        }
      }
    }
  }

  fn export_decl(&mut self, export: ast::ExportDecl) {
    let names = decl_names(&export.decl);
    self.body.push(ast::Stmt::Decl(export.decl));
    for name in names {
      self.tail.push(export_assign(&name, ident_expr(&name)));
    }
  }

  fn export_default_decl(&mut self, export: ast::ExportDefaultDecl) {
    match export.decl {
      ast::DefaultDecl::Fn(fn_expr) => match fn_expr.ident.clone() {
        Some(ident) => {
          let name = ident.sym.to_string();
          self.body.push(ast::Stmt::Decl(ast::Decl::Fn(ast::FnDecl {
            ident,
            declare: false,
            function: fn_expr.function,
          })));
          self.body.push(export_assign("default", ident_expr(&name)));
        }
        None => {
          self
            .body
            .push(export_assign("default", ast::Expr::Fn(fn_expr)));
        }
      },
      ast::DefaultDecl::Class(class_expr) => match class_expr.ident.clone() {
        Some(ident) => {
          let name = ident.sym.to_string();
          self.body.push(ast::Stmt::Decl(ast::Decl::Class(
            ast::ClassDecl {
              ident,
              declare: false,
              class: class_expr.class,
            },
          )));
          self.body.push(export_assign("default", ident_expr(&name)));
        }
        None => {
          self
            .body
            .push(export_assign("default", ast::Expr::Class(class_expr)));
        }
      },
      // `export default interface` is TypeScript.
      ast::DefaultDecl::TsInterfaceDecl(_) => {}
    }
  }

  fn export_named(&mut self, export: ast::NamedExport) {
    match export.src {
      Some(src) => {
        // Re-exports evaluate their source immediately.
        let tmp = self.fresh_binding();
        self.body.push(var_stmt(&tmp, require_call(&src.value)));
        for spec in export.specifiers {
          match spec {
            ast::ExportSpecifier::Named(named) => {
              let orig = export_name(&named.orig);
              let exported = named
                .exported
                .as_ref()
                .map(export_name)
                .unwrap_or_else(|| orig.clone());
              let value = if orig == "default" {
                call_expr(ident_expr("$$default"), vec![ident_expr(&tmp)])
              } else {
                member_expr(ident_expr(&tmp), &orig)
              };
              self.body.push(export_assign(&exported, value));
            }
            ast::ExportSpecifier::Namespace(ns) => {
              let exported = export_name(&ns.name);
              self.body.push(export_assign(&exported, ident_expr(&tmp)));
            }
            ast::ExportSpecifier::Default(d) => {
              let value =
                call_expr(ident_expr("$$default"), vec![ident_expr(&tmp)]);
              self.body.push(export_assign(&d.exported.sym, value));
            }
          }
        }
      }
      None => {
        for spec in export.specifiers {
          if let ast::ExportSpecifier::Named(named) = spec {
            let orig = export_name(&named.orig);
            let exported = named
              .exported
              .as_ref()
              .map(export_name)
              .unwrap_or_else(|| orig.clone());
            self.tail.push(export_assign(&exported, ident_expr(&orig)));
          }
        }
      }
    }
  }

  fn fresh_binding(&mut self) -> String {
    self.counter += 1;
    format!("$$module_{}", self.counter)
  }
}

fn export_name(name: &ast::ModuleExportName) -> String {
  match name {
    ast::ModuleExportName::Ident(i) => i.sym.to_string(),
    ast::ModuleExportName::Str(s) => s.value.to_string(),
  }
}

/// Binding names introduced by an exported declaration.
fn decl_names(decl: &ast::Decl) -> Vec<String> {
  match decl {
    ast::Decl::Fn(f) => vec![f.ident.sym.to_string()],
    ast::Decl::Class(c) => vec![c.ident.sym.to_string()],
    ast::Decl::Var(var) => {
      let mut names = vec![];
      for declarator in &var.decls {
        pat_names(&declarator.name, &mut names);
      }
      names
    }
    _ => vec![],
  }
}

fn pat_names(pat: &ast::Pat, out: &mut Vec<String>) {
  match pat {
    ast::Pat::Ident(ident) => out.push(ident.id.sym.to_string()),
    ast::Pat::Array(array) => {
      for elem in array.elems.iter().flatten() {
        pat_names(elem, out);
      }
    }
    ast::Pat::Object(object) => {
      for prop in &object.props {
        match prop {
          ast::ObjectPatProp::KeyValue(kv) => pat_names(&kv.value, out),
          ast::ObjectPatProp::Assign(assign) => {
            out.push(assign.key.id.sym.to_string())
          }
          ast::ObjectPatProp::Rest(rest) => pat_names(&rest.arg, out),
        }
      }
    }
    ast::Pat::Assign(assign) => pat_names(&assign.left, out),
    ast::Pat::Rest(rest) => pat_names(&rest.arg, out),
    _ => {}
  }
}

// AST construction helpers {

fn ident(sym: &str) -> ast::Ident {
  ast::Ident::new_no_ctxt(Atom::from(sym), DUMMY_SP)
}

fn ident_expr(sym: &str) -> ast::Expr {
  ast::Expr::Ident(ident(sym))
}

fn str_lit(value: &str) -> ast::Expr {
  ast::Expr::Lit(ast::Lit::Str(ast::Str {
    span: DUMMY_SP,
    value: Atom::from(value),
    raw: None,
  }))
}

fn require_call(src: &str) -> ast::Expr {
  call_expr(ident_expr("require"), vec![str_lit(src)])
}

fn call_expr(callee: ast::Expr, args: Vec<ast::Expr>) -> ast::Expr {
  ast::Expr::Call(ast::CallExpr {
    span: DUMMY_SP,
    ctxt: Default::default(),
    callee: ast::Callee::Expr(Box::new(callee)),
    args: args
      .into_iter()
      .map(|expr| ast::ExprOrSpread {
        spread: None,
        expr: Box::new(expr),
      })
      .collect(),
    type_args: None,
  })
}

fn member_expr(obj: ast::Expr, prop: &str) -> ast::Expr {
  ast::Expr::Member(member(obj, prop))
}

fn member(obj: ast::Expr, prop: &str) -> ast::MemberExpr {
  ast::MemberExpr {
    span: DUMMY_SP,
    obj: Box::new(obj),
    prop: ast::MemberProp::Ident(ast::IdentName {
      span: DUMMY_SP,
      sym: Atom::from(prop),
    }),
  }
}

/// `module.exports`
fn module_exports() -> ast::Expr {
  member_expr(ident_expr("module"), "exports")
}

/// `module.exports.<name> = <value>;`
fn export_assign(name: &str, value: ast::Expr) -> ast::Stmt {
  let target = member(module_exports(), name);
  expr_stmt(ast::Expr::Assign(ast::AssignExpr {
    span: DUMMY_SP,
    op: ast::AssignOp::Assign,
    left: ast::AssignTarget::Simple(ast::SimpleAssignTarget::Member(target)),
    right: Box::new(value),
  }))
}

/// `var <name> = <init>;`
fn var_stmt(name: &str, init: ast::Expr) -> ast::Stmt {
  ast::Stmt::Decl(ast::Decl::Var(Box::new(ast::VarDecl {
    span: DUMMY_SP,
    ctxt: Default::default(),
    kind: ast::VarDeclKind::Var,
    declare: false,
    decls: vec![ast::VarDeclarator {
      span: DUMMY_SP,
      name: ast::Pat::Ident(ast::BindingIdent {
        id: ident(name),
        type_ann: None,
      }),
      init: Some(Box::new(init)),
      definite: false,
    }],
  })))
}

fn expr_stmt(expr: ast::Expr) -> ast::Stmt {
  ast::Stmt::Expr(ast::ExprStmt {
    span: DUMMY_SP,
    expr: Box::new(expr),
  })
}

// AST construction helpers }
