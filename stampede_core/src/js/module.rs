//! CommonJS module machinery.
//!
//! Compiled programs are cached once per bundle; every runtime (the init
//! one and each VU) re-executes them into its own exports objects, so
//! module-level state never crosses a VU boundary. Cycles get the standard
//! CommonJS treatment: a re-entrant `require` sees the partially populated
//! exports object.

use crate::js::binding::{set_property_to, throw_error};
use crate::js::compiler::Program;
use crate::js::err::JsError;
use crate::js::JsRuntime;
use crate::loader;
use crate::modules;
use crate::prelude::*;

use parking_lot::RwLock;
use std::sync::Arc;
use url::Url;

/// Per-bundle cache of compiled programs, keyed by canonical URL. Insertion
/// order is preserved for the archive.
#[derive(Debug, Default)]
pub struct ProgramCache {
  inner: RwLock<ProgramCacheInner>,
}

#[derive(Debug, Default)]
struct ProgramCacheInner {
  map: HashMap<String, Arc<Program>>,
  order: Vec<String>,
}

impl ProgramCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, url: &str) -> Option<Arc<Program>> {
    self.inner.read().map.get(url).cloned()
  }

  pub fn insert(&self, program: Arc<Program>) {
    let mut inner = self.inner.write();
    if !inner.map.contains_key(&program.url) {
      inner.order.push(program.url.clone());
      inner.map.insert(program.url.clone(), program);
    }
  }

  pub fn contains(&self, url: &str) -> bool {
    self.inner.read().map.contains_key(url)
  }

  /// All programs in first-compile order.
  pub fn ordered(&self) -> Vec<Arc<Program>> {
    let inner = self.inner.read();
    inner
      .order
      .iter()
      .filter_map(|url| inner.map.get(url).cloned())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.read().order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.read().order.is_empty()
  }
}

/// One runtime's module instances. An absent key is unvisited; `InProgress`
/// entries exist only while a module's top level runs.
#[derive(Debug)]
pub enum ModuleState {
  InProgress(v8::Global<v8::Value>),
  Done(v8::Global<v8::Value>),
}

#[derive(Debug, Default)]
pub struct ModuleCache {
  entries: HashMap<String, ModuleState>,
}

impl ModuleCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn exports(&self, url: &str) -> Option<&v8::Global<v8::Value>> {
    match self.entries.get(url) {
      Some(ModuleState::InProgress(exports)) => Some(exports),
      Some(ModuleState::Done(exports)) => Some(exports),
      None => None,
    }
  }

  pub fn insert(&mut self, url: &str, state: ModuleState) {
    self.entries.insert(url.to_string(), state);
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

/// Create v8 script origin.
pub fn create_origin<'s>(
  scope: &mut v8::HandleScope<'s, ()>,
  name: &str,
  is_module: bool,
) -> v8::ScriptOrigin<'s> {
  let name = v8::String::new(scope, name).unwrap();
  let source_map = v8::undefined(scope);

  v8::ScriptOrigin::new(
    scope,
    name.into(),
    0,
    0,
    false,
    0,
    Some(source_map.into()),
    false,
    false,
    is_module,
    None,
  )
}

/// Builds a `require` function bound to the URL of the requiring module, so
/// relative specifiers resolve against it.
pub fn make_require<'s>(
  scope: &mut v8::HandleScope<'s>,
  base: &str,
) -> v8::Local<'s, v8::Function> {
  let base = v8::String::new(scope, base).unwrap();
  let builder = v8::Function::builder(require_cb).data(base.into());
  builder.build(scope).unwrap()
}

/// Javascript `require(specifier)` API.
fn require_cb(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if args.length() == 0 {
    throw_error(scope, "require() needs a module specifier");
    return;
  }
  let specifier = args.get(0).to_rust_string_lossy(scope);
  let base = args.data().to_rust_string_lossy(scope);
  let base = match Url::parse(&base) {
    Ok(base) => base,
    Err(e) => {
      throw_error(scope, &format!("invalid require base {base:?}: {e}"));
      return;
    }
  };

  let url = match loader::resolve(&base, &specifier) {
    Ok(url) => url,
    Err(e) => {
      throw_error(scope, &e.to_string());
      return;
    }
  };
  trace!("|require| base:{base}, specifier:{specifier:?} -> {url}");

  match require_module(scope, &url) {
    Ok(exports) => rv.set(exports),
    Err(e) => throw_error(scope, &e.to_string()),
  }
}

/// Resolves a canonical URL to its exports value, executing the module's
/// program on first visit in this runtime.
pub fn require_module<'s>(
  scope: &mut v8::HandleScope<'s>,
  url: &Url,
) -> AnyResult<v8::Local<'s, v8::Value>> {
  if url.scheme() == loader::BUILTIN_SCHEME {
    return modules::require_builtin(scope, url);
  }

  let state_rc = JsRuntime::state(scope);
  let key = url.as_str().to_string();

  // Cache hit, including the in-progress case during cycles.
  {
    let state = state_rc.borrow();
    if let Some(exports) = state.modules.exports(&key) {
      let exports = exports.clone();
      drop(state);
      return Ok(v8::Local::new(scope, exports));
    }
  }

  // Program lookup: the bundle cache first, then (during init only) the
  // filesystems.
  let program = {
    let state = state_rc.borrow();
    state.programs.get(&key)
  };
  let program = match program {
    Some(program) => program,
    None => {
      let (recording, fs, compat_mode) = {
        let state = state_rc.borrow();
        (state.init_recording, state.fs.clone(), state.options.compat_mode)
      };
      if !recording {
        anyhow::bail!(ResolveError::ModuleNotFound(key));
      }
      let bytes = loader::load(&fs, url).map_err(|e| {
        anyhow::anyhow!(match e.downcast_ref::<FsError>() {
          Some(FsError::NotFound(_)) => {
            ResolveError::ModuleNotFound(key.clone()).to_string()
          }
          _ => e.to_string(),
        })
      })?;
      let source = String::from_utf8_lossy(&bytes);
      let program = Arc::new(crate::js::compiler::compile(
        url,
        &source,
        compat_mode,
        Some(&fs),
      )?);
      {
        let mut state = state_rc.borrow_mut();
        state.programs.insert(program.clone());
        if let Some(map) = &program.source_map {
          state.sourcemaps.insert_raw(&program.url, map.clone());
        }
      }
      program
    }
  };

  execute_program(scope, &program, url)
}

/// Executes a compiled program with a fresh `module`/`exports` pair and
/// returns the final `module.exports`.
fn execute_program<'s>(
  scope: &mut v8::HandleScope<'s>,
  program: &Program,
  url: &Url,
) -> AnyResult<v8::Local<'s, v8::Value>> {
  let state_rc = JsRuntime::state(scope);
  let key = url.as_str();

  let module_obj = v8::Object::new(scope);
  let exports_obj = v8::Object::new(scope);
  set_property_to(scope, module_obj, "exports", exports_obj.into());

  {
    let mut state = state_rc.borrow_mut();
    state.modules.insert(
      key,
      ModuleState::InProgress(v8::Global::new(
        scope,
        v8::Local::<v8::Value>::from(exports_obj),
      )),
    );
  }

  // The wrapper shares line 1 with the user's first line, so positions stay
  // aligned apart from a column offset on that line.
  let wrapped =
    format!("(function (module, exports, require) {{{}\n}})", program.code);

  let prev_pwd = {
    let mut state = state_rc.borrow_mut();
    let prev = state.current_pwd.clone();
    state.current_pwd = url.clone();
    prev
  };

  let result = (|| -> Result<(), JsError> {
    let tc_scope = &mut v8::TryCatch::new(scope);
    let origin = create_origin(tc_scope, key, false);
    let source = v8::String::new(tc_scope, &wrapped).unwrap();

    let script = v8::Script::compile(tc_scope, source, Some(&origin))
      .ok_or_else(|| caught_error(tc_scope))?;
    let wrapper = script.run(tc_scope).ok_or_else(|| caught_error(tc_scope))?;
    let wrapper = v8::Local::<v8::Function>::try_from(wrapper)
      .map_err(|_| JsError::from_reason("module wrapper is not callable".into()))?;

    let require_fn = make_require(tc_scope, key);
    let undefined = v8::undefined(tc_scope);
    wrapper
      .call(
        tc_scope,
        undefined.into(),
        &[module_obj.into(), exports_obj.into(), require_fn.into()],
      )
      .ok_or_else(|| caught_error(tc_scope))?;
    Ok(())
  })();

  {
    let mut state = state_rc.borrow_mut();
    state.current_pwd = prev_pwd;
  }
  result?;

  // `module.exports` may have been reassigned wholesale.
  let exports_key = v8::String::new(scope, "exports").unwrap();
  let final_exports = module_obj
    .get(scope, exports_key.into())
    .unwrap_or_else(|| v8::undefined(scope).into());

  {
    let mut state = state_rc.borrow_mut();
    state
      .modules
      .insert(key, ModuleState::Done(v8::Global::new(scope, final_exports)));
  }

  Ok(final_exports)
}

pub(crate) fn caught_error(
  tc_scope: &mut v8::TryCatch<v8::HandleScope>,
) -> JsError {
  if tc_scope.has_terminated() {
    return JsError::from_reason("execution terminated".to_string());
  }
  match tc_scope.exception() {
    Some(exception) => {
      let state_rc = JsRuntime::state(tc_scope);
      let mut state = state_rc.borrow_mut();
      JsError::from_v8_exception(tc_scope, exception, Some(&mut state.sourcemaps))
    }
    None => JsError::from_reason("unknown error".to_string()),
  }
}
