//! Js runtime bindings: the low-level Rust glue installed into every
//! context, plus the globals of the script surface (`console`, `__ENV`,
//! `__VU`, `__ITER`, `require`, `open`, timers).

use crate::js::compiler::CompatMode;
use crate::js::eventloop::TaskPayload;
use crate::js::module;
use crate::js::JsRuntime;
use crate::loader;
use crate::prelude::*;

use rand::Rng;
use rand::SeedableRng;
use std::cell::Cell;
use std::ffi::c_void;
use std::rc::Rc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Populates a new JavaScript context with low-level Rust bindings.
pub fn create_new_context<'s>(
  scope: &mut v8::HandleScope<'s, ()>,
) -> v8::Local<'s, v8::Context> {
  let context = v8::Context::new(scope, Default::default());
  let global = context.global(scope);
  let scope = &mut v8::ContextScope::new(scope, context);

  // `console`
  {
    let console = create_object_under(scope, global, "console");
    set_function_to(scope, console, "log", console_log);
    set_function_to(scope, console, "debug", console_debug);
    set_function_to(scope, console, "info", console_info);
    set_function_to(scope, console, "warn", console_warn);
    set_function_to(scope, console, "error", console_error);
  }

  // Timers
  {
    set_function_to(scope, global, "setTimeout", set_timeout);
    set_function_to(scope, global, "clearTimeout", clear_timeout);
  }

  context
}

/// Installs the globals that read runtime state: `__ENV`, `__VU`, `__ITER`,
/// `require`, `open`, the `Math.random` override, and (in extended mode)
/// `global`. Runs once the state slot is in place.
pub fn install_globals(scope: &mut v8::HandleScope) {
  let context = scope.get_current_context();
  let global = context.global(scope);

  let state_rc = JsRuntime::state(scope);
  let (env, compat_mode, pwd) = {
    let state = state_rc.borrow();
    (
      state.options.env.clone(),
      state.options.compat_mode,
      state.pwd.clone(),
    )
  };

  // `__ENV` snapshot. Mutations stay inside this runtime, hence this VU.
  {
    let env_obj = v8::Object::new(scope);
    for (key, value) in env.iter() {
      let k = v8::String::new(scope, key).unwrap();
      let v = v8::String::new(scope, value).unwrap();
      env_obj.set(scope, k.into(), v.into());
    }
    set_property_to(scope, global, "__ENV", env_obj.into());
  }

  set_integer_to(scope, global, "__VU", 0);
  set_integer_to(scope, global, "__ITER", 0);

  // `require` bound to the main module's URL; each module body later gets
  // its own copy bound to that module.
  {
    let require_fn = module::make_require(scope, pwd.as_str());
    set_property_to(scope, global, "require", require_fn.into());
  }

  set_function_to(scope, global, "open", open);

  // Deterministic `Math.random` once `randomSeed` was called.
  {
    let math_key = v8::String::new(scope, "Math").unwrap();
    if let Some(math) = global
      .get(scope, math_key.into())
      .and_then(|m| m.to_object(scope))
    {
      set_function_to(scope, math, "random", math_random);
    }
  }

  if compat_mode == CompatMode::Extended {
    set_property_to(scope, global, "global", global.into());
  }
}

/// Updates the `__VU` / `__ITER` globals; the driver calls this around
/// activations and iterations.
pub fn set_vu_globals(scope: &mut v8::HandleScope, vu: u64, iter: u64) {
  let context = scope.get_current_context();
  let global = context.global(scope);
  set_number_to(scope, global, "__VU", vu as f64);
  set_number_to(scope, global, "__ITER", iter as f64);
}

// Console {

fn console_join(
  scope: &mut v8::HandleScope,
  args: &v8::FunctionCallbackArguments,
) -> String {
  let mut parts: Vec<String> = Vec::with_capacity(args.length() as usize);
  for i in 0..args.length() {
    let value = args.get(i);
    let rendered = if value.is_string() {
      value.to_rust_string_lossy(scope)
    } else if value.is_undefined() {
      "undefined".to_string()
    } else if value.is_function() {
      value.to_rust_string_lossy(scope)
    } else {
      v8::json::stringify(scope, value)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_else(|| value.to_rust_string_lossy(scope))
    };
    parts.push(rendered);
  }

  // Printf-style joining when the first argument is a format string.
  if parts.len() > 1 && parts[0].contains('%') {
    let mut out = String::new();
    let mut rest = parts[1..].iter();
    let mut chars = parts[0].chars().peekable();
    while let Some(c) = chars.next() {
      if c == '%' {
        match chars.peek() {
          Some('s') | Some('d') | Some('i') | Some('j') | Some('o') => {
            chars.next();
            match rest.next() {
              Some(arg) => out.push_str(arg),
              None => out.push('%'),
            }
            continue;
          }
          Some('%') => {
            chars.next();
            out.push('%');
            continue;
          }
          _ => {}
        }
      }
      out.push(c);
    }
    for leftover in rest {
      out.push(' ');
      out.push_str(leftover);
    }
    return out;
  }

  parts.join(" ")
}

macro_rules! console_fn {
  ($name:ident, $level:ident) => {
    fn $name(
      scope: &mut v8::HandleScope,
      args: v8::FunctionCallbackArguments,
      _rv: v8::ReturnValue,
    ) {
      // Objects as first argument emit as structured fields.
      let message = console_join(scope, &args);
      if args.length() > 0 && args.get(0).is_object() {
        $level!(target: "console", fields = %message);
      } else {
        $level!(target: "console", "{message}");
      }
    }
  };
}

console_fn!(console_log, info);
console_fn!(console_debug, debug);
console_fn!(console_info, info);
console_fn!(console_warn, warn);
console_fn!(console_error, error);

// Console }

// open {

/// Javascript `open(path, mode?)` API, init phase only.
fn open(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);

  {
    let state = state_rc.borrow();
    if state.vu.is_some() {
      drop(state);
      throw_error(scope, &ContractError::OpenOutsideInit.to_string());
      return;
    }
  }

  if args.length() == 0 || !args.get(0).is_string() {
    throw_type_error(scope, "open() requires a file path");
    return;
  }
  let path = args.get(0).to_rust_string_lossy(scope);
  if path.is_empty() {
    throw_type_error(scope, "open() requires a non-empty file path");
    return;
  }
  let binary = args.length() > 1
    && args.get(1).to_rust_string_lossy(scope).contains('b');

  let (pwd, recording) = {
    let state = state_rc.borrow();
    (state.current_pwd.clone(), state.init_recording)
  };

  let url = match loader::resolve(&pwd, &path) {
    Ok(url) => url,
    Err(e) => {
      throw_error(scope, &e.to_string());
      return;
    }
  };

  let data = if recording {
    let fs = state_rc.borrow().fs.clone();
    match loader::load(&fs, &url) {
      Ok(data) => {
        let mut state = state_rc.borrow_mut();
        state.files.insert(url.to_string(), data.clone());
        data
      }
      Err(e) => {
        throw_error(scope, &e.to_string());
        return;
      }
    }
  } else {
    // VU init replay serves from the recorded file set only.
    let state = state_rc.borrow();
    match state.files.get(url.as_str()) {
      Some(data) => data.clone(),
      None => {
        let e = FsError::PathNeverOpenedDuringInit(url.to_string());
        drop(state);
        throw_error(scope, &e.to_string());
        return;
      }
    }
  };

  if binary {
    let store = v8::ArrayBuffer::new_backing_store_from_vec(data).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    rv.set(buffer.into());
  } else {
    let text = String::from_utf8_lossy(&data);
    rv.set(v8::String::new(scope, &text).unwrap().into());
  }
}

// open }

// Timers {

/// Javascript `setTimeout(callback, delay)` API, driven by the event loop.
fn set_timeout(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if args.length() == 0 || !args.get(0).is_function() {
    throw_type_error(scope, "setTimeout() requires a callback");
    return;
  }
  let callback = v8::Local::<v8::Function>::try_from(args.get(0)).unwrap();
  let callback = v8::Global::new(scope, callback);
  let delay = args
    .get(1)
    .number_value(scope)
    .unwrap_or(0.0)
    .max(0.0);

  let mut params: Vec<v8::Global<v8::Value>> = vec![];
  for i in 2..args.length() {
    params.push(v8::Global::new(scope, args.get(i)));
  }

  let state_rc = JsRuntime::state(scope);
  let mut state = state_rc.borrow_mut();

  let token = CancellationToken::new();
  let cancelled = state
    .cancel_token()
    .map(|t| t.child_token())
    .unwrap_or_else(CancellationToken::new);

  let id_cell = Rc::new(Cell::new(0_i32));
  let cont_id = id_cell.clone();
  let continuation = Box::new(
    move |scope: &mut v8::HandleScope, payload: TaskPayload| {
      {
        let state_rc = JsRuntime::state(scope);
        state_rc.borrow_mut().timers.remove(&cont_id.get());
      }
      let fired = payload
        .and_then(|p| p.downcast::<bool>().ok())
        .map(|b| *b)
        .unwrap_or(false);
      if !fired {
        return;
      }
      let undefined = v8::undefined(scope).into();
      let callback = v8::Local::new(scope, callback);
      let args: Vec<v8::Local<v8::Value>> = params
        .iter()
        .map(|arg| v8::Local::new(scope, arg))
        .collect();

      let tc_scope = &mut v8::TryCatch::new(scope);
      callback.call(tc_scope, undefined, &args);
      if tc_scope.has_caught() {
        if let Some(exception) = tc_scope.exception() {
          let exception = v8::Global::new(tc_scope, exception);
          let state_rc = JsRuntime::state(tc_scope);
          state_rc.borrow_mut().exceptions.capture_exception(exception);
        }
      }
    },
  );

  let handle = state.event_loop.register(continuation);
  let timer_id = handle.task_id();
  id_cell.set(timer_id);
  state.timers.insert(timer_id, token.clone());

  state.tokio.spawn(async move {
    tokio::select! {
      _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {
        handle.enqueue(Box::new(true));
      }
      _ = token.cancelled() => {
        handle.enqueue(Box::new(false));
      }
      _ = cancelled.cancelled() => {
        handle.enqueue(Box::new(false));
      }
    }
  });

  rv.set_int32(timer_id);
  trace!("|set_timeout| timer_id:{timer_id}, delay:{delay}");
}

/// Javascript `clearTimeout(id)` API.
fn clear_timeout(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let id = args
    .get(0)
    .int32_value(scope)
    .unwrap_or(0);
  let state_rc = JsRuntime::state(scope);
  let timer = state_rc.borrow_mut().timers.remove(&id);
  if let Some(token) = timer {
    token.cancel();
  }
}

// Timers }

/// `Math.random`, backed by the per-VU deterministic source after
/// `randomSeed` was called.
fn math_random(
  scope: &mut v8::HandleScope,
  _args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let mut state = state_rc.borrow_mut();
  let value = match state.rng.as_mut() {
    Some(rng) => rng.gen::<f64>(),
    None => rand::thread_rng().gen::<f64>(),
  };
  rv.set_double(value);
}

/// Reseeds the per-runtime random source. Used by `randomSeed`.
pub fn reseed_rng(state: &mut crate::js::JsRuntimeState, seed: u64) {
  state.rng = Some(rand::rngs::StdRng::seed_from_u64(seed));
}

// Helpers {

/// Adds a property with the given name and value, into the given object.
pub fn set_property_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &'static str,
  value: v8::Local<v8::Value>,
) {
  let key = v8::String::new(scope, name).unwrap();
  target.set(scope, key.into(), value);
}

/// Adds a read-only property with the given name and value, into the given
/// object.
pub fn set_constant_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &str,
  value: v8::Local<v8::Value>,
) {
  let key = v8::String::new(scope, name).unwrap();
  target.define_own_property(
    scope,
    key.into(),
    value,
    v8::PropertyAttribute::READ_ONLY,
  );
}

pub fn set_integer_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &'static str,
  value: i32,
) {
  let key = v8::String::new(scope, name).unwrap();
  let value = v8::Integer::new(scope, value);
  target.set(scope, key.into(), value.into());
}

pub fn set_number_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &'static str,
  value: f64,
) {
  let key = v8::String::new(scope, name).unwrap();
  let value = v8::Number::new(scope, value);
  target.set(scope, key.into(), value.into());
}

pub fn set_string_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &str,
  value: &str,
) {
  let key = v8::String::new(scope, name).unwrap();
  let value = v8::String::new(scope, value).unwrap();
  target.set(scope, key.into(), value.into());
}

/// Adds a `Function` object which calls the given Rust function.
pub fn set_function_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &'static str,
  callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
  let key = v8::String::new(scope, name).unwrap();
  let template = v8::FunctionTemplate::new(scope, callback);
  let val = template.get_function(scope).unwrap();

  target.set(scope, key.into(), val.into());
}

/// Creates an object with a given name under a `target` object.
pub fn create_object_under<'s>(
  scope: &mut v8::HandleScope<'s>,
  target: v8::Local<v8::Object>,
  name: &'static str,
) -> v8::Local<'s, v8::Object> {
  let value = v8::Object::new(scope);
  let key = v8::String::new(scope, name).unwrap();
  target.set(scope, key.into(), value.into());
  value
}

/// Stores a Rust type inside a v8 object.
pub fn set_internal_ref<T>(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  index: usize,
  data: T,
) -> *mut T {
  let boxed_ref = Box::new(data);
  let addr = Box::into_raw(boxed_ref);
  let v8_ext = v8::External::new(scope, addr as *mut c_void);

  target.set_internal_field(index, v8_ext.into());
  addr
}

/// Gets a previously stored Rust type from a v8 object.
pub fn get_internal_ref<'s, T>(
  scope: &mut v8::HandleScope<'s>,
  source: v8::Local<v8::Object>,
  index: usize,
) -> &'s mut T {
  let v8_ref = source.get_internal_field(scope, index).unwrap();
  let external = v8_ref.cast::<v8::External>();
  let value = external.value() as *mut T;

  unsafe { &mut *value }
}

/// Useful utility to throw v8 exceptions.
pub fn throw_error(scope: &mut v8::HandleScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::error(scope, message);
  scope.throw_exception(exception);
}

/// Useful utility to throw v8 type errors.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::type_error(scope, message);
  scope.throw_exception(exception);
}

/// Useful utility to throw v8 range errors.
pub fn throw_range_error(scope: &mut v8::HandleScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::range_error(scope, message);
  scope.throw_exception(exception);
}

// Helpers }
