//! The `k6` base module: `group`, `check`, `sleep`, `fail`, `randomSeed`.

use crate::group::GROUP_SEPARATOR;
use crate::js::binding::{
  reseed_rng, set_function_to, throw_error, throw_type_error,
};
use crate::js::JsRuntime;
use crate::metrics::Sample;
use crate::modules::tags_from_object;
use crate::prelude::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "group", group);
  set_function_to(scope, exports, "check", check);
  set_function_to(scope, exports, "sleep", sleep);
  set_function_to(scope, exports, "fail", fail);
  set_function_to(scope, exports, "randomSeed", random_seed);
  exports
}

/// `group(name, fn)`: runs `fn` under a child of the current group. The
/// pointer is restored on every exit path, exceptions included.
fn group(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("group") {
    throw_error(scope, &e.to_string());
    return;
  }

  if args.length() < 2 || !args.get(1).is_function() {
    throw_type_error(scope, "group() requires a name and a function");
    return;
  }
  let name = args.get(0).to_rust_string_lossy(scope);
  if name.is_empty() || name.contains(GROUP_SEPARATOR) {
    throw_type_error(
      scope,
      &format!("invalid group name {name:?}: it cannot be empty or contain {GROUP_SEPARATOR:?}"),
    );
    return;
  }
  let body = v8::Local::<v8::Function>::try_from(args.get(1)).unwrap();

  // Push.
  let previous = {
    let mut state = state_rc.borrow_mut();
    let vu = state.vu.as_mut().unwrap();
    let current = vu.group.clone();
    vu.group = current.child(&name);
    current
  };

  let (result, exception) = {
    let tc_scope = &mut v8::TryCatch::new(scope);
    let undefined = v8::undefined(tc_scope).into();
    match body.call(tc_scope, undefined, &[]) {
      Some(value) => (Some(v8::Global::new(tc_scope, value)), None),
      None => {
        let exception = tc_scope
          .exception()
          .map(|e| v8::Global::new(tc_scope, e));
        (None, exception)
      }
    }
  };

  // Pop, even when the body threw.
  {
    let mut state = state_rc.borrow_mut();
    let vu = state.vu.as_mut().unwrap();
    vu.group = previous;
  }

  match (result, exception) {
    (Some(value), _) => {
      let value = v8::Local::new(scope, value);
      if value.is_undefined() {
        rv.set(v8::Boolean::new(scope, true).into());
      } else {
        rv.set(value);
      }
    }
    (None, Some(exception)) => {
      let exception = v8::Local::new(scope, exception);
      scope.throw_exception(exception);
    }
    (None, None) => {
      // Terminated mid-body; nothing to rethrow.
    }
  }
}

/// `check(value, { name: predicate, ... }, tags?)`: evaluates every
/// predicate, bumps the counters and emits one sample per check on the
/// builtin checks metric. Returns true iff all passed.
fn check(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("check") {
    throw_error(scope, &e.to_string());
    return;
  }

  if args.length() < 2 || !args.get(1).is_object() {
    throw_type_error(scope, "check() requires a value and a set of checks");
    return;
  }
  let value = args.get(0);
  let sets = args.get(1).to_object(scope).unwrap();
  let extra_tags = if args.length() > 2 {
    tags_from_object(scope, args.get(2))
  } else {
    Default::default()
  };

  let names = match sets
    .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
  {
    Some(names) => names,
    None => {
      rv.set(v8::Boolean::new(scope, true).into());
      return;
    }
  };

  let mut all_passed = true;
  for i in 0..names.length() {
    let key = match names.get_index(scope, i) {
      Some(key) => key,
      None => continue,
    };
    let name = key.to_rust_string_lossy(scope);
    let predicate = sets.get(scope, key).unwrap_or_else(|| value);

    let passed = if predicate.is_function() {
      let func = v8::Local::<v8::Function>::try_from(predicate).unwrap();
      let tc_scope = &mut v8::TryCatch::new(scope);
      let undefined = v8::undefined(tc_scope).into();
      match func.call(tc_scope, undefined, &[value]) {
        Some(result) => result.boolean_value(tc_scope),
        None => {
          // A throwing predicate aborts the whole check() call.
          tc_scope.rethrow();
          return;
        }
      }
    } else {
      predicate.boolean_value(scope)
    };

    let mut state = state_rc.borrow_mut();
    let vu = state.vu.as_mut().unwrap();
    let check = vu.group.check(&name);
    check.record(passed);

    let mut tags = vu.sample_tags();
    tags.merge(&extra_tags);
    tags.set("check", check.name.clone());
    tags.set("check_id", check.id.clone());
    let sample = Sample::now(
      vu.builtin_metrics.checks.clone(),
      if passed { 1.0 } else { 0.0 },
      Arc::new(tags),
    );
    if !passed {
      all_passed = false;
      vu.tainted = true;
    }
    vu.emit(vec![sample]);
  }

  rv.set(v8::Boolean::new(scope, all_passed).into());
}

/// `sleep(seconds)`: suspends the VU until the timer fires or the iteration
/// context is cancelled, whichever comes first. Negative values sleep 0.
fn sleep(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let seconds = args.get(0).number_value(scope).unwrap_or(0.0);
  let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };

  let state_rc = JsRuntime::state(scope);
  let cancel = state_rc.borrow().cancel_token();

  let deadline = Instant::now() + Duration::from_secs_f64(seconds);
  loop {
    if cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false) {
      return;
    }
    let now = Instant::now();
    if now >= deadline {
      return;
    }
    let remaining = deadline - now;
    std::thread::sleep(remaining.min(Duration::from_millis(50)));
  }
}

/// `fail(message)`: throws unconditionally, failing the iteration.
fn fail(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let message = if args.length() > 0 {
    args.get(0).to_rust_string_lossy(scope)
  } else {
    "failed".to_string()
  };
  throw_error(scope, &message);
}

/// `randomSeed(n)`: makes `Math.random` deterministic for this VU.
fn random_seed(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let seed = args.get(0).number_value(scope).unwrap_or(0.0);
  let state_rc = JsRuntime::state(scope);
  let mut state = state_rc.borrow_mut();
  reseed_rng(&mut state, seed as u64);
}
