//! The `k6/execution` module: read-only accessors for the current VU,
//! iteration and scenario.

use crate::js::binding::throw_error;
use crate::js::JsRuntime;
use crate::prelude::*;

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);

  let vu = {
    let template = v8::ObjectTemplate::new(scope);
    add_accessor(scope, template, "idInTest", vu_id_in_test);
    add_accessor(scope, template, "idInInstance", vu_id_in_instance);
    add_accessor(scope, template, "iterationInScenario", vu_iteration);
    template.new_instance(scope).unwrap()
  };
  let vu_key = v8::String::new(scope, "vu").unwrap();
  exports.set(scope, vu_key.into(), vu.into());

  let scenario = {
    let template = v8::ObjectTemplate::new(scope);
    add_accessor(scope, template, "name", scenario_name);
    template.new_instance(scope).unwrap()
  };
  let scenario_key = v8::String::new(scope, "scenario").unwrap();
  exports.set(scope, scenario_key.into(), scenario.into());

  exports
}

fn add_accessor(
  scope: &mut v8::HandleScope,
  template: v8::Local<v8::ObjectTemplate>,
  name: &'static str,
  getter: impl v8::MapFnTo<v8::AccessorNameGetterCallback>,
) {
  let key = v8::String::new(scope, name).unwrap();
  template.set_accessor(key.into(), getter);
}

fn vu_id_in_test(
  scope: &mut v8::HandleScope,
  _key: v8::Local<v8::Name>,
  _args: v8::PropertyCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  match state.vu.as_ref() {
    Some(vu) => rv.set_double(vu.id as f64),
    None => {
      drop(state);
      throw_error(
        scope,
        &ContractError::ForbiddenInInitContext("execution.vu").to_string(),
      );
    }
  }
}

fn vu_id_in_instance(
  scope: &mut v8::HandleScope,
  _key: v8::Local<v8::Name>,
  _args: v8::PropertyCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  match state.vu.as_ref() {
    Some(vu) => rv.set_double(vu.id_instance as f64),
    None => {
      drop(state);
      throw_error(
        scope,
        &ContractError::ForbiddenInInitContext("execution.vu").to_string(),
      );
    }
  }
}

fn vu_iteration(
  scope: &mut v8::HandleScope,
  _key: v8::Local<v8::Name>,
  _args: v8::PropertyCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  match state.vu.as_ref() {
    Some(vu) => rv.set_double(vu.iteration as f64),
    None => {
      drop(state);
      throw_error(
        scope,
        &ContractError::ForbiddenInInitContext("execution.vu").to_string(),
      );
    }
  }
}

fn scenario_name(
  scope: &mut v8::HandleScope,
  _key: v8::Local<v8::Name>,
  _args: v8::PropertyCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  match state.vu.as_ref() {
    Some(vu) => {
      let name = vu.scenario.clone().unwrap_or_else(|| "default".to_string());
      drop(state);
      rv.set(v8::String::new(scope, &name).unwrap().into());
    }
    None => {
      drop(state);
      throw_error(
        scope,
        &ContractError::ForbiddenInInitContext("execution.scenario").to_string(),
      );
    }
  }
}
