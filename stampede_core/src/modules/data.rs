//! The `k6/data` module: `SharedArray`.
//!
//! The factory runs once per process; the resulting elements are stored as
//! JSON strings and materialised read-only into each runtime. Nothing
//! mutable is ever shared between VUs.

use crate::js::binding::{set_function_to, throw_error, throw_type_error};
use crate::js::JsRuntime;
use crate::prelude::*;

use parking_lot::RwLock;
use std::sync::Arc;

/// The process-wide store of constructed shared arrays, keyed by name.
#[derive(Debug, Default)]
pub struct SharedArrayRegistry {
  arrays: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl SharedArrayRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, name: &str) -> Option<Arc<Vec<String>>> {
    self.arrays.read().get(name).cloned()
  }

  pub fn insert(&self, name: &str, values: Vec<String>) -> Arc<Vec<String>> {
    let values = Arc::new(values);
    self.arrays.write().insert(name.to_string(), values.clone());
    values
  }

  pub fn contains(&self, name: &str) -> bool {
    self.arrays.read().contains_key(name)
  }
}

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "SharedArray", shared_array);
  exports
}

/// `new SharedArray(name, factory)`
fn shared_array(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if args.length() < 1 || !args.get(0).is_string() {
    throw_type_error(scope, "SharedArray requires a name");
    return;
  }
  let name = args.get(0).to_rust_string_lossy(scope);
  if name.is_empty() {
    throw_type_error(scope, "SharedArray requires a non-empty name");
    return;
  }

  let state_rc = JsRuntime::state(scope);
  let registry = state_rc.borrow().shared_arrays.clone();

  let values = match registry.get(&name) {
    Some(values) => values,
    None => {
      // First construction anywhere in the process: run the factory. VU
      // code cannot introduce new shared state.
      if state_rc.borrow().vu.is_some() {
        throw_error(
          scope,
          &ContractError::ForbiddenInInitContext("SharedArray").to_string(),
        );
        return;
      }
      if args.length() < 2 || !args.get(1).is_function() {
        throw_type_error(scope, "SharedArray requires a factory function");
        return;
      }
      let factory = v8::Local::<v8::Function>::try_from(args.get(1)).unwrap();
      let undefined = v8::undefined(scope).into();
      let Some(result) = factory.call(scope, undefined, &[]) else {
        return;
      };
      if !result.is_array() {
        throw_type_error(scope, "SharedArray factory must return an array");
        return;
      }
      let array = v8::Local::<v8::Array>::try_from(result).unwrap();
      let mut values = Vec::with_capacity(array.length() as usize);
      for i in 0..array.length() {
        let element = array
          .get_index(scope, i)
          .unwrap_or_else(|| v8::undefined(scope).into());
        let rendered = v8::json::stringify(scope, element)
          .map(|s| s.to_rust_string_lossy(scope))
          .unwrap_or_else(|| "null".to_string());
        values.push(rendered);
      }
      registry.insert(&name, values)
    }
  };

  // Materialise: parse each element, freeze the whole thing, wrap in the
  // read-only facade.
  let array = v8::Array::new(scope, values.len() as i32);
  for (i, value) in values.iter().enumerate() {
    let text = v8::String::new(scope, value).unwrap();
    let parsed = v8::json::parse(scope, text)
      .unwrap_or_else(|| v8::undefined(scope).into());
    freeze_deep(scope, parsed);
    array.set_index(scope, i as u32, parsed);
  }
  array.set_integrity_level(scope, v8::IntegrityLevel::Frozen);

  let global = scope.get_current_context().global(scope);
  let facade_key = v8::String::new(scope, "$$sharedarray").unwrap();
  let facade = global
    .get(scope, facade_key.into())
    .and_then(|f| v8::Local::<v8::Function>::try_from(f).ok());
  match facade {
    Some(facade) => {
      let undefined = v8::undefined(scope).into();
      if let Some(proxy) = facade.call(scope, undefined, &[array.into()]) {
        rv.set(proxy);
      }
    }
    None => rv.set(array.into()),
  }
}

fn freeze_deep(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) {
  if !value.is_object() {
    return;
  }
  let Some(object) = value.to_object(scope) else { return };
  object.set_integrity_level(scope, v8::IntegrityLevel::Frozen);
  let Some(names) =
    object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
  else {
    return;
  };
  for i in 0..names.length() {
    let Some(key) = names.get_index(scope, i) else { continue };
    if let Some(child) = object.get(scope, key) {
      freeze_deep(scope, child);
    }
  }
}
