//! The `k6/metrics` module: user-declared Counter/Gauge/Rate/Trend.

use crate::js::binding::{
  get_internal_ref, set_function_to, set_internal_ref, set_string_to,
  throw_error, throw_type_error,
};
use crate::js::JsRuntime;
use crate::metrics::{Metric, MetricType, Sample, ValueType};
use crate::modules::tags_from_object;
use crate::prelude::*;

use std::sync::Arc;

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  add_constructor(scope, exports, "Counter", MetricType::Counter);
  add_constructor(scope, exports, "Gauge", MetricType::Gauge);
  add_constructor(scope, exports, "Rate", MetricType::Rate);
  add_constructor(scope, exports, "Trend", MetricType::Trend);
  exports
}

fn add_constructor(
  scope: &mut v8::HandleScope,
  exports: v8::Local<v8::Object>,
  name: &'static str,
  metric_type: MetricType,
) {
  let data = v8::Integer::new(scope, metric_type_tag(metric_type));
  let template = v8::FunctionTemplate::builder(constructor)
    .data(data.into())
    .build(scope);
  template.instance_template(scope).set_internal_field_count(1);
  let class_name = v8::String::new(scope, name).unwrap();
  template.set_class_name(class_name);
  let func = template.get_function(scope).unwrap();
  let key = v8::String::new(scope, name).unwrap();
  exports.set(scope, key.into(), func.into());
}

fn metric_type_tag(metric_type: MetricType) -> i32 {
  match metric_type {
    MetricType::Counter => 0,
    MetricType::Gauge => 1,
    MetricType::Rate => 2,
    MetricType::Trend => 3,
  }
}

fn metric_type_from_tag(tag: i32) -> MetricType {
  match tag {
    0 => MetricType::Counter,
    1 => MetricType::Gauge,
    2 => MetricType::Rate,
    _ => MetricType::Trend,
  }
}

/// `new Counter(name, isTime?)` and friends. Declaration is an init-phase
/// operation; `add` is the VU-phase one.
fn constructor(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if args.length() == 0 || !args.get(0).is_string() {
    throw_type_error(scope, "metric constructors require a name");
    return;
  }
  let name = args.get(0).to_rust_string_lossy(scope);
  let is_time = args.length() > 1 && args.get(1).boolean_value(scope);
  let metric_type =
    metric_type_from_tag(args.data().int32_value(scope).unwrap_or(3));
  let value_type = if is_time { ValueType::Time } else { ValueType::Default };

  let state_rc = JsRuntime::state(scope);
  let registry = state_rc.borrow().registry.clone();
  let metric = match registry.register(&name, metric_type, value_type) {
    Ok(metric) => metric,
    Err(e) => {
      throw_error(scope, &e.to_string());
      return;
    }
  };

  let this = args.this();
  set_internal_ref(scope, this, 0, metric);
  set_string_to(scope, this, "name", &name);
  set_function_to(scope, this, "add", add);
  rv.set(this.into());
}

/// `metric.add(value, tags?)`
fn add(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("metric.add") {
    throw_error(scope, &e.to_string());
    return;
  }

  let value = match args.get(0).number_value(scope) {
    Some(value) if value.is_finite() => value,
    _ => {
      // Booleans coerce for rate metrics; everything else is an error.
      if args.get(0).is_boolean() {
        if args.get(0).boolean_value(scope) { 1.0 } else { 0.0 }
      } else {
        throw_type_error(scope, "metric value must be a finite number");
        return;
      }
    }
  };

  let extra_tags = if args.length() > 1 {
    tags_from_object(scope, args.get(1))
  } else {
    Default::default()
  };

  let this = args.this();
  let metric = get_internal_ref::<Arc<Metric>>(scope, this, 0).clone();

  let mut state = state_rc.borrow_mut();
  let vu = state.vu.as_mut().unwrap();
  let mut tags = vu.sample_tags();
  tags.merge(&extra_tags);
  vu.emit(vec![Sample::now(metric, value, Arc::new(tags))]);

  rv.set(v8::Boolean::new(scope, true).into());
}
