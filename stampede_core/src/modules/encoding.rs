//! The `k6/encoding` module: base64 variants and hex.

use crate::js::binding::{set_function_to, throw_error, throw_type_error};
use crate::modules::{array_buffer_from_bytes, bytes_from_value};

use base64::engine::general_purpose::{
  STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD,
};
use base64::engine::GeneralPurpose;
use base64::Engine;

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "b64encode", b64encode);
  set_function_to(scope, exports, "b64decode", b64decode);
  set_function_to(scope, exports, "hexEncode", hex_encode);
  exports
}

fn variant(name: &str) -> Option<&'static GeneralPurpose> {
  match name {
    "std" | "" => Some(&STANDARD),
    "rawstd" => Some(&STANDARD_NO_PAD),
    "url" => Some(&URL_SAFE),
    "rawurl" => Some(&URL_SAFE_NO_PAD),
    _ => None,
  }
}

/// `b64encode(input, variant?)`
fn b64encode(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Some(input) = bytes_from_value(scope, args.get(0)) else {
    throw_type_error(scope, "input must be a string or binary data");
    return;
  };
  let name = if args.length() > 1 && args.get(1).is_string() {
    args.get(1).to_rust_string_lossy(scope)
  } else {
    String::new()
  };
  let Some(engine) = variant(&name) else {
    throw_type_error(scope, &format!("invalid base64 variant {name:?}"));
    return;
  };
  let encoded = engine.encode(&input);
  rv.set(v8::String::new(scope, &encoded).unwrap().into());
}

/// `b64decode(input, variant?, format?)`: returns an ArrayBuffer, or a
/// string when `format` is `"s"`.
fn b64decode(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let input = args.get(0).to_rust_string_lossy(scope);
  let name = if args.length() > 1 && args.get(1).is_string() {
    args.get(1).to_rust_string_lossy(scope)
  } else {
    String::new()
  };
  let Some(engine) = variant(&name) else {
    throw_type_error(scope, &format!("invalid base64 variant {name:?}"));
    return;
  };
  let decoded = match engine.decode(input.as_bytes()) {
    Ok(decoded) => decoded,
    Err(e) => {
      throw_error(scope, &format!("invalid base64 input: {e}"));
      return;
    }
  };

  let as_string = args.length() > 2
    && args.get(2).to_rust_string_lossy(scope) == "s";
  if as_string {
    let text = String::from_utf8_lossy(&decoded);
    rv.set(v8::String::new(scope, &text).unwrap().into());
  } else {
    rv.set(array_buffer_from_bytes(scope, decoded).into());
  }
}

/// `hexEncode(input)`
fn hex_encode(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Some(input) = bytes_from_value(scope, args.get(0)) else {
    throw_type_error(scope, "input must be a string or binary data");
    return;
  };
  let encoded = hex::encode(&input);
  rv.set(v8::String::new(scope, &encoded).unwrap().into());
}
