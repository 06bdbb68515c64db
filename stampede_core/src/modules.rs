//! Builtin module registry.
//!
//! Reserved specifiers (`k6`, `k6/...`) resolve here instead of the
//! filesystems. Each builtin is a factory producing a per-runtime exports
//! object whose members are native functions bound to the owning VU through
//! the isolate's state slot.

use crate::js::binding::set_property_to;
use crate::js::JsRuntime;
use crate::prelude::*;

use url::Url;

pub mod base;
pub mod crypto;
pub mod data;
pub mod encoding;
pub mod execution;
pub mod grpc;
pub mod html;
pub mod http;
pub mod metrics;
pub mod ws;

/// A factory building one builtin module's exports object.
pub type BuiltinFactory =
  for<'s> fn(&mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Object>;

/// Maps a reserved module name to its factory.
pub fn builtin_factory(name: &str) -> Option<BuiltinFactory> {
  match name {
    "k6" => Some(base::exports),
    "k6/crypto" => Some(crypto::exports),
    "k6/crypto/x509" => Some(crypto::x509::exports),
    "k6/data" => Some(data::exports),
    "k6/encoding" => Some(encoding::exports),
    "k6/execution" => Some(execution::exports),
    "k6/html" => Some(html::exports),
    "k6/http" => Some(http::exports),
    "k6/metrics" => Some(metrics::exports),
    "k6/net/grpc" => Some(grpc::exports),
    "k6/ws" => Some(ws::exports),
    _ => None,
  }
}

/// Resolves a `builtin://` URL to the (per-runtime cached) module instance.
pub fn require_builtin<'s>(
  scope: &mut v8::HandleScope<'s>,
  url: &Url,
) -> AnyResult<v8::Local<'s, v8::Value>> {
  let name = format!("{}{}", url.host_str().unwrap_or(""), url.path());

  let state_rc = JsRuntime::state(scope);
  {
    let state = state_rc.borrow();
    if let Some(cached) = state.builtins.get(&name) {
      let cached = cached.clone();
      drop(state);
      return Ok(v8::Local::new(scope, cached).into());
    }
  }

  let factory = builtin_factory(&name)
    .ok_or_else(|| ResolveError::UnknownModule(name.clone()))?;
  let exports = factory(scope);

  // A `default` self-reference so `import x from "k6/..."` finds the
  // module itself.
  set_property_to(scope, exports, "default", exports.into());

  state_rc
    .borrow_mut()
    .builtins
    .insert(name, v8::Global::new(scope, exports));
  Ok(exports.into())
}

/// Reads a `{key: value}` object into a [`TagSet`]. Non-object values give
/// an empty set.
pub fn tags_from_object(
  scope: &mut v8::HandleScope,
  value: v8::Local<v8::Value>,
) -> crate::metrics::TagSet {
  let mut tags = crate::metrics::TagSet::new();
  let Some(object) = value.to_object(scope) else {
    return tags;
  };
  if !value.is_object() {
    return tags;
  }
  let Some(names) =
    object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
  else {
    return tags;
  };
  for i in 0..names.length() {
    let Some(key) = names.get_index(scope, i) else {
      continue;
    };
    let Some(entry) = object.get(scope, key) else {
      continue;
    };
    tags.set(
      &key.to_rust_string_lossy(scope),
      entry.to_rust_string_lossy(scope),
    );
  }
  tags
}

/// Reads a JS value as bytes: strings as UTF-8, ArrayBuffers and typed
/// array views verbatim.
pub fn bytes_from_value(
  scope: &mut v8::HandleScope,
  value: v8::Local<v8::Value>,
) -> Option<Vec<u8>> {
  if value.is_string() {
    return Some(value.to_rust_string_lossy(scope).into_bytes());
  }
  if value.is_array_buffer() {
    let buffer = v8::Local::<v8::ArrayBuffer>::try_from(value).ok()?;
    let store = buffer.get_backing_store();
    let data = store.data()?;
    let slice = unsafe {
      std::slice::from_raw_parts(data.as_ptr() as *const u8, store.byte_length())
    };
    return Some(slice.to_vec());
  }
  if value.is_array_buffer_view() {
    let view = v8::Local::<v8::ArrayBufferView>::try_from(value).ok()?;
    let mut buf = vec![0u8; view.byte_length()];
    let copied = view.copy_contents(&mut buf);
    buf.truncate(copied);
    return Some(buf);
  }
  None
}

/// Builds an `ArrayBuffer` from raw bytes.
pub fn array_buffer_from_bytes<'s>(
  scope: &mut v8::HandleScope<'s>,
  bytes: Vec<u8>,
) -> v8::Local<'s, v8::ArrayBuffer> {
  let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
  v8::ArrayBuffer::with_backing_store(scope, &store)
}
