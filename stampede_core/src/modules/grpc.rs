//! The `k6/net/grpc` module.
//!
//! `Client.load` reads protobuf definitions through the init-phase
//! filesystems (recording them for the archive); `connect`/`invoke` are
//! VU-phase operations delegated to the [`GrpcTransport`] collaborator.

use crate::js::binding::{
  get_internal_ref, set_function_to, set_internal_ref, set_number_to,
  set_property_to, set_string_to, throw_error, throw_type_error,
};
use crate::js::JsRuntime;
use crate::loader;
use crate::metrics::Sample;
use crate::modules::tags_from_object;
use crate::prelude::*;

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One unary invocation result.
#[derive(Debug, Clone, Default)]
pub struct GrpcResponse {
  /// gRPC status code; 0 is OK.
  pub status: i32,
  pub message_json: String,
  pub headers: Vec<(String, String)>,
  pub trailers: Vec<(String, String)>,
  pub duration_ms: f64,
}

/// The wire-level collaborator.
pub trait GrpcTransport: Send + Sync + Debug {
  /// Registers protobuf definitions, `(filename, contents)` pairs.
  fn load(&self, protos: &[(String, String)]) -> AnyResult<()>;

  fn connect(
    &self,
    addr: &str,
    cancel: &CancellationToken,
  ) -> AnyResult<()>;

  fn invoke(
    &self,
    addr: &str,
    method: &str,
    request_json: &str,
    metadata: &[(String, String)],
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> AnyResult<GrpcResponse>;
}

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);

  let template = v8::FunctionTemplate::new(scope, client_constructor);
  template.instance_template(scope).set_internal_field_count(1);
  let class_name = v8::String::new(scope, "Client").unwrap();
  template.set_class_name(class_name);
  let func = template.get_function(scope).unwrap();
  let key = v8::String::new(scope, "Client").unwrap();
  exports.set(scope, key.into(), func.into());

  exports
}

#[derive(Debug, Default)]
struct ClientState {
  addr: Option<String>,
}

type ClientRc = Rc<RefCell<ClientState>>;

/// `new Client()`
fn client_constructor(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let this = args.this();
  let state: ClientRc = Rc::new(RefCell::new(ClientState::default()));
  set_internal_ref(scope, this, 0, state);
  set_function_to(scope, this, "load", client_load);
  set_function_to(scope, this, "connect", client_connect);
  set_function_to(scope, this, "invoke", client_invoke);
  set_function_to(scope, this, "close", client_close);
  rv.set(this.into());
}

/// `client.load(importPaths, ...protoFiles)`: init-phase only, so every
/// definition the test needs ends up in the archive.
fn client_load(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if state_rc.borrow().vu.is_some() {
    throw_error(
      scope,
      "load() must be called in the init context",
    );
    return;
  }

  // The first argument is an array of import paths; resolution happens
  // against them, then against the current module.
  let mut import_paths: Vec<String> = vec![];
  if args.get(0).is_array() {
    let array = v8::Local::<v8::Array>::try_from(args.get(0)).unwrap();
    for i in 0..array.length() {
      if let Some(path) = array.get_index(scope, i) {
        import_paths.push(path.to_rust_string_lossy(scope));
      }
    }
  }

  let (pwd, fs, recording) = {
    let state = state_rc.borrow();
    (state.current_pwd.clone(), state.fs.clone(), state.init_recording)
  };

  let mut protos: Vec<(String, String)> = vec![];
  for i in 1..args.length() {
    let name = args.get(i).to_rust_string_lossy(scope);

    let mut found = None;
    let mut bases: Vec<url::Url> = vec![pwd.clone()];
    for import_path in &import_paths {
      if let Ok(base) = loader::resolve(&pwd, &format!("{}/", import_path.trim_end_matches('/'))) {
        bases.push(base);
      }
    }
    for base in &bases {
      let Ok(url) = loader::resolve(base, &name) else { continue };
      let data = if recording {
        match loader::load(&fs, &url) {
          Ok(data) => {
            state_rc
              .borrow_mut()
              .files
              .insert(url.to_string(), data.clone());
            data
          }
          Err(_) => continue,
        }
      } else {
        match state_rc.borrow().files.get(url.as_str()) {
          Some(data) => data.clone(),
          None => continue,
        }
      };
      found = Some(String::from_utf8_lossy(&data).to_string());
      break;
    }

    match found {
      Some(contents) => protos.push((name, contents)),
      None => {
        throw_error(scope, &format!("proto file {name:?} not found"));
        return;
      }
    }
  }

  // Definitions are parsed by the transport at connect time; stash them on
  // the runtime for the VU phase.
  state_rc.borrow_mut().grpc_protos.extend(protos);
}

/// `client.connect(addr, params?)`
fn client_connect(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("grpc.connect") {
    throw_error(scope, &e.to_string());
    return;
  }
  if args.length() == 0 || !args.get(0).is_string() {
    throw_type_error(scope, "connect() requires an address");
    return;
  }
  let addr = args.get(0).to_rust_string_lossy(scope);

  let (transport, cancel, protos) = {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    (vu.grpc.clone(), vu.cancel.clone(), state.grpc_protos.clone())
  };
  let Some(transport) = transport else {
    throw_error(scope, "no grpc transport configured for this run");
    return;
  };

  if let Err(e) = transport.load(&protos) {
    throw_error(scope, &format!("loading proto definitions failed: {e}"));
    return;
  }
  match transport.connect(&addr, &cancel) {
    Ok(()) => {
      let this = args.this();
      get_internal_ref::<ClientRc>(scope, this, 0)
        .borrow_mut()
        .addr = Some(addr);
      rv.set(v8::Boolean::new(scope, true).into());
    }
    Err(e) => throw_error(scope, &format!("connect failed: {e}")),
  }
}

/// `client.invoke(method, request, params?)`
fn client_invoke(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("grpc.invoke") {
    throw_error(scope, &e.to_string());
    return;
  }
  if args.length() < 1 || !args.get(0).is_string() {
    throw_type_error(scope, "invoke() requires a method name");
    return;
  }
  let method = args.get(0).to_rust_string_lossy(scope);

  let addr = {
    let this = args.this();
    get_internal_ref::<ClientRc>(scope, this, 0).borrow().addr.clone()
  };
  let Some(addr) = addr else {
    throw_error(scope, "invoke() called before connect()");
    return;
  };

  let request_json = if args.length() > 1 && !args.get(1).is_null_or_undefined()
  {
    v8::json::stringify(scope, args.get(1))
      .map(|s| s.to_rust_string_lossy(scope))
      .unwrap_or_else(|| "{}".to_string())
  } else {
    "{}".to_string()
  };

  let mut metadata: Vec<(String, String)> = vec![];
  let mut timeout = Duration::from_secs(60);
  if args.length() > 2 && args.get(2).is_object() {
    let params = args.get(2).to_object(scope).unwrap();
    let metadata_key = v8::String::new(scope, "metadata").unwrap();
    if let Some(m) = params
      .get(scope, metadata_key.into())
      .filter(|v| v.is_object())
    {
      for (k, v) in tags_from_object(scope, m).iter() {
        metadata.push((k.to_string(), v.to_string()));
      }
    }
    let timeout_key = v8::String::new(scope, "timeout").unwrap();
    if let Some(t) = params
      .get(scope, timeout_key.into())
      .filter(|v| v.is_number())
    {
      let ms = t.number_value(scope).unwrap_or(60_000.0).max(0.0);
      timeout = Duration::from_millis(ms as u64);
    }
  }

  let (transport, cancel) = {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    (vu.grpc.clone(), vu.cancel.clone())
  };
  let Some(transport) = transport else {
    throw_error(scope, "no grpc transport configured for this run");
    return;
  };

  let response = match transport.invoke(
    &addr,
    &method,
    &request_json,
    &metadata,
    timeout,
    &cancel,
  ) {
    Ok(response) => response,
    Err(e) => {
      throw_error(scope, &format!("invoke failed: {e}"));
      return;
    }
  };

  // One duration sample per invocation.
  {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    let mut tags = vu.sample_tags();
    tags.set("method", method.clone());
    tags.set("url", format!("{addr}/{method}"));
    tags.set("status", response.status.to_string());
    vu.emit(vec![Sample::now(
      vu.builtin_metrics.grpc_req_duration.clone(),
      response.duration_ms,
      Arc::new(tags),
    )]);
  }

  let object = v8::Object::new(scope);
  set_number_to(scope, object, "status", response.status as f64);
  let message_text = v8::String::new(scope, &response.message_json).unwrap();
  let message = v8::json::parse(scope, message_text)
    .unwrap_or_else(|| v8::null(scope).into());
  set_property_to(scope, object, "message", message);
  let headers = v8::Object::new(scope);
  for (name, value) in &response.headers {
    set_string_to(scope, headers, name, value);
  }
  set_property_to(scope, object, "headers", headers.into());
  let trailers = v8::Object::new(scope);
  for (name, value) in &response.trailers {
    set_string_to(scope, trailers, name, value);
  }
  set_property_to(scope, object, "trailers", trailers.into());
  rv.set(object.into());
}

/// `client.close()`
fn client_close(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let this = args.this();
  get_internal_ref::<ClientRc>(scope, this, 0).borrow_mut().addr = None;
}
