//! The `k6/ws` module.
//!
//! The session model is a synchronous event pump: `connect` runs the user's
//! handler to register callbacks, then pumps transport events into them
//! until the socket closes or the iteration context is cancelled. The wire
//! lives behind [`WsTransport`].

use crate::js::binding::{
  get_internal_ref, set_function_to, set_internal_ref, set_number_to,
  set_string_to, throw_error, throw_type_error,
};
use crate::js::JsRuntime;
use crate::metrics::{Sample, TagSet};
use crate::modules::tags_from_object;
use crate::prelude::*;

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One event read off the wire.
#[derive(Debug, Clone)]
pub enum WsEvent {
  Message(String),
  Binary(Vec<u8>),
  Ping,
  Pong,
  Error(String),
  Close(u16),
}

/// A live connection, owned by one VU for the duration of a session.
pub trait WsConnection: Send {
  fn send(&mut self, message: &str) -> AnyResult<()>;
  fn send_binary(&mut self, data: &[u8]) -> AnyResult<()>;
  fn close(&mut self, code: u16) -> AnyResult<()>;
  /// Blocks up to `timeout` for the next event. `Ok(None)` means no event
  /// arrived yet.
  fn next_event(
    &mut self,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> AnyResult<Option<WsEvent>>;
}

/// The wire-level collaborator.
pub trait WsTransport: Send + Sync + Debug {
  fn connect(
    &self,
    url: &str,
    headers: &[(String, String)],
    cancel: &CancellationToken,
  ) -> AnyResult<Box<dyn WsConnection>>;
}

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "connect", connect);
  exports
}

struct SocketState {
  conn: Box<dyn WsConnection>,
  handlers: HashMap<String, Vec<v8::Global<v8::Function>>>,
  closed: bool,
  msgs_sent: u64,
  msgs_received: u64,
}

type SocketRc = Rc<RefCell<SocketState>>;

/// `connect(url, params?, handler)`
fn connect(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("ws.connect") {
    throw_error(scope, &e.to_string());
    return;
  }

  if args.length() == 0 || !args.get(0).is_string() {
    throw_type_error(scope, "connect() requires a url");
    return;
  }
  let url = args.get(0).to_rust_string_lossy(scope);

  // (url, handler) or (url, params, handler)
  let (params, handler) = if args.get(1).is_function() {
    (v8::undefined(scope).into(), args.get(1))
  } else {
    (args.get(1), args.get(2))
  };
  if !handler.is_function() {
    throw_type_error(scope, "connect() requires a handler function");
    return;
  }
  let handler = v8::Local::<v8::Function>::try_from(handler).unwrap();

  let mut headers: Vec<(String, String)> = vec![];
  let mut user_tags = TagSet::new();
  if params.is_object() {
    let object = params.to_object(scope).unwrap();
    let headers_key = v8::String::new(scope, "headers").unwrap();
    if let Some(h) = object.get(scope, headers_key.into()).filter(|v| v.is_object()) {
      for (k, v) in tags_from_object(scope, h).iter() {
        headers.push((k.to_string(), v.to_string()));
      }
    }
    let tags_key = v8::String::new(scope, "tags").unwrap();
    if let Some(t) = object.get(scope, tags_key.into()).filter(|v| v.is_object()) {
      user_tags = tags_from_object(scope, t);
    }
  }

  let (transport, cancel) = {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    (vu.ws.clone(), vu.cancel.clone())
  };
  let Some(transport) = transport else {
    throw_error(scope, "no websocket transport configured for this run");
    return;
  };

  let started = Instant::now();
  let conn = match transport.connect(&url, &headers, &cancel) {
    Ok(conn) => conn,
    Err(e) => {
      let object = v8::Object::new(scope);
      set_string_to(scope, object, "url", &url);
      set_number_to(scope, object, "status", 0.0);
      set_string_to(scope, object, "error", &e.to_string());
      rv.set(object.into());
      return;
    }
  };
  let connecting_ms = started.elapsed().as_secs_f64() * 1000.0;

  let socket_state: SocketRc = Rc::new(RefCell::new(SocketState {
    conn,
    handlers: HashMap::new(),
    closed: false,
    msgs_sent: 0,
    msgs_received: 0,
  }));

  let socket = new_socket_object(scope, socket_state.clone());

  // Run the handler so it can register callbacks and send.
  {
    let tc_scope = &mut v8::TryCatch::new(scope);
    let undefined = v8::undefined(tc_scope).into();
    if handler.call(tc_scope, undefined, &[socket.into()]).is_none() {
      let _ = socket_state.borrow_mut().conn.close(1000);
      tc_scope.rethrow();
      return;
    }
  }

  dispatch(scope, &socket_state, "open", None);

  // Pump events until close or cancellation.
  while !socket_state.borrow().closed && !cancel.is_cancelled() {
    let event = {
      let mut state = socket_state.borrow_mut();
      state.conn.next_event(Duration::from_millis(100), &cancel)
    };
    match event {
      Ok(Some(WsEvent::Message(message))) => {
        socket_state.borrow_mut().msgs_received += 1;
        let arg = v8::String::new(scope, &message).unwrap().into();
        dispatch(scope, &socket_state, "message", Some(arg));
      }
      Ok(Some(WsEvent::Binary(data))) => {
        socket_state.borrow_mut().msgs_received += 1;
        let arg = crate::modules::array_buffer_from_bytes(scope, data).into();
        dispatch(scope, &socket_state, "binaryMessage", Some(arg));
      }
      Ok(Some(WsEvent::Ping)) => dispatch(scope, &socket_state, "ping", None),
      Ok(Some(WsEvent::Pong)) => dispatch(scope, &socket_state, "pong", None),
      Ok(Some(WsEvent::Error(error))) => {
        let arg = v8::String::new(scope, &error).unwrap().into();
        dispatch(scope, &socket_state, "error", Some(arg));
        break;
      }
      Ok(Some(WsEvent::Close(code))) => {
        let arg = v8::Integer::new(scope, code as i32).into();
        dispatch(scope, &socket_state, "close", Some(arg));
        break;
      }
      Ok(None) => {}
      Err(e) => {
        let arg = v8::String::new(scope, &e.to_string()).unwrap().into();
        dispatch(scope, &socket_state, "error", Some(arg));
        break;
      }
    }
    if scope.is_execution_terminating() {
      break;
    }
  }

  let _ = socket_state.borrow_mut().conn.close(1000);
  let session_ms = started.elapsed().as_secs_f64() * 1000.0;

  // Session metrics.
  {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    let m = &vu.builtin_metrics;
    let mut tags = vu.sample_tags();
    tags.merge(&user_tags);
    tags.set("url", url.clone());
    let tags = Arc::new(tags);
    let socket = socket_state.borrow();
    vu.emit(vec![
      Sample::now(m.ws_sessions.clone(), 1.0, tags.clone()),
      Sample::now(m.ws_connecting.clone(), connecting_ms, tags.clone()),
      Sample::now(m.ws_session_duration.clone(), session_ms, tags.clone()),
      Sample::now(m.ws_msgs_sent.clone(), socket.msgs_sent as f64, tags.clone()),
      Sample::now(
        m.ws_msgs_received.clone(),
        socket.msgs_received as f64,
        tags.clone(),
      ),
    ]);
  }

  let response = v8::Object::new(scope);
  set_string_to(scope, response, "url", &url);
  set_number_to(scope, response, "status", 101.0);
  rv.set(response.into());
}

/// Calls every handler registered for `event`. A throwing handler aborts
/// the pump by re-raising; `connect`'s caller sees the exception.
fn dispatch(
  scope: &mut v8::HandleScope,
  socket: &SocketRc,
  event: &str,
  arg: Option<v8::Local<v8::Value>>,
) {
  let handlers: Vec<v8::Global<v8::Function>> = socket
    .borrow()
    .handlers
    .get(event)
    .cloned()
    .unwrap_or_default();
  for handler in handlers {
    let handler = v8::Local::new(scope, handler);
    let undefined = v8::undefined(scope).into();
    let args: Vec<v8::Local<v8::Value>> = arg.into_iter().collect();
    if handler.call(scope, undefined, &args).is_none() {
      socket.borrow_mut().closed = true;
      return;
    }
  }
}

fn new_socket_object<'s>(
  scope: &mut v8::HandleScope<'s>,
  state: SocketRc,
) -> v8::Local<'s, v8::Object> {
  let template = v8::ObjectTemplate::new(scope);
  template.set_internal_field_count(1);
  let object = template.new_instance(scope).unwrap();
  set_internal_ref(scope, object, 0, state);
  set_function_to(scope, object, "on", socket_on);
  set_function_to(scope, object, "send", socket_send);
  set_function_to(scope, object, "sendBinary", socket_send_binary);
  set_function_to(scope, object, "close", socket_close);
  object
}

fn socket_state<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: &v8::FunctionCallbackArguments,
) -> SocketRc {
  let this = args.this();
  get_internal_ref::<SocketRc>(scope, this, 0).clone()
}

/// `socket.on(event, handler)`
fn socket_on(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  if args.length() < 2 || !args.get(1).is_function() {
    throw_type_error(scope, "on() requires an event name and a handler");
    return;
  }
  let event = args.get(0).to_rust_string_lossy(scope);
  let handler = v8::Local::<v8::Function>::try_from(args.get(1)).unwrap();
  let handler = v8::Global::new(scope, handler);

  let socket = socket_state(scope, &args);
  socket
    .borrow_mut()
    .handlers
    .entry(event)
    .or_default()
    .push(handler);
}

/// `socket.send(message)`
fn socket_send(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let message = args.get(0).to_rust_string_lossy(scope);
  let socket = socket_state(scope, &args);
  let mut state = socket.borrow_mut();
  match state.conn.send(&message) {
    Ok(()) => state.msgs_sent += 1,
    Err(e) => {
      drop(state);
      throw_error(scope, &format!("send failed: {e}"));
    }
  }
}

/// `socket.sendBinary(data)`
fn socket_send_binary(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let Some(data) = crate::modules::bytes_from_value(scope, args.get(0)) else {
    throw_type_error(scope, "sendBinary() requires binary data");
    return;
  };
  let socket = socket_state(scope, &args);
  let mut state = socket.borrow_mut();
  match state.conn.send_binary(&data) {
    Ok(()) => state.msgs_sent += 1,
    Err(e) => {
      drop(state);
      throw_error(scope, &format!("send failed: {e}"));
    }
  }
}

/// `socket.close(code?)`
fn socket_close(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let code = args.get(0).integer_value(scope).unwrap_or(1000) as u16;
  let socket = socket_state(scope, &args);
  let mut state = socket.borrow_mut();
  state.closed = true;
  if let Err(e) = state.conn.close(code) {
    trace!("ws close failed: {e}");
  }
}
