//! The `k6/http` module.
//!
//! The JS surface, parameter handling, cookie semantics, redirect policy,
//! tagging and sample emission are all here; the wire itself lives behind
//! [`HttpTransport`], which the embedding engine provides.

use crate::bundle::options::parse_duration;
use crate::js::binding::{
  get_internal_ref, set_function_to, set_internal_ref, set_number_to,
  set_property_to, set_string_to, throw_error, throw_type_error,
};
use crate::js::JsRuntime;
use crate::metrics::{Sample, SystemTag, TagSet};
use crate::modules::{bytes_from_value, tags_from_object};
use crate::modules::html::selection_from_source;
use crate::modules::http::cookiejar::CookieJar;
use crate::prelude::*;

use base64::Engine;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod cookiejar;

/// One wire request, after the core applied params, cookies and redirects.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub timeout: Duration,
}

/// Wire-level timings in milliseconds, as reported by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTimings {
  pub blocked: f64,
  pub connecting: f64,
  pub tls_handshaking: f64,
  pub sending: f64,
  pub waiting: f64,
  pub receiving: f64,
  pub duration: f64,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
  pub status: u16,
  pub status_text: String,
  pub proto: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub timings: HttpTimings,
  pub error: Option<String>,
  pub error_code: u32,
  pub tls_version: Option<String>,
  pub ocsp_status: Option<String>,
}

impl HttpResponse {
  pub fn failed(&self) -> bool {
    self.error.is_some() || self.status >= 400 || self.status == 0
  }

  fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// The wire-level collaborator.
pub trait HttpTransport: Send + Sync + Debug {
  fn round_trip(
    &self,
    request: &HttpRequest,
    cancel: &CancellationToken,
  ) -> AnyResult<HttpResponse>;
}

/// The default transport when the embedder wires none in.
#[derive(Debug, Default)]
pub struct NoTransport;

impl HttpTransport for NoTransport {
  fn round_trip(
    &self,
    _request: &HttpRequest,
    _cancel: &CancellationToken,
  ) -> AnyResult<HttpResponse> {
    anyhow::bail!("no http transport configured for this run")
  }
}

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "request", request);
  set_function_to(scope, exports, "get", get);
  set_function_to(scope, exports, "head", head);
  set_function_to(scope, exports, "post", post);
  set_function_to(scope, exports, "put", put);
  set_function_to(scope, exports, "patch", patch);
  set_function_to(scope, exports, "del", del);
  set_function_to(scope, exports, "options", options_method);
  set_function_to(scope, exports, "batch", batch);
  set_function_to(scope, exports, "file", file);
  set_function_to(scope, exports, "cookieJar", cookie_jar);
  set_function_to(scope, exports, "CookieJar", new_cookie_jar);
  exports
}

// Params {

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseType {
  Text,
  Binary,
  None,
}

struct Params {
  headers: Vec<(String, String)>,
  cookies: Vec<(String, String)>,
  tags: TagSet,
  timeout: Duration,
  redirects: Option<u32>,
  response_type: ResponseType,
}

impl Default for Params {
  fn default() -> Self {
    Self {
      headers: vec![],
      cookies: vec![],
      tags: TagSet::new(),
      timeout: Duration::from_secs(60),
      redirects: None,
      response_type: ResponseType::Text,
    }
  }
}

fn parse_params(
  scope: &mut v8::HandleScope,
  value: v8::Local<v8::Value>,
) -> Result<Params, String> {
  let mut params = Params::default();
  if !value.is_object() {
    return Ok(params);
  }
  let object = value.to_object(scope).unwrap();

  let headers_key = v8::String::new(scope, "headers").unwrap();
  if let Some(headers) = object
    .get(scope, headers_key.into())
    .filter(|v| v.is_object())
  {
    for (k, v) in tags_from_object(scope, headers).iter() {
      params.headers.push((k.to_string(), v.to_string()));
    }
  }

  let cookies_key = v8::String::new(scope, "cookies").unwrap();
  if let Some(cookies) = object
    .get(scope, cookies_key.into())
    .filter(|v| v.is_object())
  {
    // Either `name: "value"` or `name: {value: "...", replace: bool}`; a
    // replace cookie overrides the jar for this request only.
    let cookies_obj = cookies.to_object(scope).unwrap();
    let names = cookies_obj
      .get_own_property_names(scope, v8::GetPropertyNamesArgs::default());
    if let Some(names) = names {
      for i in 0..names.length() {
        let Some(key) = names.get_index(scope, i) else { continue };
        let name = key.to_rust_string_lossy(scope);
        let Some(entry) = cookies_obj.get(scope, key) else { continue };
        let value = if entry.is_object() {
          let entry = entry.to_object(scope).unwrap();
          let value_key = v8::String::new(scope, "value").unwrap();
          entry
            .get(scope, value_key.into())
            .map(|v| v.to_rust_string_lossy(scope))
            .unwrap_or_default()
        } else {
          entry.to_rust_string_lossy(scope)
        };
        params.cookies.push((name, value));
      }
    }
  }

  let tags_key = v8::String::new(scope, "tags").unwrap();
  if let Some(tags) = object.get(scope, tags_key.into()).filter(|v| v.is_object())
  {
    params.tags = tags_from_object(scope, tags);
  }

  let timeout_key = v8::String::new(scope, "timeout").unwrap();
  if let Some(timeout) = object.get(scope, timeout_key.into()) {
    if timeout.is_number() {
      let ms = timeout.number_value(scope).unwrap_or(60_000.0).max(0.0);
      params.timeout = Duration::from_millis(ms as u64);
    } else if timeout.is_string() {
      let text = timeout.to_rust_string_lossy(scope);
      params.timeout = parse_duration(&text)
        .map_err(|e| format!("invalid timeout: {e}"))?;
    }
  }

  let redirects_key = v8::String::new(scope, "redirects").unwrap();
  if let Some(redirects) = object
    .get(scope, redirects_key.into())
    .filter(|v| v.is_number())
  {
    params.redirects =
      Some(redirects.integer_value(scope).unwrap_or(0).max(0) as u32);
  }

  let rt_key = v8::String::new(scope, "responseType").unwrap();
  if let Some(rt) = object.get(scope, rt_key.into()).filter(|v| v.is_string()) {
    params.response_type = match rt.to_rust_string_lossy(scope).as_str() {
      "binary" => ResponseType::Binary,
      "none" => ResponseType::None,
      _ => ResponseType::Text,
    };
  }

  Ok(params)
}

// Params }

// Request flow {

fn method_entry(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  rv: v8::ReturnValue,
  method: &str,
  body_index: i32,
) {
  let url = args.get(0);
  if !url.is_string() {
    throw_type_error(scope, "request url must be a string");
    return;
  }
  let url = url.to_rust_string_lossy(scope);
  let body = if body_index >= 0 { args.get(body_index) } else {
    v8::undefined(scope).into()
  };
  let params = args.get(body_index.max(0) + 1);
  let mut rv = rv;
  if let Some(response) = perform_request(scope, method, &url, body, params) {
    rv.set(response);
  }
}

fn request(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let method = args.get(0).to_rust_string_lossy(scope).to_uppercase();
  let url = args.get(1).to_rust_string_lossy(scope);
  let body = args.get(2);
  let params = args.get(3);
  if let Some(response) = perform_request(scope, &method, &url, body, params) {
    rv.set(response);
  }
}

macro_rules! http_method {
  ($name:ident, $method:expr, $body_index:expr) => {
    fn $name(
      scope: &mut v8::HandleScope,
      args: v8::FunctionCallbackArguments,
      rv: v8::ReturnValue,
    ) {
      method_entry(scope, args, rv, $method, $body_index);
    }
  };
}

http_method!(get, "GET", -1);
http_method!(head, "HEAD", -1);
http_method!(post, "POST", 1);
http_method!(put, "PUT", 1);
http_method!(patch, "PATCH", 1);
http_method!(del, "DELETE", 1);
http_method!(options_method, "OPTIONS", 1);

/// The whole request pipeline. Returns `None` when a JS exception was
/// thrown instead of producing a response object.
fn perform_request<'s>(
  scope: &mut v8::HandleScope<'s>,
  method: &str,
  url: &str,
  body: v8::Local<v8::Value>,
  params: v8::Local<v8::Value>,
) -> Option<v8::Local<'s, v8::Value>> {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("http.request") {
    throw_error(scope, &e.to_string());
    return None;
  }

  let params = match parse_params(scope, params) {
    Ok(params) => params,
    Err(e) => {
      throw_type_error(scope, &e);
      return None;
    }
  };
  let (body_bytes, form_encoded) = encode_body(scope, body);

  let parsed = match Url::parse(url) {
    Ok(parsed) => parsed,
    Err(e) => {
      throw_error(scope, &format!("invalid url {url:?}: {e}"));
      return None;
    }
  };

  let (transport, cancel, throw_on_error, max_redirects, blocked) = {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    (
      vu.http.clone(),
      vu.cancel.clone(),
      vu.options.throw_on_error(),
      params
        .redirects
        .unwrap_or_else(|| vu.options.max_redirects()),
      vu.options.hostname_blocked(parsed.host_str().unwrap_or_default()),
    )
  };

  if blocked {
    let message = format!("hostname {:?} is blocked", parsed.host_str().unwrap_or_default());
    if throw_on_error {
      throw_error(scope, &message);
      return None;
    }
    let mut response = HttpResponse::default();
    response.url = url.to_string();
    response.error = Some(message);
    response.error_code = 1110;
    emit_samples(&state_rc, method, &response, &params.tags, 0);
    let object = response_to_js(scope, &response, method, ResponseType::None);
    return Some(object.into());
  }

  // Redirect-following loop. Every hop emits its own sample family.
  let mut current_url = parsed;
  let mut current_method = method.to_string();
  let mut current_body = body_bytes;
  let mut redirects_left = max_redirects;
  let response = loop {
    let request = build_request(
      &state_rc,
      &current_method,
      &current_url,
      &current_body,
      &params,
      form_encoded,
    );
    let result = transport.round_trip(&request, &cancel);

    let mut response = match result {
      Ok(response) => response,
      Err(e) => {
        let mut response = HttpResponse::default();
        response.url = current_url.to_string();
        response.error = Some(e.to_string());
        response.error_code = 1000;
        response
      }
    };
    if response.url.is_empty() {
      response.url = current_url.to_string();
    }

    // Store response cookies before deciding on the redirect.
    {
      let mut state = state_rc.borrow_mut();
      let vu = state.vu.as_mut().unwrap();
      for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("set-cookie") {
          vu.cookie_jar.set_from_header(&current_url, value);
        }
      }
    }

    emit_samples(&state_rc, &current_method, &response, &params.tags, request.body.len());

    let redirect = matches!(response.status, 301 | 302 | 303 | 307 | 308);
    if redirect && redirects_left > 0 {
      if let Some(location) = response.header("location") {
        if let Ok(next) = current_url.join(location) {
          redirects_left -= 1;
          if matches!(response.status, 301 | 302 | 303)
            && current_method != "GET"
            && current_method != "HEAD"
          {
            current_method = "GET".to_string();
            current_body = vec![];
          }
          current_url = next;
          continue;
        }
      }
    }
    if redirect && redirects_left == 0 {
      warn!("stopped after {max_redirects} redirects for {url}");
    }
    break response;
  };

  if response.error.is_some() && throw_on_error {
    let message = response.error.clone().unwrap_or_default();
    throw_error(scope, &message);
    return None;
  }

  let object =
    response_to_js(scope, &response, method, params.response_type);
  Some(object.into())
}

/// Encodes the request body: strings and buffers pass through, plain
/// objects form-encode. The bool marks a form body needing the urlencoded
/// content type.
fn encode_body(
  scope: &mut v8::HandleScope,
  body: v8::Local<v8::Value>,
) -> (Vec<u8>, bool) {
  if body.is_null_or_undefined() {
    return (vec![], false);
  }
  if let Some(bytes) = bytes_from_value(scope, body) {
    return (bytes, false);
  }
  if body.is_object() {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in tags_from_object(scope, body).iter() {
      form.append_pair(k, v);
    }
    return (form.finish().into_bytes(), true);
  }
  (body.to_rust_string_lossy(scope).into_bytes(), false)
}

fn build_request(
  state_rc: &std::rc::Rc<std::cell::RefCell<crate::js::JsRuntimeState>>,
  method: &str,
  url: &Url,
  body: &[u8],
  params: &Params,
  form_encoded: bool,
) -> HttpRequest {
  let mut headers: Vec<(String, String)> = params.headers.clone();
  let has = |headers: &[(String, String)], name: &str| {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
  };

  if !has(&headers, "user-agent") {
    headers.push(("User-Agent".to_string(), concat!("stampede/", env!("CARGO_PKG_VERSION")).to_string()));
  }
  if form_encoded && !has(&headers, "content-type") {
    headers.push((
      "Content-Type".to_string(),
      "application/x-www-form-urlencoded".to_string(),
    ));
  }

  // Basic auth from URL userinfo.
  if !url.username().is_empty() && !has(&headers, "authorization") {
    let credentials = format!(
      "{}:{}",
      url.username(),
      url.password().unwrap_or_default()
    );
    let encoded =
      base64::engine::general_purpose::STANDARD.encode(credentials);
    headers.push(("Authorization".to_string(), format!("Basic {encoded}")));
  }

  // Jar cookies plus per-request cookies.
  {
    let state = state_rc.borrow();
    let vu = state.vu.as_ref().unwrap();
    let mut pairs: Vec<String> = vu
      .cookie_jar
      .cookies_for(url)
      .iter()
      .filter(|c| !params.cookies.iter().any(|(n, _)| *n == c.name))
      .map(|c| format!("{}={}", c.name, c.value))
      .collect();
    for (name, value) in &params.cookies {
      pairs.push(format!("{name}={value}"));
    }
    if !pairs.is_empty() {
      headers.push(("Cookie".to_string(), pairs.join("; ")));
    }
  }

  HttpRequest {
    method: method.to_string(),
    url: url.to_string(),
    headers,
    body: body.to_vec(),
    timeout: params.timeout,
  }
}

fn emit_samples(
  state_rc: &std::rc::Rc<std::cell::RefCell<crate::js::JsRuntimeState>>,
  method: &str,
  response: &HttpResponse,
  user_tags: &TagSet,
  sent_bytes: usize,
) {
  let state = state_rc.borrow();
  let vu = state.vu.as_ref().unwrap();
  let m = &vu.builtin_metrics;

  let mut tags = vu.sample_tags();
  tags.merge(user_tags);
  if vu.system_tag(SystemTag::Method) {
    tags.set("method", method.to_string());
  }
  if vu.system_tag(SystemTag::Url) {
    tags.set("url", response.url.clone());
  }
  if vu.system_tag(SystemTag::Name) && tags.get("name").is_none() {
    tags.set("name", response.url.clone());
  }
  if vu.system_tag(SystemTag::Status) {
    tags.set("status", response.status.to_string());
  }
  if vu.system_tag(SystemTag::Proto) && !response.proto.is_empty() {
    tags.set("proto", response.proto.clone());
  }
  if vu.system_tag(SystemTag::TlsVersion) {
    if let Some(tls) = &response.tls_version {
      tags.set("tls_version", tls.clone());
    }
  }
  if vu.system_tag(SystemTag::OcspStatus) {
    if let Some(ocsp) = &response.ocsp_status {
      tags.set("ocsp_status", ocsp.clone());
    }
  }
  if let Some(error) = &response.error {
    if vu.system_tag(SystemTag::Error) {
      tags.set("error", error.clone());
    }
    if vu.system_tag(SystemTag::ErrorCode) {
      tags.set("error_code", response.error_code.to_string());
    }
  }
  let tags = Arc::new(tags);

  let t = &response.timings;
  let samples = vec![
    Sample::now(m.http_reqs.clone(), 1.0, tags.clone()),
    Sample::now(m.http_req_duration.clone(), t.duration, tags.clone()),
    Sample::now(
      m.http_req_failed.clone(),
      if response.failed() { 1.0 } else { 0.0 },
      tags.clone(),
    ),
    Sample::now(m.http_req_blocked.clone(), t.blocked, tags.clone()),
    Sample::now(m.http_req_connecting.clone(), t.connecting, tags.clone()),
    Sample::now(
      m.http_req_tls_handshaking.clone(),
      t.tls_handshaking,
      tags.clone(),
    ),
    Sample::now(m.http_req_sending.clone(), t.sending, tags.clone()),
    Sample::now(m.http_req_waiting.clone(), t.waiting, tags.clone()),
    Sample::now(m.http_req_receiving.clone(), t.receiving, tags.clone()),
    Sample::now(m.data_sent.clone(), sent_bytes as f64, tags.clone()),
    Sample::now(
      m.data_received.clone(),
      response.body.len() as f64,
      tags.clone(),
    ),
  ];
  vu.emit(samples);
}

fn response_to_js<'s>(
  scope: &mut v8::HandleScope<'s>,
  response: &HttpResponse,
  method: &str,
  response_type: ResponseType,
) -> v8::Local<'s, v8::Object> {
  let object = v8::Object::new(scope);
  set_number_to(scope, object, "status", response.status as f64);
  set_string_to(scope, object, "status_text", &response.status_text);
  set_string_to(scope, object, "url", &response.url);
  set_string_to(scope, object, "proto", &response.proto);

  match response_type {
    ResponseType::Text => {
      let text = String::from_utf8_lossy(&response.body);
      set_string_to(scope, object, "body", &text);
    }
    ResponseType::Binary => {
      let buffer = crate::modules::array_buffer_from_bytes(
        scope,
        response.body.clone(),
      );
      set_property_to(scope, object, "body", buffer.into());
    }
    ResponseType::None => {
      let null = v8::null(scope);
      set_property_to(scope, object, "body", null.into());
    }
  }

  let headers = v8::Object::new(scope);
  for (name, value) in &response.headers {
    set_string_to(scope, headers, name, value);
  }
  set_property_to(scope, object, "headers", headers.into());

  let timings = v8::Object::new(scope);
  let t = &response.timings;
  set_number_to(scope, timings, "blocked", t.blocked);
  set_number_to(scope, timings, "connecting", t.connecting);
  set_number_to(scope, timings, "tls_handshaking", t.tls_handshaking);
  set_number_to(scope, timings, "sending", t.sending);
  set_number_to(scope, timings, "waiting", t.waiting);
  set_number_to(scope, timings, "receiving", t.receiving);
  set_number_to(scope, timings, "duration", t.duration);
  set_property_to(scope, object, "timings", timings.into());

  match &response.error {
    Some(error) => {
      set_string_to(scope, object, "error", error);
      set_number_to(scope, object, "error_code", response.error_code as f64);
    }
    None => {
      set_string_to(scope, object, "error", "");
      set_number_to(scope, object, "error_code", 0.0);
    }
  }

  let request = v8::Object::new(scope);
  set_string_to(scope, request, "method", method);
  set_string_to(scope, request, "url", &response.url);
  set_property_to(scope, object, "request", request.into());

  set_function_to(scope, object, "json", response_json);
  set_function_to(scope, object, "html", response_html);

  object
}

/// `response.json()`: parses the text body.
fn response_json(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let this = args.this();
  let body_key = v8::String::new(scope, "body").unwrap();
  let Some(body) = this.get(scope, body_key.into()).filter(|b| b.is_string())
  else {
    throw_error(scope, "response body is not text");
    return;
  };
  let body = v8::Local::<v8::String>::try_from(body).unwrap();
  match v8::json::parse(scope, body) {
    Some(value) => rv.set(value),
    None => {
      // v8 already threw a SyntaxError.
    }
  }
}

/// `response.html()`: parses the body into a selection.
fn response_html(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let this = args.this();
  let body_key = v8::String::new(scope, "body").unwrap();
  let body = this
    .get(scope, body_key.into())
    .map(|b| b.to_rust_string_lossy(scope))
    .unwrap_or_default();
  let selection = selection_from_source(scope, &body);
  rv.set(selection.into());
}

// Request flow }

// batch {

/// `batch(requests)`: runs each entry and returns the responses in the same
/// shape (array in, array out; object in, object out). Entries run in
/// order through the transport.
fn batch(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("http.batch") {
    throw_error(scope, &e.to_string());
    return;
  }

  let input = args.get(0);
  if input.is_array() {
    let array = v8::Local::<v8::Array>::try_from(input).unwrap();
    let out = v8::Array::new(scope, array.length() as i32);
    for i in 0..array.length() {
      let Some(entry) = array.get_index(scope, i) else { continue };
      let Some(response) = batch_entry(scope, entry) else { return };
      out.set_index(scope, i, response.into());
    }
    rv.set(out.into());
    return;
  }

  if input.is_object() {
    let object = input.to_object(scope).unwrap();
    let out = v8::Object::new(scope);
    let Some(names) = object
      .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
    else {
      rv.set(out.into());
      return;
    };
    for i in 0..names.length() {
      let Some(key) = names.get_index(scope, i) else { continue };
      let Some(entry) = object.get(scope, key) else { continue };
      let Some(response) = batch_entry(scope, entry) else { return };
      out.set(scope, key, response.into());
    }
    rv.set(out.into());
    return;
  }

  throw_type_error(scope, "batch() requires an array or object of requests");
}

/// One batch entry: a URL string, `[method, url, body?, params?]`, or
/// `{method, url, body, params}`.
fn batch_entry<'s>(
  scope: &mut v8::HandleScope<'s>,
  entry: v8::Local<v8::Value>,
) -> Option<v8::Local<'s, v8::Value>> {
  let (method, url, body, params) = if entry.is_string() {
    let url = entry.to_rust_string_lossy(scope);
    let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();
    ("GET".to_string(), url, undefined, undefined)
  } else if entry.is_array() {
    let array = v8::Local::<v8::Array>::try_from(entry).unwrap();
    let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();
    let method = array
      .get_index(scope, 0)
      .map(|m| m.to_rust_string_lossy(scope).to_uppercase())
      .unwrap_or_else(|| "GET".to_string());
    let url = array
      .get_index(scope, 1)
      .map(|u| u.to_rust_string_lossy(scope))
      .unwrap_or_default();
    let body = array.get_index(scope, 2).unwrap_or(undefined);
    let params = array.get_index(scope, 3).unwrap_or(undefined);
    (method, url, body, params)
  } else if entry.is_object() {
    let object = entry.to_object(scope).unwrap();
    let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();
    let method_key = v8::String::new(scope, "method").unwrap();
    let url_key = v8::String::new(scope, "url").unwrap();
    let body_key = v8::String::new(scope, "body").unwrap();
    let params_key = v8::String::new(scope, "params").unwrap();
    let method = object
      .get(scope, method_key.into())
      .filter(|m| m.is_string())
      .map(|m| m.to_rust_string_lossy(scope).to_uppercase())
      .unwrap_or_else(|| "GET".to_string());
    let url = object
      .get(scope, url_key.into())
      .map(|u| u.to_rust_string_lossy(scope))
      .unwrap_or_default();
    let body = object.get(scope, body_key.into()).unwrap_or(undefined);
    let params = object.get(scope, params_key.into()).unwrap_or(undefined);
    (method, url, body, params)
  } else {
    throw_type_error(scope, "invalid batch entry");
    return None;
  };

  perform_request(scope, &method, &url, body, params)
}

// batch }

// file / cookieJar {

/// `file(data, filename?, contentType?)`: a multipart part descriptor.
fn file(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let object = v8::Object::new(scope);
  set_property_to(scope, object, "data", args.get(0));
  let filename = if args.length() > 1 && args.get(1).is_string() {
    args.get(1).to_rust_string_lossy(scope)
  } else {
    "file".to_string()
  };
  set_string_to(scope, object, "filename", &filename);
  let content_type = if args.length() > 2 && args.get(2).is_string() {
    args.get(2).to_rust_string_lossy(scope)
  } else {
    "application/octet-stream".to_string()
  };
  set_string_to(scope, object, "content_type", &content_type);
  rv.set(object.into());
}

enum JarBacking {
  /// The VU's own jar, reset between iterations.
  Vu,
  /// A standalone jar created with `new CookieJar()`.
  Own(CookieJar),
}

/// `cookieJar()`: the VU's active jar.
fn cookie_jar(
  scope: &mut v8::HandleScope,
  _args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  if let Err(e) = state_rc.borrow().check_vu("http.cookieJar") {
    throw_error(scope, &e.to_string());
    return;
  }
  rv.set(new_jar_object(scope, JarBacking::Vu).into());
}

/// `new CookieJar()`: an empty standalone jar.
fn new_cookie_jar(
  scope: &mut v8::HandleScope,
  _args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  rv.set(new_jar_object(scope, JarBacking::Own(CookieJar::new())).into());
}

fn new_jar_object<'s>(
  scope: &mut v8::HandleScope<'s>,
  backing: JarBacking,
) -> v8::Local<'s, v8::Object> {
  let template = v8::ObjectTemplate::new(scope);
  template.set_internal_field_count(1);
  let object = template.new_instance(scope).unwrap();
  set_internal_ref(scope, object, 0, backing);
  set_function_to(scope, object, "cookiesForURL", jar_cookies_for_url);
  set_function_to(scope, object, "set", jar_set);
  set_function_to(scope, object, "delete", jar_delete);
  set_function_to(scope, object, "clear", jar_clear);
  object
}

/// Runs `f` against whichever jar backs this object.
fn with_jar<R>(
  scope: &mut v8::HandleScope,
  this: v8::Local<v8::Object>,
  f: impl FnOnce(&mut CookieJar) -> R,
) -> Option<R> {
  let backing = get_internal_ref::<JarBacking>(scope, this, 0);
  match backing {
    JarBacking::Own(jar) => Some(f(jar)),
    JarBacking::Vu => {
      let state_rc = JsRuntime::state(scope);
      let mut state = state_rc.borrow_mut();
      let vu = state.vu.as_mut()?;
      Some(f(&mut vu.cookie_jar))
    }
  }
}

fn jar_url(
  scope: &mut v8::HandleScope,
  args: &v8::FunctionCallbackArguments,
) -> Option<Url> {
  let url = args.get(0).to_rust_string_lossy(scope);
  match Url::parse(&url) {
    Ok(url) => Some(url),
    Err(e) => {
      throw_error(scope, &format!("invalid url {url:?}: {e}"));
      None
    }
  }
}

fn jar_cookies_for_url(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let this = args.this();
  let Some(url) = jar_url(scope, &args) else { return };
  let cookies = with_jar(scope, this, |jar| {
    jar
      .cookies_for(&url)
      .iter()
      .map(|c| (c.name.clone(), c.value.clone()))
      .collect::<Vec<_>>()
  });
  let Some(cookies) = cookies else { return };

  // `{name: [value, ...]}` like a multi-valued header map.
  let out = v8::Object::new(scope);
  let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
  for (name, value) in cookies {
    grouped.entry(name).or_default().push(value);
  }
  for (name, values) in grouped {
    let array = v8::Array::new(scope, values.len() as i32);
    for (i, value) in values.iter().enumerate() {
      let value = v8::String::new(scope, value).unwrap();
      array.set_index(scope, i as u32, value.into());
    }
    let key = v8::String::new(scope, &name).unwrap();
    out.set(scope, key.into(), array.into());
  }
  rv.set(out.into());
}

fn jar_set(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let this = args.this();
  let Some(url) = jar_url(scope, &args) else { return };
  let name = args.get(1).to_rust_string_lossy(scope);
  let value = args.get(2).to_rust_string_lossy(scope);

  let mut domain: Option<String> = None;
  let mut path: Option<String> = None;
  let mut secure = false;
  if args.length() > 3 && args.get(3).is_object() {
    let opts = tags_from_object(scope, args.get(3));
    domain = opts.get("domain").map(|s| s.to_string());
    path = opts.get("path").map(|s| s.to_string());
    secure = opts.get("secure").map(|s| s == "true").unwrap_or(false);
  }

  let done = with_jar(scope, this, |jar| {
    jar.set(&url, &name, &value, domain.as_deref(), path.as_deref(), secure);
  });
  rv.set(v8::Boolean::new(scope, done.is_some()).into());
}

fn jar_delete(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let this = args.this();
  let Some(url) = jar_url(scope, &args) else { return };
  let name = args.get(1).to_rust_string_lossy(scope);
  with_jar(scope, this, |jar| jar.delete(&url, &name));
}

fn jar_clear(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let this = args.this();
  let Some(url) = jar_url(scope, &args) else { return };
  with_jar(scope, this, |jar| jar.clear(&url));
}

// file / cookieJar }
