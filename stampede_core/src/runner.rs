//! The iteration driver: VU lifecycle, `setup`/`teardown`, `RunOnce`.
//!
//! The executor collaborator decides *when* VUs run; this module guarantees
//! *how*: one isolated runtime per VU, per-iteration state resets, phase
//! timeouts by isolate termination, and the `setup` → iterations →
//! `teardown` ordering edges.

use crate::bundle::Bundle;
use crate::group::Group;
use crate::js::binding::set_vu_globals;
use crate::js::err::JsError;
use crate::js::module;
use crate::js::{JsRuntime, VuState};
use crate::metrics::{BuiltinMetrics, Sample, SampleSender, TagSet};
use crate::modules::grpc::GrpcTransport;
use crate::modules::http::cookiejar::CookieJar;
use crate::modules::http::{HttpTransport, NoTransport};
use crate::modules::ws::WsTransport;
use crate::prelude::*;

use parking_lot::RwLock;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod runner_tests;

/// The wire-level collaborators injected into every VU.
#[derive(Debug, Clone)]
pub struct Transports {
  pub http: Arc<dyn HttpTransport>,
  pub ws: Option<Arc<dyn WsTransport>>,
  pub grpc: Option<Arc<dyn GrpcTransport>>,
}

impl Default for Transports {
  fn default() -> Self {
    Self {
      http: Arc::new(NoTransport),
      ws: None,
      grpc: None,
    }
  }
}

/// Spawns and drives VUs for one bundle.
pub struct Runner {
  pub bundle: Arc<Bundle>,
  pub builtin_metrics: Arc<BuiltinMetrics>,
  pub group_root: Arc<Group>,
  pub out: SampleSender,
  pub transports: Transports,
  pub tokio: tokio::runtime::Handle,
  setup_data: Arc<RwLock<Option<String>>>,
}

impl Runner {
  pub fn new(
    bundle: Arc<Bundle>,
    out: SampleSender,
    transports: Transports,
    tokio: tokio::runtime::Handle,
  ) -> AnyResult<Runner> {
    let builtin_metrics =
      Arc::new(BuiltinMetrics::register(&bundle.registry)?);
    Ok(Runner {
      bundle,
      builtin_metrics,
      group_root: Group::root(),
      out,
      transports,
      tokio,
      setup_data: Arc::new(RwLock::new(None)),
    })
  }

  /// Spawns a fresh VU: its own runtime, its own module instances. Must be
  /// called on the thread that will drive the VU.
  pub fn new_vu(&self, id: u64, id_instance: u64) -> AnyResult<Vu> {
    let mut runtime = JsRuntime::new(
      self.bundle.runtime_params(self.tokio.clone()),
    );

    // The replay below is init code, and `__VU` is 0 inside init;
    // `run_once` raises it once the first iteration body begins.
    {
      let scope = &mut runtime.handle_scope();
      set_vu_globals(scope, 0, 0);
    }

    // Replay the module graph into this runtime's own exports objects.
    let captured: Rc<RefCell<Option<v8::Global<v8::Value>>>> =
      Rc::new(RefCell::new(None));
    let capture = captured.clone();
    let url = self.bundle.main_url.clone();
    let replay = runtime.start(move |scope| {
      let exports = module::require_module(scope, &url)
        .map_err(|e| JsError::from_reason(e.to_string()))?;
      capture.replace(Some(v8::Global::new(scope, exports)));
      Ok(None)
    });
    if let Err(e) = replay {
      runtime.wait_on_registered();
      anyhow::bail!("vu {id} init error: {e}");
    }
    let exports_value = captured
      .borrow_mut()
      .take()
      .ok_or_else(|| anyhow::anyhow!("vu {id} init produced no exports"))?;

    // Bind the callable exports recorded by the bundle.
    let mut exports = HashMap::new();
    {
      let scope = &mut runtime.handle_scope();
      let object = v8::Local::new(scope, exports_value);
      let object = object
        .to_object(scope)
        .ok_or_else(|| anyhow::anyhow!("vu {id} exports are not an object"))?;
      for name in &self.bundle.exports {
        let key = v8::String::new(scope, name).unwrap();
        let Some(value) = object.get(scope, key.into()) else { continue };
        if let Ok(func) = v8::Local::<v8::Function>::try_from(value) {
          exports.insert(name.clone(), v8::Global::new(scope, func));
        }
      }
    }

    Ok(Vu {
      id,
      id_instance,
      iteration: 0,
      runtime,
      exports,
      bundle: self.bundle.clone(),
      builtin_metrics: self.builtin_metrics.clone(),
      group_root: self.group_root.clone(),
      out: self.out.clone(),
      transports: self.transports.clone(),
      setup_data: self.setup_data.clone(),
      tokio: self.tokio.clone(),
    })
  }

  /// Runs `setup` once, on a dedicated VU, under `options.setupTimeout`.
  /// Its JSON-serialised return value feeds every iteration and teardown.
  pub fn run_setup(&self) -> Result<(), RunnerError> {
    *self.setup_data.write() = None;
    if !self.bundle.has_export("setup") {
      return Ok(());
    }
    let timeout = self.bundle.options.setup_timeout();
    let data = self.run_phase("setup", None, timeout).map_err(|e| match e {
      RunnerError::Timeout(d) => RunnerError::SetupTimeout(d),
      other => other,
    })?;
    *self.setup_data.write() = data;
    Ok(())
  }

  /// Runs `teardown` once under `options.teardownTimeout`.
  pub fn run_teardown(&self) -> Result<(), RunnerError> {
    if !self.bundle.has_export("teardown") {
      return Ok(());
    }
    let timeout = self.bundle.options.teardown_timeout();
    let arg = self.setup_data.read().clone();
    self
      .run_phase("teardown", arg.as_deref(), timeout)
      .map(|_| ())
      .map_err(|e| match e {
        RunnerError::Timeout(d) => RunnerError::TeardownTimeout(d),
        other => other,
      })
  }

  /// The JSON-serialised setup data, for executors that distribute it.
  pub fn setup_data(&self) -> Option<String> {
    self.setup_data.read().clone()
  }

  pub fn set_setup_data(&self, data: Option<String>) {
    *self.setup_data.write() = data;
  }

  fn run_phase(
    &self,
    name: &str,
    arg: Option<&str>,
    timeout: Duration,
  ) -> Result<Option<String>, RunnerError> {
    let mut vu = self
      .new_vu(0, 0)
      .map_err(|e| RunnerError::Aborted(e.to_string()))?;

    let token = CancellationToken::new();
    let timed_out = Arc::new(AtomicBool::new(false));
    let guard = CancellationToken::new();
    {
      let isolate = vu.runtime.isolate_handle();
      let token = token.clone();
      let timed_out = timed_out.clone();
      let guard = guard.clone();
      self.tokio.spawn(async move {
        tokio::select! {
          _ = tokio::time::sleep(timeout) => {
            timed_out.store(true, Ordering::Release);
            token.cancel();
            isolate.terminate_execution();
          }
          _ = guard.cancelled() => {}
        }
      });
    }

    vu.install_state(None, token);
    let result = vu.call_export(name, arg);
    vu.clear_state();
    guard.cancel();
    vu.runtime.cancel_termination();

    match result {
      Ok(data) => Ok(data),
      Err(e) => {
        vu.runtime.wait_on_registered();
        if timed_out.load(Ordering::Acquire) {
          Err(RunnerError::Timeout(timeout))
        } else {
          Err(e)
        }
      }
    }
  }
}

/// Parameters of one activation, supplied by the executor.
#[derive(Debug, Clone, Default)]
pub struct VuActivationParams {
  pub scenario: Option<String>,
  /// Name of the export to run; `default` when unset.
  pub exec: Option<String>,
  pub token: CancellationToken,
}

/// One virtual user: a bundle instance plus its driving state. Not `Send`;
/// a VU lives and dies on the thread that created it.
pub struct Vu {
  pub id: u64,
  pub id_instance: u64,
  iteration: u64,
  runtime: JsRuntime,
  exports: HashMap<String, v8::Global<v8::Function>>,
  bundle: Arc<Bundle>,
  builtin_metrics: Arc<BuiltinMetrics>,
  group_root: Arc<Group>,
  out: SampleSender,
  transports: Transports,
  setup_data: Arc<RwLock<Option<String>>>,
  tokio: tokio::runtime::Handle,
}

impl Vu {
  /// Activates the VU for a stretch of iterations. Deactivation happens
  /// when the returned handle drops. The engine never calls `run_once`
  /// concurrently on one VU; `&mut` enforces it here.
  pub fn activate(&mut self, params: VuActivationParams) -> ActiveVu<'_> {
    let exec = params.exec.unwrap_or_else(|| "default".to_string());
    let token = params.token.clone();

    self.install_state(params.scenario, token.clone());

    // Cancelling the activation interrupts even guest code that never
    // reaches a suspension point.
    let guard = CancellationToken::new();
    {
      let isolate = self.runtime.isolate_handle();
      let token = token.clone();
      let guard = guard.clone();
      self.tokio.spawn(async move {
        tokio::select! {
          _ = token.cancelled() => { isolate.terminate_execution(); }
          _ = guard.cancelled() => {}
        }
      });
    }

    ActiveVu {
      vu: self,
      exec,
      token,
      guard,
    }
  }

  pub fn iteration(&self) -> u64 {
    self.iteration
  }

  fn install_state(&mut self, scenario: Option<String>, token: CancellationToken) {
    let mut state = self.runtime.state.borrow_mut();
    state.vu = Some(VuState {
      id: self.id,
      id_instance: self.id_instance,
      iteration: self.iteration,
      scenario,
      group_root: self.group_root.clone(),
      group: self.group_root.clone(),
      samples: self.out.clone(),
      builtin_metrics: self.builtin_metrics.clone(),
      tags: TagSet::new(),
      cookie_jar: CookieJar::new(),
      cancel: token,
      tainted: false,
      http: self.transports.http.clone(),
      ws: self.transports.ws.clone(),
      grpc: self.transports.grpc.clone(),
      options: self.bundle.options.clone(),
    });
  }

  fn clear_state(&mut self) {
    self.runtime.state.borrow_mut().vu = None;
  }

  /// Calls an exported function with an optional JSON argument and returns
  /// the JSON of its (promise-resolved) return value.
  fn call_export(
    &mut self,
    name: &str,
    arg_json: Option<&str>,
  ) -> Result<Option<String>, RunnerError> {
    let func = self.exports.get(name).cloned().ok_or_else(|| {
      RunnerError::Aborted(format!("exported function {name:?} not found"))
    })?;

    let captured: Rc<RefCell<Option<v8::Global<v8::Value>>>> =
      Rc::new(RefCell::new(None));
    let capture = captured.clone();
    let arg_json = arg_json.map(str::to_string);

    self.runtime.start(move |scope| {
      let arg: v8::Local<v8::Value> = match &arg_json {
        Some(json) => {
          let text = v8::String::new(scope, json).unwrap();
          v8::json::parse(scope, text)
            .unwrap_or_else(|| v8::undefined(scope).into())
        }
        None => v8::undefined(scope).into(),
      };

      let func = v8::Local::new(scope, &func);
      let tc_scope = &mut v8::TryCatch::new(scope);
      let undefined = v8::undefined(tc_scope).into();
      match func.call(tc_scope, undefined, &[arg]) {
        Some(value) => {
          capture.replace(Some(v8::Global::new(tc_scope, value)));
          if value.is_promise() {
            let promise =
              v8::Local::<v8::Promise>::try_from(value).unwrap();
            Ok(Some(v8::Global::new(tc_scope, promise)))
          } else {
            Ok(None)
          }
        }
        None => Err(module::caught_error(tc_scope)),
      }
    })?;

    // Serialise the settled return value.
    let scope = &mut self.runtime.handle_scope();
    let Some(value) = captured.borrow_mut().take() else {
      return Ok(None);
    };
    let mut value = v8::Local::new(scope, value);
    if value.is_promise() {
      let promise = v8::Local::<v8::Promise>::try_from(value).unwrap();
      if promise.state() != v8::PromiseState::Fulfilled {
        return Ok(None);
      }
      value = promise.result(scope);
    }
    if value.is_null_or_undefined() {
      return Ok(None);
    }
    Ok(
      v8::json::stringify(scope, value)
        .map(|s| s.to_rust_string_lossy(scope)),
    )
  }
}

/// The handle the executor drives iterations through.
pub struct ActiveVu<'a> {
  vu: &'a mut Vu,
  exec: String,
  token: CancellationToken,
  guard: CancellationToken,
}

impl ActiveVu<'_> {
  /// One iteration: reset per-iteration state, invoke the selected export
  /// with the setup data, emit the builtin iteration samples.
  pub fn run_once(&mut self) -> Result<(), RunnerError> {
    let iteration = self.vu.iteration;

    {
      let mut state = self.vu.runtime.state.borrow_mut();
      let vu_state = state.vu.as_mut().expect("active VU carries state");
      vu_state.iteration = iteration;
      vu_state.group = vu_state.group_root.clone();
      vu_state.tags = TagSet::new();
      vu_state.tainted = false;
      if !self.vu.bundle.options.no_cookies_reset() {
        vu_state.cookie_jar.clear_all();
      }
    }
    {
      let scope = &mut self.vu.runtime.handle_scope();
      set_vu_globals(scope, self.vu.id, iteration);
    }

    let arg = self.vu.setup_data.read().clone();
    let started = Instant::now();
    let result = self.vu.call_export(&self.exec, arg.as_deref());
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    // Iteration samples, emitted for failed iterations too. The group
    // pointer is back at the root before tags derive.
    {
      let mut state = self.vu.runtime.state.borrow_mut();
      let vu_state = state.vu.as_mut().expect("active VU carries state");
      vu_state.group = vu_state.group_root.clone();
      if result.is_err() {
        vu_state.tainted = true;
      }
      let tags = Arc::new(vu_state.sample_tags());
      let samples = vec![
        Sample::now(
          self.vu.builtin_metrics.iteration_duration.clone(),
          duration_ms,
          tags.clone(),
        ),
        Sample::now(self.vu.builtin_metrics.iterations.clone(), 1.0, tags),
      ];
      vu_state.emit(samples);
    }

    self.vu.iteration += 1;

    match result {
      Ok(_) => Ok(()),
      Err(e) => {
        self.vu.runtime.wait_on_registered();
        if self.token.is_cancelled() {
          self.vu.runtime.cancel_termination();
          return Err(RunnerError::Aborted(
            "iteration context cancelled".to_string(),
          ));
        }
        match &e {
          RunnerError::Script(err) | RunnerError::UnhandledRejection(err) => {
            error!("iteration {iteration} of vu {} failed: {err}", self.vu.id);
          }
          _ => {}
        }
        Err(e)
      }
    }
  }
}

impl Drop for ActiveVu<'_> {
  fn drop(&mut self) {
    self.guard.cancel();
    self.vu.runtime.cancel_termination();
    self.vu.clear_state();
  }
}
