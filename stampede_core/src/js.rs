//! JavaScript runtime.
//!
//! One [`JsRuntime`] wraps one V8 isolate. The bundle owns a throwaway
//! runtime for the init phase; every VU owns its own for the whole test, so
//! no JavaScript value ever crosses a VU boundary.

use crate::bundle::options::Options;
use crate::fs::FsMap;
use crate::group::Group;
use crate::js::compiler::CompatMode;
use crate::js::err::{JsError, SourceMapCache};
use crate::js::eventloop::EventLoop;
use crate::js::exception::ExceptionState;
use crate::js::module::{ModuleCache, ProgramCache};
use crate::metrics::{BuiltinMetrics, MetricRegistry, Sample, SampleSender, SystemTag, TagSet};
use crate::modules::data::SharedArrayRegistry;
use crate::modules::grpc::GrpcTransport;
use crate::modules::http::cookiejar::CookieJar;
use crate::modules::http::HttpTransport;
use crate::modules::ws::WsTransport;
use crate::prelude::*;

use rand::rngs::StdRng;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod binding;
pub mod compiler;
pub mod err;
pub mod eventloop;
pub mod exception;
pub mod hook;
pub mod module;
pub mod rewrite;

#[cfg(test)]
mod eventloop_tests;
#[cfg(test)]
mod js_tests;

/// Initialize the V8 platform, exactly once per process.
pub fn init_v8_platform() {
  static V8_INIT: Once = Once::new();
  V8_INIT.call_once(move || {
    let platform = v8::new_default_platform(0, false).make_shared();
    v8::V8::initialize_platform(platform);
    v8::V8::initialize();
  });
}

/// Runtime construction options, snapshotted per bundle.
#[derive(Debug, Clone, Default)]
pub struct JsRuntimeOptions {
  pub compat_mode: CompatMode,
  /// The `__ENV` snapshot.
  pub env: HashMap<String, String>,
  /// Whether stacks are resolved through attached source maps.
  pub enable_source_maps: bool,
}

/// Everything a builtin needs to act on behalf of its VU. `None` inside the
/// init phase: builtins check for it and fail with
/// [`ContractError::ForbiddenInInitContext`].
pub struct VuState {
  /// 1-based VU id, unique across the whole test (`__VU`).
  pub id: u64,
  /// 1-based VU id inside this engine instance.
  pub id_instance: u64,
  /// Iteration counter within this VU (`__ITER`).
  pub iteration: u64,
  pub scenario: Option<String>,
  pub group_root: Arc<Group>,
  /// The current-group pointer; equals `group_root` between iterations.
  pub group: Arc<Group>,
  pub samples: SampleSender,
  pub builtin_metrics: Arc<BuiltinMetrics>,
  /// Per-iteration user tags, merged over `options.tags`.
  pub tags: TagSet,
  pub cookie_jar: CookieJar,
  pub cancel: CancellationToken,
  /// A failed check or thrown iteration marks the iteration tainted.
  pub tainted: bool,
  pub http: Arc<dyn HttpTransport>,
  pub ws: Option<Arc<dyn WsTransport>>,
  pub grpc: Option<Arc<dyn GrpcTransport>>,
  pub options: Arc<Options>,
}

impl VuState {
  /// Whether the given system tag is enabled for this run.
  pub fn system_tag(&self, tag: SystemTag) -> bool {
    self.options.system_tag_set().contains(&tag)
  }

  /// The base tag set every sample of the current iteration carries.
  pub fn sample_tags(&self) -> TagSet {
    let mut tags = TagSet::new();
    for (k, v) in self.options.tags.iter() {
      tags.set(k, v.clone());
    }
    tags.merge(&self.tags);
    if self.system_tag(SystemTag::Group) {
      tags.set("group", self.group.path.clone());
    }
    tags.set("group_id", self.group.id.clone());
    if self.system_tag(SystemTag::Vu) {
      tags.set("vu", self.id.to_string());
    }
    if self.system_tag(SystemTag::Iter) {
      tags.set("iter", self.iteration.to_string());
    }
    if self.system_tag(SystemTag::Scenario) {
      if let Some(scenario) = &self.scenario {
        tags.set("scenario", scenario.clone());
      }
    }
    tags
  }

  pub fn emit(&self, samples: Vec<Sample>) {
    self.samples.send(samples);
  }
}

/// The state stored in every isolate's slot.
pub struct JsRuntimeState {
  pub context: v8::Global<v8::Context>,
  pub options: JsRuntimeOptions,
  /// The main module's URL; root for `require` and the initial `open` base.
  pub pwd: Url,
  /// URL of the module currently executing its top level. `open` resolves
  /// against it.
  pub current_pwd: Url,
  pub event_loop: EventLoop,
  pub exceptions: ExceptionState,
  /// Per-runtime CommonJS instances.
  pub modules: ModuleCache,
  /// Per-runtime builtin module instances.
  pub builtins: HashMap<String, v8::Global<v8::Object>>,
  /// The bundle-wide compiled program cache, shared by every runtime.
  pub programs: Arc<ProgramCache>,
  pub sourcemaps: SourceMapCache,
  pub fs: Arc<FsMap>,
  /// Data files recorded by `open` during init; VUs read from this map.
  pub files: HashMap<String, Vec<u8>>,
  /// True only inside the bundle's init runtime, where `require`/`open`
  /// may still touch the filesystems and record what they see.
  pub init_recording: bool,
  pub registry: Arc<MetricRegistry>,
  pub shared_arrays: Arc<SharedArrayRegistry>,
  pub tokio: tokio::runtime::Handle,
  /// Deterministic `Math.random` source once `randomSeed` was called.
  pub rng: Option<StdRng>,
  /// Live `setTimeout` timers by id, for `clearTimeout`.
  pub timers: HashMap<i32, CancellationToken>,
  /// Protobuf definitions registered by `grpc.Client.load`, re-populated
  /// per runtime by the module replay.
  pub grpc_protos: Vec<(String, String)>,
  pub vu: Option<VuState>,
}

impl JsRuntimeState {
  /// Capability check for VU-only operations.
  pub fn check_vu(&self, op: &'static str) -> Result<(), ContractError> {
    if self.vu.is_some() {
      Ok(())
    } else {
      Err(ContractError::ForbiddenInInitContext(op))
    }
  }

  pub fn cancel_token(&self) -> Option<CancellationToken> {
    self.vu.as_ref().map(|vu| vu.cancel.clone())
  }
}

/// Construction parameters for [`JsRuntime`].
pub struct JsRuntimeParams {
  pub options: JsRuntimeOptions,
  pub pwd: Url,
  pub fs: Arc<FsMap>,
  pub programs: Arc<ProgramCache>,
  pub files: HashMap<String, Vec<u8>>,
  pub init_recording: bool,
  pub registry: Arc<MetricRegistry>,
  pub shared_arrays: Arc<SharedArrayRegistry>,
  pub tokio: tokio::runtime::Handle,
}

pub struct JsRuntime {
  // V8 isolate.
  isolate: v8::OwnedIsolate,

  /// The state of the runtime.
  pub state: Rc<RefCell<JsRuntimeState>>,
}

impl JsRuntime {
  /// Creates a new runtime: isolate, context, bindings and bootstrap.
  pub fn new(params: JsRuntimeParams) -> Self {
    init_v8_platform();

    let mut isolate = v8::Isolate::new(v8::CreateParams::default());
    isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
    isolate.set_promise_reject_callback(hook::promise_reject_cb);

    let context = {
      let scope = &mut v8::HandleScope::new(&mut *isolate);
      let context = binding::create_new_context(scope);
      v8::Global::new(scope, context)
    };

    let state = Rc::new(RefCell::new(JsRuntimeState {
      context,
      current_pwd: params.pwd.clone(),
      pwd: params.pwd,
      event_loop: EventLoop::new(),
      exceptions: ExceptionState::new(),
      modules: ModuleCache::new(),
      builtins: HashMap::new(),
      programs: params.programs,
      sourcemaps: SourceMapCache::new(),
      fs: params.fs,
      files: params.files,
      init_recording: params.init_recording,
      registry: params.registry,
      shared_arrays: params.shared_arrays,
      tokio: params.tokio,
      rng: None,
      timers: HashMap::new(),
      grpc_protos: vec![],
      options: params.options,
      vu: None,
    }));

    isolate.set_slot(state.clone());

    let mut runtime = JsRuntime { isolate, state };
    runtime.init_environment();
    runtime
  }

  /// Installs the globals that need a live state: `__ENV`, `__VU`,
  /// `__ITER`, `require`, `open`, plus the bootstrap helpers.
  fn init_environment(&mut self) {
    // Source maps of programs compiled before this runtime existed.
    {
      let state_rc = self.state.clone();
      let mut state = state_rc.borrow_mut();
      if state.options.enable_source_maps {
        for program in state.programs.ordered() {
          if let Some(map) = &program.source_map {
            state.sourcemaps.insert_raw(&program.url, map.clone());
          }
        }
      }
    }

    let scope = &mut self.handle_scope();
    binding::install_globals(scope);

    static BOOTSTRAP_JS: &str = include_str!("./js/runtime/bootstrap.js");
    let origin = module::create_origin(scope, "builtin://bootstrap", false);
    let source = v8::String::new(scope, BOOTSTRAP_JS).unwrap();
    let script = v8::Script::compile(scope, source, Some(&origin))
      .expect("bootstrap must compile");
    script.run(scope).expect("bootstrap must evaluate");
  }

  /// Executes the main program as a CommonJS module and returns its final
  /// exports value.
  pub fn require_main(&mut self) -> AnyResult<v8::Global<v8::Value>> {
    let url = self.state.borrow().pwd.clone();
    let scope = &mut self.handle_scope();
    let exports = module::require_module(scope, &url)?;
    Ok(v8::Global::new(scope, exports))
  }

  /// Runs `entry`, then drains the event loop until the queue is empty and
  /// no registrations remain. Surfaces captured exceptions and unhandled
  /// promise rejections. On error the caller is expected to follow up with
  /// [`JsRuntime::wait_on_registered`] before reusing the runtime.
  pub fn start<F>(&mut self, entry: F) -> Result<(), RunnerError>
  where
    F: FnOnce(&mut v8::HandleScope) -> Result<Option<v8::Global<v8::Promise>>, JsError>,
  {
    let maybe_promise = {
      let scope = &mut self.handle_scope();
      let result = entry(scope);
      scope.perform_microtask_checkpoint();
      result.map_err(RunnerError::Script)?
    };

    self.drain_event_loop()?;

    // A rejected entry promise wins over generic rejection tracking; it is
    // the iteration's own result.
    if let Some(promise) = maybe_promise {
      let scope = &mut self.handle_scope();
      let local = v8::Local::new(scope, &promise);
      match local.state() {
        v8::PromiseState::Rejected => {
          let reason = local.result(scope);
          let state_rc = Self::state(scope);
          let mut state = state_rc.borrow_mut();
          state.exceptions.remove_promise_rejection(&promise);
          let error =
            JsError::from_v8_exception(scope, reason, Some(&mut state.sourcemaps));
          return Err(RunnerError::Script(error));
        }
        v8::PromiseState::Pending => {
          // Nothing left that could settle it.
          warn!("entry promise still pending after the event loop drained");
        }
        v8::PromiseState::Fulfilled => {}
      }
    }

    let rejection = self.state.borrow_mut().exceptions.take_first_rejection();
    if let Some((_promise, reason)) = rejection {
      let scope = &mut self.handle_scope();
      let reason = v8::Local::new(scope, reason);
      let state_rc = Self::state(scope);
      let mut state = state_rc.borrow_mut();
      let error = if reason.is_null_or_undefined() {
        JsError::from_reason("promise rejected with no reason".to_string())
      } else {
        JsError::from_v8_exception(scope, reason, Some(&mut state.sourcemaps))
      };
      return Err(RunnerError::UnhandledRejection(error));
    }

    Ok(())
  }

  /// Runs completed native callbacks until idle.
  fn drain_event_loop(&mut self) -> Result<(), RunnerError> {
    loop {
      // Everything already queued, FIFO.
      loop {
        let task = self.state.borrow_mut().event_loop.try_take();
        match task {
          Some((callback, payload)) => {
            let scope = &mut self.handle_scope();
            callback(scope, payload);
            scope.perform_microtask_checkpoint();
          }
          None => break,
        }
      }

      if let Some(error) = self.take_captured_exception() {
        return Err(RunnerError::Script(error));
      }

      if self.state.borrow().event_loop.registered_count() == 0 {
        return Ok(());
      }

      // Queue empty, registrations outstanding: park until a native task
      // completes. Handles resolve even on cancellation, so this wakes.
      let task = {
        self
          .state
          .borrow_mut()
          .event_loop
          .take_timeout(Duration::from_millis(100))
      };
      if let Some((callback, payload)) = task {
        let scope = &mut self.handle_scope();
        callback(scope, payload);
        scope.perform_microtask_checkpoint();
      }
    }
  }

  /// After [`JsRuntime::start`] returned an error, drains the remaining
  /// registrations so native resources can finish before the runtime is
  /// reused for the next iteration.
  pub fn wait_on_registered(&mut self) {
    let mut idle_rounds = 0;
    loop {
      if self.state.borrow().event_loop.registered_count() == 0 {
        return;
      }
      let task = {
        self
          .state
          .borrow_mut()
          .event_loop
          .take_timeout(Duration::from_millis(100))
      };
      match task {
        Some((callback, payload)) => {
          idle_rounds = 0;
          let scope = &mut self.handle_scope();
          callback(scope, payload);
          scope.perform_microtask_checkpoint();
        }
        None => {
          idle_rounds += 1;
          // Native tasks resolve or drop their handles; a long silence
          // means something leaked. Reset instead of hanging the VU.
          if idle_rounds >= 100 {
            warn!("event loop drain stalled, dropping outstanding registrations");
            self.state.borrow_mut().event_loop.reset();
            return;
          }
        }
      }
    }
  }

  fn take_captured_exception(&mut self) -> Option<JsError> {
    let exception = self.state.borrow_mut().exceptions.exception.take()?;
    let scope = &mut self.handle_scope();
    let exception = v8::Local::new(scope, exception);
    let state_rc = Self::state(scope);
    let mut state = state_rc.borrow_mut();
    Some(JsError::from_v8_exception(
      scope,
      exception,
      Some(&mut state.sourcemaps),
    ))
  }
}

// State management specific methods.
impl JsRuntime {
  /// Returns the runtime state stored in the given isolate.
  pub fn state(isolate: &v8::Isolate) -> Rc<RefCell<JsRuntimeState>> {
    isolate
      .get_slot::<Rc<RefCell<JsRuntimeState>>>()
      .unwrap()
      .clone()
  }

  /// Returns the runtime's state.
  pub fn get_state(&self) -> Rc<RefCell<JsRuntimeState>> {
    Self::state(&self.isolate)
  }

  /// Returns a v8 handle scope for the runtime.
  pub fn handle_scope(&mut self) -> v8::HandleScope {
    let context = self.context();
    v8::HandleScope::with_context(&mut self.isolate, context)
  }

  /// Returns the context created for the runtime.
  pub fn context(&mut self) -> v8::Global<v8::Context> {
    let state = self.get_state();
    let state = state.borrow();
    state.context.clone()
  }

  /// A thread-safe handle used to terminate execution from watchdogs.
  pub fn isolate_handle(&self) -> v8::IsolateHandle {
    self.isolate.thread_safe_handle()
  }

  /// Clears a pending termination so the isolate can run the next phase.
  pub fn cancel_termination(&mut self) {
    self.isolate.cancel_terminate_execution();
  }
}
