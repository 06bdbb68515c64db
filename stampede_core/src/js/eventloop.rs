//! Cooperative per-VU event loop.
//!
//! The loop is the boundary between native callbacks and guest code: native
//! tasks (timers, transports) run wherever they like, but their completions
//! re-enter the isolate strictly through this queue, on the VU's own thread.
//!
//! A builtin that wants to resume guest code later calls [`EventLoop::register`]
//! with a continuation and ships the returned [`EnqueueHandle`] into its
//! native task. Resolving the handle (or dropping it) wakes the loop; the
//! continuation then runs with the runtime lock implicitly held, since the
//! loop *is* the runtime's thread.

use crate::prelude::*;

use std::any::Any;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use std::time::Duration;

pub type JsTaskId = i32;

/// Next task ID, unique process-wide.
///
/// NOTE: Starts from 1.
pub fn next_task_id() -> JsTaskId {
  static GLOBAL: AtomicI32 = AtomicI32::new(1);
  GLOBAL.fetch_add(1, Ordering::Relaxed)
}

/// What a native task hands back to its continuation. `None` means the task
/// was dropped without resolving (cancellation or panic on the native side).
pub type TaskPayload = Option<Box<dyn Any + Send + 'static>>;

/// A continuation that re-enters guest code. Runs on the loop thread, so it
/// may hold `v8::Global` handles.
pub type TaskCallback = Box<dyn FnOnce(&mut v8::HandleScope, TaskPayload)>;

/// One-shot wakeup handle for a registered callback. Send it anywhere;
/// dropping it without [`EnqueueHandle::enqueue`] still wakes the loop with
/// an empty payload so the registration can be retired.
pub struct EnqueueHandle {
  inner: Option<(JsTaskId, mpsc::Sender<(JsTaskId, TaskPayload)>)>,
}

impl EnqueueHandle {
  pub fn enqueue(mut self, payload: Box<dyn Any + Send + 'static>) {
    if let Some((id, tx)) = self.inner.take() {
      // The receiver only disappears when the VU itself is gone.
      let _ = tx.send((id, Some(payload)));
    }
  }

  pub fn task_id(&self) -> JsTaskId {
    self.inner.as_ref().map(|(id, _)| *id).unwrap_or(0)
  }
}

impl Drop for EnqueueHandle {
  fn drop(&mut self) {
    if let Some((id, tx)) = self.inner.take() {
      let _ = tx.send((id, None));
    }
  }
}

/// The queue half of the loop. Driving it against an isolate happens in
/// [`crate::js::JsRuntime`], which owns the scopes.
pub struct EventLoop {
  tx: mpsc::Sender<(JsTaskId, TaskPayload)>,
  rx: mpsc::Receiver<(JsTaskId, TaskPayload)>,
  callbacks: HashMap<JsTaskId, TaskCallback>,
  registered: usize,
}

impl EventLoop {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::channel();
    Self {
      tx,
      rx,
      callbacks: HashMap::new(),
      registered: 0,
    }
  }

  /// Registers a continuation and returns its one-shot wakeup handle. The
  /// loop will not report idle while any registration is outstanding.
  pub fn register(&mut self, callback: TaskCallback) -> EnqueueHandle {
    let id = next_task_id();
    self.callbacks.insert(id, callback);
    self.registered += 1;
    trace!("event loop registered task:{id}, outstanding:{}", self.registered);
    EnqueueHandle {
      inner: Some((id, self.tx.clone())),
    }
  }

  pub fn registered_count(&self) -> usize {
    self.registered
  }

  /// Non-blocking pop of the next completed task.
  pub fn try_take(&mut self) -> Option<(TaskCallback, TaskPayload)> {
    loop {
      let (id, payload) = self.rx.try_recv().ok()?;
      if let Some(cb) = self.retire(id) {
        return Some((cb, payload));
      }
    }
  }

  /// Blocking pop with a timeout, used when the queue is empty but
  /// registrations are outstanding.
  pub fn take_timeout(
    &mut self,
    timeout: Duration,
  ) -> Option<(TaskCallback, TaskPayload)> {
    loop {
      let (id, payload) = self.rx.recv_timeout(timeout).ok()?;
      if let Some(cb) = self.retire(id) {
        return Some((cb, payload));
      }
    }
  }

  fn retire(&mut self, id: JsTaskId) -> Option<TaskCallback> {
    match self.callbacks.remove(&id) {
      Some(cb) => {
        self.registered -= 1;
        Some(cb)
      }
      None => {
        // A handle resolved twice cannot happen (one-shot by move); a
        // missing callback means the loop was reset mid-flight.
        trace!("event loop dropped wakeup for unknown task:{id}");
        None
      }
    }
  }

  /// Drops all outstanding registrations. Only safe between iterations.
  pub fn reset(&mut self) {
    self.callbacks.clear();
    self.registered = 0;
    while self.rx.try_recv().is_ok() {}
  }
}

impl Default for EventLoop {
  fn default() -> Self {
    Self::new()
  }
}
