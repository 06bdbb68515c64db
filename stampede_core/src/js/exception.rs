//! Uncaught exception and unhandled promise rejection tracking.

use std::fmt::Debug;

pub type PromiseRejectionEntry = (v8::Global<v8::Promise>, v8::Global<v8::Value>);

/// Stores and manages uncaught exceptions for one runtime.
pub struct ExceptionState {
  /// A captured exception waiting to be reported.
  pub exception: Option<v8::Global<v8::Value>>,
  /// Promises that rejected with no handler, in rejection order. V8 tells
  /// us when a handler is attached later, at which point the entry is
  /// removed again.
  promise_rejections: Vec<PromiseRejectionEntry>,
}

impl Debug for ExceptionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExceptionState")
      .field("exception", &self.exception.is_some())
      .field("promise_rejections", &self.promise_rejections.len())
      .finish()
  }
}

impl ExceptionState {
  pub fn new() -> Self {
    Self {
      exception: None,
      promise_rejections: Vec::new(),
    }
  }

  pub fn capture_exception(&mut self, exception: v8::Global<v8::Value>) {
    if self.exception.is_none() {
      self.exception = Some(exception);
    }
  }

  pub fn capture_promise_rejection(
    &mut self,
    promise: v8::Global<v8::Promise>,
    reason: v8::Global<v8::Value>,
  ) {
    if !self.promise_rejections.iter().any(|(p, _)| *p == promise) {
      self.promise_rejections.push((promise, reason));
    }
  }

  pub fn remove_promise_rejection(&mut self, promise: &v8::Global<v8::Promise>) {
    self.promise_rejections.retain(|(p, _)| p != promise);
  }

  pub fn has_promise_rejection(&self) -> bool {
    !self.promise_rejections.is_empty()
  }

  /// Takes the earliest unhandled rejection, clearing the rest: one error
  /// is reported per drain, matching how the loop surfaces it.
  pub fn take_first_rejection(&mut self) -> Option<PromiseRejectionEntry> {
    if self.promise_rejections.is_empty() {
      return None;
    }
    let first = self.promise_rejections.remove(0);
    self.promise_rejections.clear();
    Some(first)
  }

  pub fn clear(&mut self) {
    self.exception = None;
    self.promise_rejections.clear();
  }
}

impl Default for ExceptionState {
  fn default() -> Self {
    Self::new()
  }
}
