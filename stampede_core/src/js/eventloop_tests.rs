use super::eventloop::*;
use std::time::Duration;

// The queue mechanics need no isolate: continuations are opaque boxes here.

fn noop() -> TaskCallback {
  Box::new(|_scope, _payload| {})
}

#[test]
fn next_task_id1() {
  assert!(next_task_id() > 0);
  assert_ne!(next_task_id(), next_task_id());
}

#[test]
fn register_and_resolve1() {
  let mut el = EventLoop::new();
  assert_eq!(el.registered_count(), 0);
  assert!(el.try_take().is_none());

  let handle = el.register(noop());
  assert_eq!(el.registered_count(), 1);

  handle.enqueue(Box::new(42_i32));
  let (_cb, payload) = el.try_take().unwrap();
  assert_eq!(el.registered_count(), 0);
  let value = payload.unwrap().downcast::<i32>().unwrap();
  assert_eq!(*value, 42);
}

#[test]
fn fifo_order1() {
  let mut el = EventLoop::new();
  let h1 = el.register(noop());
  let h2 = el.register(noop());
  let id1 = h1.task_id();
  let id2 = h2.task_id();

  // Resolve out of registration order; wakeup order is delivery order.
  h2.enqueue(Box::new(id2));
  h1.enqueue(Box::new(id1));

  let (_, p) = el.try_take().unwrap();
  assert_eq!(*p.unwrap().downcast::<i32>().unwrap(), id2);
  let (_, p) = el.try_take().unwrap();
  assert_eq!(*p.unwrap().downcast::<i32>().unwrap(), id1);
}

#[test]
fn dropped_handle_wakes_loop1() {
  let mut el = EventLoop::new();
  let handle = el.register(noop());
  drop(handle);

  // The registration retires with an empty payload instead of leaking.
  let (_cb, payload) = el.take_timeout(Duration::from_secs(1)).unwrap();
  assert!(payload.is_none());
  assert_eq!(el.registered_count(), 0);
}

#[test]
fn cross_thread_resolve1() {
  let mut el = EventLoop::new();
  let handle = el.register(noop());

  std::thread::spawn(move || {
    std::thread::sleep(Duration::from_millis(10));
    handle.enqueue(Box::new("done".to_string()));
  });

  let (_cb, payload) = el.take_timeout(Duration::from_secs(5)).unwrap();
  let value = payload.unwrap().downcast::<String>().unwrap();
  assert_eq!(*value, "done");
}

#[test]
fn reset1() {
  let mut el = EventLoop::new();
  let _h1 = el.register(noop());
  let h2 = el.register(noop());
  h2.enqueue(Box::new(()));

  el.reset();
  assert_eq!(el.registered_count(), 0);
  assert!(el.try_take().is_none());
}
