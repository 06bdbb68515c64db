use super::*;
use std::sync::Arc;

#[test]
fn root1() {
  let root = Group::root();
  assert!(root.is_root());
  assert_eq!(root.path, "");
  assert_eq!(root.name, "");
  assert!(root.parent.upgrade().is_none());
}

#[test]
fn child1() {
  let root = Group::root();
  let outer = root.child("outer");
  let inner = outer.child("inner");

  assert_eq!(outer.path, "::outer");
  assert_eq!(inner.path, "::outer::inner");
  assert_eq!(inner.name, "inner");
  assert!(Arc::ptr_eq(&inner.parent.upgrade().unwrap(), &outer));
  assert!(Arc::ptr_eq(&outer.parent.upgrade().unwrap(), &root));

  // Lazily created once, then reused.
  assert!(Arc::ptr_eq(&root.child("outer"), &outer));
  assert_eq!(root.children().len(), 1);
}

#[test]
fn stable_ids1() {
  // Ids depend only on the path, so they match across trees (i.e. across
  // VUs and runs).
  let a = Group::root().child("g");
  let b = Group::root().child("g");
  assert_eq!(a.id, b.id);
  assert_ne!(a.id, Group::root().id);
}

#[test]
fn check1() {
  let root = Group::root();
  let group = root.child("g");
  let check = group.check("status is 200");

  assert_eq!(check.path, "::g::status is 200");
  assert_eq!(check.passes(), 0);
  assert_eq!(check.fails(), 0);

  check.record(true);
  check.record(true);
  check.record(false);
  assert_eq!(check.passes(), 2);
  assert_eq!(check.fails(), 1);

  // Same name resolves to the same counters.
  let again = group.check("status is 200");
  assert!(Arc::ptr_eq(&check, &again));
  assert_eq!(group.checks().len(), 1);
}
