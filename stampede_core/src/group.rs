//! Hierarchical groups and checks.
//!
//! Groups name regions of an iteration; checks are named predicates counted
//! under the group active at first evaluation. Both are shared by every VU
//! of a run, so ids must be stable and counters atomic.

use crate::prelude::*;

use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
mod group_tests;

/// Path separator for nested group names.
pub const GROUP_SEPARATOR: &str = "::";

fn stable_id(path: &str) -> String {
  let digest = Md5::digest(path.as_bytes());
  hex::encode(digest)
}

/// A node of the group tree. The root carries the empty name and path.
#[derive(Debug)]
pub struct Group {
  pub name: String,
  /// Full path of the group, `::`-joined. Empty for the root.
  pub path: String,
  /// Stable across VUs and runs for the same script.
  pub id: String,
  pub parent: Weak<Group>,
  children: RwLock<HashMap<String, Arc<Group>>>,
  checks: RwLock<HashMap<String, Arc<Check>>>,
}

impl Group {
  pub fn root() -> Arc<Group> {
    Arc::new(Group {
      name: String::new(),
      path: String::new(),
      id: stable_id(""),
      parent: Weak::new(),
      children: RwLock::new(HashMap::new()),
      checks: RwLock::new(HashMap::new()),
    })
  }

  /// Returns the named child, creating it lazily on first entry. Sibling
  /// names are unique by construction.
  pub fn child(self: &Arc<Group>, name: &str) -> Arc<Group> {
    if let Some(existing) = self.children.read().get(name) {
      return existing.clone();
    }

    let mut children = self.children.write();
    // Lost the race between read and write locks, somebody else made it.
    if let Some(existing) = children.get(name) {
      return existing.clone();
    }

    let path = format!("{}{}{}", self.path, GROUP_SEPARATOR, name);
    let group = Arc::new(Group {
      name: name.to_string(),
      id: stable_id(&path),
      path,
      parent: Arc::downgrade(self),
      children: RwLock::new(HashMap::new()),
      checks: RwLock::new(HashMap::new()),
    });
    children.insert(name.to_string(), group.clone());
    group
  }

  /// Returns the named check under this group, creating it lazily.
  pub fn check(self: &Arc<Group>, name: &str) -> Arc<Check> {
    if let Some(existing) = self.checks.read().get(name) {
      return existing.clone();
    }

    let mut checks = self.checks.write();
    if let Some(existing) = checks.get(name) {
      return existing.clone();
    }

    let path = format!("{}{}{}", self.path, GROUP_SEPARATOR, name);
    let check = Arc::new(Check {
      name: name.to_string(),
      id: stable_id(&path),
      path,
      group: Arc::downgrade(self),
      passes: AtomicU64::new(0),
      fails: AtomicU64::new(0),
    });
    checks.insert(name.to_string(), check.clone());
    check
  }

  pub fn children(&self) -> Vec<Arc<Group>> {
    self.children.read().values().cloned().collect()
  }

  pub fn checks(&self) -> Vec<Arc<Check>> {
    self.checks.read().values().cloned().collect()
  }

  pub fn is_root(&self) -> bool {
    self.path.is_empty()
  }
}

/// A named predicate with monotonically non-decreasing counters.
#[derive(Debug)]
pub struct Check {
  pub name: String,
  pub path: String,
  pub id: String,
  pub group: Weak<Group>,
  passes: AtomicU64,
  fails: AtomicU64,
}

impl Check {
  pub fn record(&self, passed: bool) {
    if passed {
      self.passes.fetch_add(1, Ordering::Relaxed);
    } else {
      self.fails.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn passes(&self) -> u64 {
    self.passes.load(Ordering::Relaxed)
  }

  pub fn fails(&self) -> u64 {
    self.fails.load(Ordering::Relaxed)
  }
}
