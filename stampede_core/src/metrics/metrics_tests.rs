use super::*;
use crate::prelude::*;
use std::sync::Arc;

#[test]
fn register1() {
  let registry = MetricRegistry::new();
  let m = registry
    .register("my_counter", MetricType::Counter, ValueType::Default)
    .unwrap();
  assert_eq!(m.name, "my_counter");

  // Same shape is idempotent.
  let again = registry
    .register("my_counter", MetricType::Counter, ValueType::Default)
    .unwrap();
  assert!(Arc::ptr_eq(&m, &again));

  // A different shape conflicts.
  assert!(registry
    .register("my_counter", MetricType::Gauge, ValueType::Default)
    .is_err());
}

#[test]
fn register_invalid_name1() {
  let registry = MetricRegistry::new();
  for name in ["", "1abc", "with space", "dash-ed", &"x".repeat(129)] {
    assert!(
      matches!(
        registry.register(name, MetricType::Counter, ValueType::Default),
        Err(ContractError::InvalidMetricName(_))
      ),
      "expected {name:?} to be rejected"
    );
  }
  assert!(registry
    .register("_ok_123", MetricType::Counter, ValueType::Default)
    .is_ok());
}

#[test]
fn builtin_metrics1() {
  let registry = MetricRegistry::new();
  let builtin = BuiltinMetrics::register(&registry).unwrap();
  assert_eq!(builtin.iterations.metric_type, MetricType::Counter);
  assert_eq!(builtin.iteration_duration.value_type, ValueType::Time);
  assert_eq!(builtin.checks.metric_type, MetricType::Rate);
  // Registering twice reuses the same entries.
  let again = BuiltinMetrics::register(&registry).unwrap();
  assert!(Arc::ptr_eq(&builtin.checks, &again.checks));
}

#[test]
fn tag_set1() {
  let tags = TagSet::new().with("group", "::outer").with("vu", "1");
  assert_eq!(tags.get("group"), Some("::outer"));
  assert_eq!(tags.get("missing"), None);

  let mut merged = tags.clone();
  merged.merge(&TagSet::new().with("vu", "2").with("iter", "0"));
  assert_eq!(merged.get("vu"), Some("2"));
  assert_eq!(merged.get("iter"), Some("0"));
  // Iteration order is deterministic (sorted by key).
  let keys: Vec<&str> = merged.iter().map(|(k, _)| k).collect();
  assert_eq!(keys, vec!["group", "iter", "vu"]);
}

#[test]
fn system_tag1() {
  assert_eq!("error_code".parse::<SystemTag>().unwrap(), SystemTag::ErrorCode);
  assert!("bogus".parse::<SystemTag>().is_err());
  let set = SystemTag::default_set();
  assert!(set.contains(&SystemTag::Group));
  assert!(set.contains(&SystemTag::OcspStatus));
  assert!(!set.contains(&SystemTag::Check));
}

#[tokio::test]
async fn sample_sender_drop_mode1() {
  let registry = MetricRegistry::new();
  let m = registry
    .register("m", MetricType::Counter, ValueType::Default)
    .unwrap();
  let (sender, mut rx) = SampleSender::channel(1, DeliveryMode::Drop);

  let tags = Arc::new(TagSet::new());
  sender.send(vec![Sample::now(m.clone(), 1.0, tags.clone())]);
  // The channel holds one batch; the second is dropped, not blocked on.
  sender.send(vec![Sample::now(m.clone(), 2.0, tags.clone())]);
  assert_eq!(sender.dropped_batches(), 1);

  let got = rx.recv().await.unwrap();
  assert_eq!(got.len(), 1);
  assert_eq!(got[0].value, 1.0);

  // Empty batches are elided entirely.
  sender.send(vec![]);
  assert_eq!(sender.dropped_batches(), 1);
}
