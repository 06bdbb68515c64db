//! Metric registry, samples and the delivery channel.
//!
//! VUs construct [`Sample`]s in native code and hand them to a
//! [`SampleSender`]. Delivery is non-blocking by default: a full channel
//! drops the batch and bumps a counter instead of coupling guest throughput
//! to the aggregator.

use crate::prelude::*;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

#[cfg(test)]
mod metrics_tests;

/// Valid metric names: leading letter or underscore, then word characters,
/// at most 128 total.
static METRIC_NAME_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,127}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
  Counter,
  Gauge,
  Rate,
  Trend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
  Default,
  Time,
  Data,
}

/// A registry entry. Metrics are write-once by name; re-registering with a
/// different shape is an error.
#[derive(Debug)]
pub struct Metric {
  pub name: String,
  pub metric_type: MetricType,
  pub value_type: ValueType,
}

/// The process-wide metric registry for one test run.
#[derive(Debug, Default)]
pub struct MetricRegistry {
  metrics: RwLock<HashMap<String, Arc<Metric>>>,
}

impl MetricRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a metric, or returns the existing entry when name, type and
  /// value type all match.
  pub fn register(
    &self,
    name: &str,
    metric_type: MetricType,
    value_type: ValueType,
  ) -> Result<Arc<Metric>, ContractError> {
    if !METRIC_NAME_REGEX.is_match(name) {
      return Err(ContractError::InvalidMetricName(name.to_string()));
    }

    let mut metrics = self.metrics.write();
    if let Some(existing) = metrics.get(name) {
      if existing.metric_type != metric_type
        || existing.value_type != value_type
      {
        return Err(ContractError::InvalidOption(format!(
          "metric {name:?} already registered with a different type"
        )));
      }
      return Ok(existing.clone());
    }

    let metric = Arc::new(Metric {
      name: name.to_string(),
      metric_type,
      value_type,
    });
    metrics.insert(name.to_string(), metric.clone());
    Ok(metric)
  }

  pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
    self.metrics.read().get(name).cloned()
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> =
      self.metrics.read().keys().cloned().collect();
    names.sort();
    names
  }
}

/// The builtin metrics every run carries, registered up front so user
/// scripts cannot redeclare them with another shape.
#[derive(Debug, Clone)]
pub struct BuiltinMetrics {
  pub iterations: Arc<Metric>,
  pub iteration_duration: Arc<Metric>,
  pub dropped_iterations: Arc<Metric>,
  pub checks: Arc<Metric>,
  pub data_sent: Arc<Metric>,
  pub data_received: Arc<Metric>,
  pub vus: Arc<Metric>,
  pub vus_max: Arc<Metric>,
  pub http_reqs: Arc<Metric>,
  pub http_req_duration: Arc<Metric>,
  pub http_req_failed: Arc<Metric>,
  pub http_req_blocked: Arc<Metric>,
  pub http_req_connecting: Arc<Metric>,
  pub http_req_tls_handshaking: Arc<Metric>,
  pub http_req_sending: Arc<Metric>,
  pub http_req_waiting: Arc<Metric>,
  pub http_req_receiving: Arc<Metric>,
  pub ws_sessions: Arc<Metric>,
  pub ws_connecting: Arc<Metric>,
  pub ws_session_duration: Arc<Metric>,
  pub ws_msgs_sent: Arc<Metric>,
  pub ws_msgs_received: Arc<Metric>,
  pub grpc_req_duration: Arc<Metric>,
}

impl BuiltinMetrics {
  pub fn register(registry: &MetricRegistry) -> Result<Self, ContractError> {
    use MetricType::*;
    use ValueType::*;

    let mut reg = |name: &str, mt: MetricType, vt: ValueType| {
      registry.register(name, mt, vt)
    };

    Ok(Self {
      iterations: reg("iterations", Counter, Default)?,
      iteration_duration: reg("iteration_duration", Trend, Time)?,
      dropped_iterations: reg("dropped_iterations", Counter, Default)?,
      checks: reg("checks", Rate, Default)?,
      data_sent: reg("data_sent", Counter, Data)?,
      data_received: reg("data_received", Counter, Data)?,
      vus: reg("vus", Gauge, Default)?,
      vus_max: reg("vus_max", Gauge, Default)?,
      http_reqs: reg("http_reqs", Counter, Default)?,
      http_req_duration: reg("http_req_duration", Trend, Time)?,
      http_req_failed: reg("http_req_failed", Rate, Default)?,
      http_req_blocked: reg("http_req_blocked", Trend, Time)?,
      http_req_connecting: reg("http_req_connecting", Trend, Time)?,
      http_req_tls_handshaking: reg("http_req_tls_handshaking", Trend, Time)?,
      http_req_sending: reg("http_req_sending", Trend, Time)?,
      http_req_waiting: reg("http_req_waiting", Trend, Time)?,
      http_req_receiving: reg("http_req_receiving", Trend, Time)?,
      ws_sessions: reg("ws_sessions", Counter, Default)?,
      ws_connecting: reg("ws_connecting", Trend, Time)?,
      ws_session_duration: reg("ws_session_duration", Trend, Time)?,
      ws_msgs_sent: reg("ws_msgs_sent", Counter, Default)?,
      ws_msgs_received: reg("ws_msgs_received", Counter, Default)?,
      grpc_req_duration: reg("grpc_req_duration", Trend, Time)?,
    })
  }
}

/// The system tags the engine may attach to samples. The enabled subset is
/// part of [`crate::bundle::options::Options`].
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SystemTag {
  Proto,
  Status,
  Method,
  Url,
  Name,
  Group,
  Check,
  Vu,
  Iter,
  Scenario,
  Error,
  ErrorCode,
  TlsVersion,
  OcspStatus,
}

impl SystemTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      SystemTag::Proto => "proto",
      SystemTag::Status => "status",
      SystemTag::Method => "method",
      SystemTag::Url => "url",
      SystemTag::Name => "name",
      SystemTag::Group => "group",
      SystemTag::Check => "check",
      SystemTag::Vu => "vu",
      SystemTag::Iter => "iter",
      SystemTag::Scenario => "scenario",
      SystemTag::Error => "error",
      SystemTag::ErrorCode => "error_code",
      SystemTag::TlsVersion => "tls_version",
      SystemTag::OcspStatus => "ocsp_status",
    }
  }

  /// The documented baseline of tags enabled by default.
  pub fn default_set() -> HashSet<SystemTag> {
    use SystemTag::*;
    HashSet::from_iter([
      Proto, Status, Method, Url, Name, Group, Vu, Iter, Scenario, Error,
      ErrorCode, TlsVersion, OcspStatus,
    ])
  }
}

impl FromStr for SystemTag {
  type Err = ContractError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    use SystemTag::*;
    match s {
      "proto" => Ok(Proto),
      "status" => Ok(Status),
      "method" => Ok(Method),
      "url" => Ok(Url),
      "name" => Ok(Name),
      "group" => Ok(Group),
      "check" => Ok(Check),
      "vu" => Ok(Vu),
      "iter" => Ok(Iter),
      "scenario" => Ok(Scenario),
      "error" => Ok(Error),
      "error_code" => Ok(ErrorCode),
      "tls_version" => Ok(TlsVersion),
      "ocsp_status" => Ok(OcspStatus),
      other => {
        Err(ContractError::InvalidOption(format!("unknown system tag {other:?}")))
      }
    }
  }
}

/// A small immutable tag map. `BTreeMap` keeps rendering deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
    self.0.insert(key.to_string(), value.into());
    self
  }

  pub fn set(&mut self, key: &str, value: impl Into<String>) {
    self.0.insert(key.to_string(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(|s| s.as_str())
  }

  pub fn merge(&mut self, other: &TagSet) {
    for (k, v) in other.iter() {
      self.0.insert(k.to_string(), v.to_string());
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// One measurement emitted by a builtin.
#[derive(Debug, Clone)]
pub struct Sample {
  pub metric: Arc<Metric>,
  pub time: SystemTime,
  pub value: f64,
  pub tags: Arc<TagSet>,
}

impl Sample {
  pub fn now(metric: Arc<Metric>, value: f64, tags: Arc<TagSet>) -> Self {
    Self {
      metric,
      time: SystemTime::now(),
      value,
      tags,
    }
  }
}

/// Sample delivery policy under aggregator backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
  /// Drop the batch and count it. The default.
  Drop,
  /// Block the VU until the aggregator catches up.
  Block,
}

/// The write half of the MPSC sample channel handed to every VU.
#[derive(Debug, Clone)]
pub struct SampleSender {
  tx: tokio::sync::mpsc::Sender<Vec<Sample>>,
  mode: DeliveryMode,
  dropped: Arc<AtomicU64>,
}

impl SampleSender {
  pub fn new(
    tx: tokio::sync::mpsc::Sender<Vec<Sample>>,
    mode: DeliveryMode,
  ) -> Self {
    Self {
      tx,
      mode,
      dropped: Arc::new(AtomicU64::new(0)),
    }
  }

  /// A sender feeding an in-process channel, returning the read half too.
  /// The buffer size is part of the deployment profile.
  pub fn channel(
    buffer: usize,
    mode: DeliveryMode,
  ) -> (Self, tokio::sync::mpsc::Receiver<Vec<Sample>>) {
    let (tx, rx) = tokio::sync::mpsc::channel(buffer);
    (Self::new(tx, mode), rx)
  }

  pub fn send(&self, samples: Vec<Sample>) {
    if samples.is_empty() {
      return;
    }
    match self.mode {
      DeliveryMode::Drop => {
        if let Err(e) = self.tx.try_send(samples) {
          let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
          warn!("sample channel full, dropped batch ({total} total): {e}");
        }
      }
      DeliveryMode::Block => {
        if self.tx.blocking_send(samples).is_err() {
          self.dropped.fetch_add(1, Ordering::Relaxed);
        }
      }
    }
  }

  pub fn dropped_batches(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}
