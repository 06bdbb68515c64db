//! Script options: parsing, validation and merging.
//!
//! The script's exported `options` object round-trips through JSON into
//! [`Options`]. Unknown fields warn instead of failing; shape errors fail
//! the bundle. External (engine) options override script options for every
//! field they explicitly set.

use crate::metrics::SystemTag;
use crate::prelude::*;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(test)]
mod options_tests;

/// A duration in the Go-style string form (`"1m30s"`), also accepted as a
/// bare number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl Serialize for DurationValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&render_duration(self.0))
  }
}

impl<'de> Deserialize<'de> for DurationValue {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Text(String),
      Millis(f64),
    }
    match Raw::deserialize(deserializer)? {
      Raw::Text(text) => parse_duration(&text)
        .map(DurationValue)
        .map_err(serde::de::Error::custom),
      Raw::Millis(ms) if ms >= 0.0 => {
        Ok(DurationValue(Duration::from_millis(ms as u64)))
      }
      Raw::Millis(ms) => {
        Err(serde::de::Error::custom(format!("negative duration {ms}")))
      }
    }
  }
}

/// Parses `"1h2m3s"`, `"500ms"`, `"0.5s"` and friends.
pub fn parse_duration(text: &str) -> Result<Duration, ContractError> {
  let text = text.trim();
  if text.is_empty() {
    return Err(ContractError::InvalidOption("empty duration".to_string()));
  }

  let mut total = Duration::ZERO;
  let mut number = String::new();
  let mut unit = String::new();
  let mut segments: Vec<(String, String)> = vec![];

  for c in text.chars() {
    if c.is_ascii_digit() || c == '.' {
      if !unit.is_empty() {
        segments.push((number.clone(), unit.clone()));
        number.clear();
        unit.clear();
      }
      number.push(c);
    } else {
      unit.push(c);
    }
  }
  segments.push((number, unit));

  for (number, unit) in segments {
    let value: f64 = number.parse().map_err(|_| {
      ContractError::InvalidOption(format!("invalid duration {text:?}"))
    })?;
    let unit_secs = match unit.as_str() {
      "h" => 3600.0,
      "m" => 60.0,
      "s" => 1.0,
      "ms" => 1e-3,
      "us" | "µs" => 1e-6,
      "ns" => 1e-9,
      _ => {
        return Err(ContractError::InvalidOption(format!(
          "invalid duration unit {unit:?} in {text:?}"
        )))
      }
    };
    total += Duration::from_secs_f64(value * unit_secs);
  }
  Ok(total)
}

fn render_duration(duration: Duration) -> String {
  let ms = duration.as_millis();
  if ms % 1000 == 0 {
    format!("{}s", ms / 1000)
  } else {
    format!("{ms}ms")
  }
}

/// One ramp stage of the executor schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
  pub duration: DurationValue,
  pub target: u64,
}

/// `tlsVersion`: a single version or a `{min, max}` range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TlsVersion {
  Single(String),
  Range {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<String>,
  },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
  pub vus: Option<u64>,
  pub iterations: Option<u64>,
  pub duration: Option<DurationValue>,
  pub stages: Option<Vec<Stage>>,
  pub paused: Option<bool>,
  /// Escalate builtin errors into thrown exceptions.
  pub throw: Option<bool>,
  pub max_redirects: Option<u32>,
  #[serde(rename = "insecureSkipTLSVerify")]
  pub insecure_skip_tls_verify: Option<bool>,
  pub tls_version: Option<TlsVersion>,
  pub tls_cipher_suites: Option<Vec<String>>,
  /// Raw threshold expressions per metric; the evaluator collaborator
  /// parses them.
  pub thresholds: Option<BTreeMap<String, Vec<String>>>,
  /// Hostname to address overrides for the dialer.
  pub hosts: Option<BTreeMap<String, String>>,
  #[serde(rename = "blacklistIPs")]
  pub blacklist_ips: Option<Vec<ipnet::IpNet>>,
  /// Glob patterns of hostnames requests may never touch.
  pub block_hostnames: Option<Vec<String>>,
  pub system_tags: Option<Vec<String>>,
  pub no_cookies_reset: Option<bool>,
  pub setup_timeout: Option<DurationValue>,
  pub teardown_timeout: Option<DurationValue>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub tags: BTreeMap<String, String>,

  /// Unknown keys, kept for the warning pass. An empty map flattens to
  /// nothing on the way back out.
  #[serde(flatten)]
  pub extra: BTreeMap<String, serde_json::Value>,

  #[serde(skip)]
  system_tag_cache: OnceCell<HashSet<SystemTag>>,
}

impl Options {
  /// Parses the script's exported options. Unknown keys produce warnings,
  /// shape errors fail.
  pub fn from_json(value: serde_json::Value) -> Result<Options, ContractError> {
    if value.is_null() {
      return Ok(Options::default());
    }
    if !value.is_object() {
      return Err(ContractError::InvalidOption(
        "options must be an object".to_string(),
      ));
    }
    let options: Options = serde_json::from_value(value)
      .map_err(|e| ContractError::InvalidOption(e.to_string()))?;
    options.warn_unknown();
    Ok(options)
  }

  fn warn_unknown(&self) {
    for key in self.extra.keys() {
      warn!("unknown option {key:?} ignored");
    }
    if let Some(tags) = &self.system_tags {
      for tag in tags {
        if tag.parse::<SystemTag>().is_err() {
          warn!("unknown system tag {tag:?} ignored");
        }
      }
    }
  }

  /// Overlays `other` on top of `self`: every field `other` explicitly set
  /// wins. Deterministic, and commutative only between options that touch
  /// disjoint fields.
  pub fn merged_with(&self, other: &Options) -> Options {
    let mut out = self.clone();
    macro_rules! take {
      ($field:ident) => {
        if other.$field.is_some() {
          out.$field = other.$field.clone();
        }
      };
    }
    take!(vus);
    take!(iterations);
    take!(duration);
    take!(stages);
    take!(paused);
    take!(throw);
    take!(max_redirects);
    take!(insecure_skip_tls_verify);
    take!(tls_version);
    take!(tls_cipher_suites);
    take!(thresholds);
    take!(hosts);
    take!(blacklist_ips);
    take!(block_hostnames);
    take!(system_tags);
    take!(no_cookies_reset);
    take!(setup_timeout);
    take!(teardown_timeout);
    if !other.tags.is_empty() {
      for (k, v) in other.tags.iter() {
        out.tags.insert(k.clone(), v.clone());
      }
    }
    out.system_tag_cache = OnceCell::new();
    out
  }

  /// The enabled system tags, defaulting to the documented baseline.
  pub fn system_tag_set(&self) -> &HashSet<SystemTag> {
    self.system_tag_cache.get_or_init(|| match &self.system_tags {
      None => SystemTag::default_set(),
      Some(tags) => tags
        .iter()
        .filter_map(|t| t.parse::<SystemTag>().ok())
        .collect(),
    })
  }

  pub fn max_redirects(&self) -> u32 {
    self.max_redirects.unwrap_or(10)
  }

  pub fn throw_on_error(&self) -> bool {
    self.throw.unwrap_or(false)
  }

  pub fn no_cookies_reset(&self) -> bool {
    self.no_cookies_reset.unwrap_or(false)
  }

  pub fn setup_timeout(&self) -> Duration {
    self
      .setup_timeout
      .map(|d| d.0)
      .unwrap_or(Duration::from_secs(60))
  }

  pub fn teardown_timeout(&self) -> Duration {
    self
      .teardown_timeout
      .map(|d| d.0)
      .unwrap_or(Duration::from_secs(60))
  }

  /// Whether requests to this hostname are blocked by `blockHostnames`.
  pub fn hostname_blocked(&self, host: &str) -> bool {
    let Some(patterns) = &self.block_hostnames else {
      return false;
    };
    patterns.iter().any(|p| {
      glob::Pattern::new(p)
        .map(|pattern| pattern.matches(host))
        .unwrap_or(false)
    })
  }
}

impl PartialEq for Options {
  fn eq(&self, other: &Self) -> bool {
    // The cache is derived state.
    serde_json::to_value(self).ok() == serde_json::to_value(other).ok()
  }
}
