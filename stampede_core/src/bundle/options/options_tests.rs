use super::*;
use serde_json::json;

#[test]
fn parse_duration1() {
  assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
  assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
  assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
  assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
  assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
  assert!(parse_duration("").is_err());
  assert!(parse_duration("10x").is_err());
  assert!(parse_duration("abc").is_err());
}

#[test]
fn options_from_json1() {
  let options = Options::from_json(json!({
    "vus": 10,
    "iterations": 100,
    "duration": "30s",
    "maxRedirects": 5,
    "throw": true,
    "noCookiesReset": true,
    "setupTimeout": "10s",
    "thresholds": {"http_req_duration": ["p(95)<500"]},
    "tags": {"env": "staging"},
    "stages": [{"duration": "10s", "target": 20}],
  }))
  .unwrap();

  assert_eq!(options.vus, Some(10));
  assert_eq!(options.iterations, Some(100));
  assert_eq!(options.duration.unwrap().0, Duration::from_secs(30));
  assert_eq!(options.max_redirects(), 5);
  assert!(options.throw_on_error());
  assert!(options.no_cookies_reset());
  assert_eq!(options.setup_timeout(), Duration::from_secs(10));
  assert_eq!(options.teardown_timeout(), Duration::from_secs(60));
  assert_eq!(
    options.thresholds.as_ref().unwrap()["http_req_duration"],
    vec!["p(95)<500".to_string()]
  );
  assert_eq!(options.tags["env"], "staging");
  let stages = options.stages.as_ref().unwrap();
  assert_eq!(stages.len(), 1);
  assert_eq!(stages[0].target, 20);
}

#[test]
fn options_unknown_keys_warn1() {
  // Unknown keys land in `extra` and warn; they never fail the parse.
  let options = Options::from_json(json!({
    "vus": 1,
    "definitelyNotAnOption": {"x": 1},
  }))
  .unwrap();
  assert_eq!(options.vus, Some(1));
  assert!(options.extra.contains_key("definitelyNotAnOption"));
}

#[test]
fn options_shape_error1() {
  assert!(Options::from_json(json!({"vus": "many"})).is_err());
  assert!(Options::from_json(json!("nope")).is_err());
  assert!(Options::from_json(serde_json::Value::Null).is_ok());
}

#[test]
fn options_merge1() {
  let script = Options::from_json(json!({
    "vus": 10,
    "duration": "30s",
    "tags": {"a": "1", "b": "2"},
  }))
  .unwrap();
  let external = Options::from_json(json!({
    "vus": 20,
    "tags": {"b": "3"},
  }))
  .unwrap();

  let merged = script.merged_with(&external);
  // Explicitly-set external fields win.
  assert_eq!(merged.vus, Some(20));
  // Untouched script fields survive.
  assert_eq!(merged.duration.unwrap().0, Duration::from_secs(30));
  assert_eq!(merged.tags["a"], "1");
  assert_eq!(merged.tags["b"], "3");
}

#[test]
fn options_round_trip1() {
  let options = Options::from_json(json!({
    "vus": 5,
    "duration": "1m30s",
    "systemTags": ["method", "status"],
    "blockHostnames": ["*.internal"],
  }))
  .unwrap();

  let rendered = serde_json::to_value(&options).unwrap();
  let again = Options::from_json(rendered).unwrap();
  assert_eq!(options, again);
}

#[test]
fn system_tag_set1() {
  let defaults = Options::default();
  assert!(defaults.system_tag_set().contains(&crate::metrics::SystemTag::Url));

  let restricted = Options::from_json(json!({
    "systemTags": ["method", "nonsense"],
  }))
  .unwrap();
  let set = restricted.system_tag_set();
  assert_eq!(set.len(), 1);
  assert!(set.contains(&crate::metrics::SystemTag::Method));
}

#[test]
fn hostname_blocked1() {
  let options = Options::from_json(json!({
    "blockHostnames": ["*.cluster.local", "admin.example.com"],
  }))
  .unwrap();
  assert!(options.hostname_blocked("db.cluster.local"));
  assert!(options.hostname_blocked("admin.example.com"));
  assert!(!options.hostname_blocked("example.com"));
  assert!(!Options::default().hostname_blocked("anything"));
}

#[test]
fn tls_and_blacklist1() {
  let options = Options::from_json(json!({
    "tlsVersion": {"min": "tls1.2", "max": "tls1.3"},
    "blacklistIPs": ["10.0.0.0/8"],
    "insecureSkipTLSVerify": true,
  }))
  .unwrap();
  assert!(matches!(options.tls_version, Some(TlsVersion::Range { .. })));
  assert_eq!(options.blacklist_ips.as_ref().unwrap().len(), 1);
  assert_eq!(options.insecure_skip_tls_verify, Some(true));

  let single = Options::from_json(json!({"tlsVersion": "tls1.3"})).unwrap();
  assert!(matches!(single.tls_version, Some(TlsVersion::Single(_))));
}
