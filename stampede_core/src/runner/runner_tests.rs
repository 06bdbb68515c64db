use super::*;
use crate::bundle::options::Options;
use crate::bundle::RuntimeOptions;
use crate::modules::http::HttpResponse;
use crate::prelude::*;
use crate::test::{
  make_run, make_run_with, ok_response, run_from_bundle, samples_for,
  MockTransport,
};

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn external(value: serde_json::Value) -> Options {
  Options::from_json(value).unwrap()
}

fn activation() -> VuActivationParams {
  VuActivationParams::default()
}

#[test]
fn minimal_iteration1() {
  let mut run = make_run("export default function () {}").unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  let samples = run.drain();
  let durations = samples_for(&samples, "iteration_duration");
  let iterations = samples_for(&samples, "iterations");
  assert_eq!(durations.len(), 1);
  assert_eq!(iterations.len(), 1);
  assert_eq!(iterations[0].value, 1.0);
  assert_eq!(iterations[0].tags.get("vu"), Some("1"));
  assert_eq!(iterations[0].tags.get("iter"), Some("0"));
}

#[test]
fn check_pass_fail1() {
  let script = r#"
    import { check } from "k6";
    export default function () {
      check(3, {
        "v===3": function (v) { return v === 3; },
        "v===4": function (v) { return v === 4; },
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  let checks = run.runner.group_root.checks();
  let pass = checks.iter().find(|c| c.name == "v===3").unwrap();
  let fail = checks.iter().find(|c| c.name == "v===4").unwrap();
  assert_eq!((pass.passes(), pass.fails()), (1, 0));
  assert_eq!((fail.passes(), fail.fails()), (0, 1));

  let samples = run.drain();
  let check_samples = samples_for(&samples, "checks");
  assert_eq!(check_samples.len(), 2);
  let values: Vec<f64> = check_samples.iter().map(|s| s.value).collect();
  assert!(values.contains(&1.0) && values.contains(&0.0));
  // Same (root) group id, distinct check ids.
  assert_eq!(
    check_samples[0].tags.get("group_id"),
    check_samples[1].tags.get("group_id"),
  );
  assert_ne!(
    check_samples[0].tags.get("check_id"),
    check_samples[1].tags.get("check_id"),
  );
}

#[test]
fn nested_groups1() {
  let script = r#"
    import { group, check } from "k6";
    export default function () {
      group("outer", function () {
        group("inner", function () {
          check(1, { "deep": 1 });
        });
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  let root = &run.runner.group_root;
  let outer = root.child("outer");
  let inner = outer.child("inner");
  assert_eq!(outer.path, "::outer");
  assert_eq!(inner.path, "::outer::inner");
  assert!(Arc::ptr_eq(&inner.parent.upgrade().unwrap(), &outer));
  assert!(outer.parent.upgrade().unwrap().is_root());

  let samples = run.drain();
  let check_sample = samples_for(&samples, "checks")[0];
  assert_eq!(check_sample.tags.get("group"), Some("::outer::inner"));
  assert_eq!(
    check_sample.tags.get("group_id"),
    Some(inner.id.as_str())
  );
}

#[test]
fn group_pops_on_exception1() {
  let script = r#"
    import { group, check } from "k6";
    export default function () {
      try {
        group("boom", function () { throw new Error("x"); });
      } catch (e) {}
      check(1, { "after": 1 });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  // The check after the catch counts under the root, not under "boom".
  let samples = run.drain();
  let check_sample = samples_for(&samples, "checks")[0];
  assert_eq!(check_sample.tags.get("group"), Some(""));
}

#[test]
fn setup_data_round_trip1() {
  let script = r#"
    import { check } from "k6";
    export function setup() { return { v: 1 }; }
    export default function (data) {
      check(data, { "fresh copy": function (d) { return d.v === 1; } });
      data.v = 2;
    }
    export function teardown(data) {
      if (data.v !== 1) { throw new Error("teardown saw a mutation"); }
    }
  "#;
  let mut run = make_run(script).unwrap();
  run.runner.run_setup().unwrap();
  assert_eq!(run.runner.setup_data().as_deref(), Some("{\"v\":1}"));

  // Iterations across several VUs each get their own deserialised copy.
  for vu_id in 1..=5 {
    let mut vu = run.runner.new_vu(vu_id, vu_id).unwrap();
    let mut active = vu.activate(activation());
    for _ in 0..20 {
      active.run_once().unwrap();
    }
  }
  let checks = run.runner.group_root.checks();
  let fresh = checks.iter().find(|c| c.name == "fresh copy").unwrap();
  assert_eq!((fresh.passes(), fresh.fails()), (100, 0));

  run.runner.run_teardown().unwrap();
}

#[test]
fn archive_isolation1() {
  // Bundle, archive, re-hydrate on a fresh filesystem, run.
  let script = r#"
    import { check } from "k6";
    import lib from "./lib.js";
    export const file = lib;
    export default function () {
      check(file + "!", { "is hi!!": function (v) { return v === "hi!!"; } });
    }
  "#;
  let bundle = crate::test::make_bundle_with(
    script,
    &[("/scripts/lib.js", "export default \"hi!\";")],
    RuntimeOptions::default(),
    Options::default(),
  )
  .unwrap();

  let mut buffer = vec![];
  bundle.make_archive().write(&mut buffer).unwrap();
  let archive = crate::bundle::archive::Archive::read(buffer.as_slice()).unwrap();
  let bundle = Arc::new(
    crate::bundle::Bundle::from_archive(
      archive,
      RuntimeOptions::default(),
      Options::default(),
      Arc::new(crate::metrics::MetricRegistry::new()),
      crate::test::tokio_handle(),
    )
    .unwrap(),
  );

  let mut run = run_from_bundle(bundle, Transports::default()).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  let checks = run.runner.group_root.checks();
  let check = checks.iter().find(|c| c.name == "is hi!!").unwrap();
  assert_eq!((check.passes(), check.fails()), (1, 0));
}

#[test]
fn promise_rejection_surfaces1() {
  let script = r#"
    export default function () {
      if (__ITER === 0) {
        Promise.reject("boom");
      }
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());

  let err = active.run_once().unwrap_err();
  match &err {
    RunnerError::UnhandledRejection(e) => {
      assert!(e.to_string().contains("boom"), "{e}");
    }
    other => panic!("expected an unhandled rejection, got {other:?}"),
  }
  assert!(err.recoverable());

  // The next iteration proceeds normally.
  active.run_once().unwrap();
  drop(active);

  // Both iterations produced their samples.
  let samples = run.drain();
  assert_eq!(samples_for(&samples, "iterations").len(), 2);
}

#[test]
fn async_default_rejection1() {
  let script = r#"
    export default async function () {
      Promise.reject("boom");
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  let err = active.run_once().unwrap_err();
  assert!(err.to_string().contains("boom"), "{err}");
}

#[test]
fn rejection_with_null_reason1() {
  let script = "export default function () { Promise.reject(null); }";
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  let err = active.run_once().unwrap_err();
  assert!(matches!(err, RunnerError::UnhandledRejection(_)));
}

#[test]
fn cookie_reset_default1() {
  let transport = MockTransport::new(|req| {
    let mut response = ok_response("ok");
    if req.url.ends_with("/set") {
      response
        .headers
        .push(("Set-Cookie".to_string(), "sid=abc; Path=/".to_string()));
    }
    response
  });
  let script = r#"
    import http from "k6/http";
    export default function () {
      if (__ITER === 0) {
        http.get("http://test.local/set");
      } else {
        http.get("http://test.local/get");
      }
    }
  "#;

  // Default: iteration 2 sees no cookies from iteration 1.
  let mut run = make_run_with(
    script,
    &[],
    Options::default(),
    Transports {
      http: transport.clone(),
      ..Default::default()
    },
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  active.run_once().unwrap();
  drop(active);

  let log = transport.request_log();
  let get = log.iter().find(|r| r.url.ends_with("/get")).unwrap();
  assert!(
    !get.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("cookie")),
    "cookies leaked across iterations: {:?}",
    get.headers
  );

  // With noCookiesReset, iteration 2 still carries them.
  let transport = MockTransport::new(|req| {
    let mut response = ok_response("ok");
    if req.url.ends_with("/set") {
      response
        .headers
        .push(("Set-Cookie".to_string(), "sid=abc; Path=/".to_string()));
    }
    response
  });
  let mut run = make_run_with(
    script,
    &[],
    external(json!({"noCookiesReset": true})),
    Transports {
      http: transport.clone(),
      ..Default::default()
    },
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  active.run_once().unwrap();
  drop(active);

  let log = transport.request_log();
  let get = log.iter().find(|r| r.url.ends_with("/get")).unwrap();
  let cookie = get
    .headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
    .map(|(_, v)| v.as_str());
  assert_eq!(cookie, Some("sid=abc"));
}

#[test]
fn open_gating_per_vu1() {
  // Files opened during init stay readable for every VU; a path the init
  // phase never touched is gated for anything that starts later.
  let script = r#"
    import { check } from "k6";
    const seen = open("./data.txt");
    export default function () {
      check(seen, { "recorded file": function (v) { return v === "payload"; } });
    }
  "#;
  let fs = crate::test::mem_fs(
    script,
    &[
      ("/scripts/data.txt", "payload"),
      ("/scripts/never.txt", "hidden"),
    ],
  );
  let bundle = Arc::new(
    crate::bundle::Bundle::new(
      script.as_bytes(),
      url::Url::parse(crate::test::MAIN_URL).unwrap(),
      fs.clone(),
      RuntimeOptions::default(),
      Options::default(),
      Arc::new(crate::metrics::MetricRegistry::new()),
      crate::test::tokio_handle(),
    )
    .unwrap(),
  );
  let mut run = run_from_bundle(bundle, Transports::default()).unwrap();

  // Every VU re-reads the recorded file during its replay.
  for vu_id in 1..=2 {
    let mut vu = run.runner.new_vu(vu_id, vu_id).unwrap();
    let mut active = vu.activate(activation());
    active.run_once().unwrap();
  }
  let checks = run.runner.group_root.checks();
  let recorded = checks.iter().find(|c| c.name == "recorded file").unwrap();
  assert_eq!((recorded.passes(), recorded.fails()), (2, 0));

  // An init phase that starts after the gate dropped cannot open an
  // unseen path, so VU spawning never races against disk changes.
  let late = "open(\"./never.txt\");\nexport default function () {}";
  let err = match crate::bundle::Bundle::new(
    late.as_bytes(),
    url::Url::parse(crate::test::MAIN_URL).unwrap(),
    fs,
    RuntimeOptions::default(),
    Options::default(),
    Arc::new(crate::metrics::MetricRegistry::new()),
    crate::test::tokio_handle(),
  ) {
    Err(e) => e.to_string(),
    Ok(_) => panic!("expected the gated filesystem to reject the open"),
  };
  assert!(err.contains("not opened during the init phase"), "{err}");
}

#[test]
fn env_isolation_across_vus1() {
  let script = r#"
    import { check } from "k6";
    export default function () {
      check(__ENV.K, {
        "unset before write": function (v) { return v === undefined; },
      });
      __ENV.K = "written";
      check(__ENV.K, { "visible locally": function (v) { return v === "written"; } });
    }
  "#;
  let mut run = make_run(script).unwrap();
  for vu_id in 1..=2 {
    let mut vu = run.runner.new_vu(vu_id, vu_id).unwrap();
    let mut active = vu.activate(activation());
    active.run_once().unwrap();
  }
  let checks = run.runner.group_root.checks();
  let unset = checks.iter().find(|c| c.name == "unset before write").unwrap();
  // Both VUs observed an untouched __ENV; nothing leaked between them or
  // between iterations.
  assert_eq!((unset.passes(), unset.fails()), (2, 0));
}

#[test]
fn module_state_isolation1() {
  let script = r#"
    import { check } from "k6";
    import { bump } from "./counter.js";
    export default function () {
      check(bump(), { "own module state": function (v) { return v === 1; } });
    }
  "#;
  let mut run = crate::test::make_run_with(
    script,
    &[(
      "/scripts/counter.js",
      "var n = 0;\nexport function bump() { n += 1; return n; }",
    )],
    Options::default(),
    Transports::default(),
  )
  .unwrap();

  // Each VU re-executes the module, so each sees its own counter start at
  // zero.
  for vu_id in 1..=3 {
    let mut vu = run.runner.new_vu(vu_id, vu_id).unwrap();
    let mut active = vu.activate(activation());
    active.run_once().unwrap();
  }
  let checks = run.runner.group_root.checks();
  let own = checks.iter().find(|c| c.name == "own module state").unwrap();
  assert_eq!((own.passes(), own.fails()), (3, 0));
}

#[test]
fn shared_array1() {
  let script = r#"
    import { check } from "k6";
    import { SharedArray } from "k6/data";
    var rows = new SharedArray("rows", function () {
      return [{ id: 1 }, { id: 2 }];
    });
    export default function () {
      check(rows, {
        "length": function (r) { return r.length === 2; },
        "content": function (r) { return r[1].id === 2; },
        "read-only": function (r) {
          try { r[0] = "nope"; return false; } catch (e) { return true; }
        },
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  for vu_id in 1..=2 {
    let mut vu = run.runner.new_vu(vu_id, vu_id).unwrap();
    let mut active = vu.activate(activation());
    active.run_once().unwrap();
  }
  for name in ["length", "content", "read-only"] {
    let checks = run.runner.group_root.checks();
    let check = checks.iter().find(|c| c.name == name).unwrap();
    assert_eq!((check.passes(), check.fails()), (2, 0), "{name}");
  }
}

#[test]
fn sleep_and_cancellation1() {
  let script = r#"
    import { sleep } from "k6";
    export default function () {
      sleep(-5);     // clamps to zero
      sleep(0.01);
      sleep(30);     // interrupted by cancellation
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();

  let token = CancellationToken::new();
  let params = VuActivationParams {
    token: token.clone(),
    ..Default::default()
  };
  let cancel = std::thread::spawn({
    let token = token.clone();
    move || {
      std::thread::sleep(Duration::from_millis(300));
      token.cancel();
    }
  });

  let started = Instant::now();
  let mut active = vu.activate(params);
  let err = active.run_once().unwrap_err();
  assert!(matches!(err, RunnerError::Aborted(_)), "{err:?}");
  assert!(started.elapsed() < Duration::from_secs(10));
  cancel.join().unwrap();
}

#[test]
fn setup_timeout1() {
  let script = r#"
    import { sleep } from "k6";
    export const options = { setupTimeout: "200ms" };
    export function setup() { sleep(30); }
    export default function () {}
  "#;
  let run = make_run(script).unwrap();
  let err = run.runner.run_setup().unwrap_err();
  match err {
    RunnerError::SetupTimeout(d) => {
      assert_eq!(d, Duration::from_millis(200));
    }
    other => panic!("expected a setup timeout, got {other:?}"),
  }
  assert_eq!(err_code_setup(), 100);
}

fn err_code_setup() -> i32 {
  RunnerError::SetupTimeout(Duration::from_millis(200)).exit_code()
}

#[test]
fn script_error_continues1() {
  let script = r#"
    export default function () {
      if (__ITER === 0) { throw new Error("once"); }
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());

  let err = active.run_once().unwrap_err();
  match &err {
    RunnerError::Script(e) => assert!(e.to_string().contains("once"), "{e}"),
    other => panic!("expected a script error, got {other:?}"),
  }
  assert!(err.recoverable());
  active.run_once().unwrap();
}

#[test]
fn http_throw_option1() {
  let transport = MockTransport::new(|_req| HttpResponse {
    status: 0,
    error: Some("connection refused".to_string()),
    error_code: 1000,
    ..Default::default()
  });
  let script = r#"
    import http from "k6/http";
    export default function () {
      http.get("http://down.local/");
    }
  "#;

  // Default: errors come back on the response object.
  let mut run = make_run_with(
    script,
    &[],
    Options::default(),
    Transports { http: transport.clone(), ..Default::default() },
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);
  let samples = run.drain();
  let failed = samples_for(&samples, "http_req_failed");
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].value, 1.0);
  assert_eq!(failed[0].tags.get("error"), Some("connection refused"));

  // throw: true escalates to an exception.
  let mut run = make_run_with(
    script,
    &[],
    external(json!({"throw": true})),
    Transports { http: transport, ..Default::default() },
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  let err = active.run_once().unwrap_err();
  assert!(err.to_string().contains("connection refused"), "{err}");
}

#[test]
fn http_checks_and_tags1() {
  let transport = MockTransport::ok("{\"user\":\"ann\"}");
  let script = r#"
    import http from "k6/http";
    import { check } from "k6";
    export default function () {
      var res = http.get("http://api.local/users", { tags: { kind: "read" } });
      check(res, {
        "status 200": function (r) { return r.status === 200; },
        "json body": function (r) { return r.json().user === "ann"; },
      });
    }
  "#;
  let mut run = make_run_with(
    script,
    &[],
    Options::default(),
    Transports { http: transport, ..Default::default() },
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  let checks = run.runner.group_root.checks();
  for name in ["status 200", "json body"] {
    let check = checks.iter().find(|c| c.name == name).unwrap();
    assert_eq!((check.passes(), check.fails()), (1, 0), "{name}");
  }

  let samples = run.drain();
  let reqs = samples_for(&samples, "http_reqs");
  assert_eq!(reqs.len(), 1);
  assert_eq!(reqs[0].tags.get("method"), Some("GET"));
  assert_eq!(reqs[0].tags.get("status"), Some("200"));
  assert_eq!(reqs[0].tags.get("url"), Some("http://api.local/users"));
  assert_eq!(reqs[0].tags.get("kind"), Some("read"));
  assert!(samples_for(&samples, "data_received")[0].value > 0.0);
}

#[test]
fn http_redirects1() {
  let transport = MockTransport::new(|req| {
    if req.url.ends_with("/a") {
      HttpResponse {
        status: 302,
        headers: vec![("Location".to_string(), "/b".to_string())],
        ..Default::default()
      }
    } else {
      ok_response("landed")
    }
  });
  let script = r#"
    import http from "k6/http";
    import { check } from "k6";
    export default function () {
      var res = http.post("http://site.local/a", "payload");
      check(res, { "followed": function (r) { return r.status === 200; } });
    }
  "#;
  let mut run = make_run_with(
    script,
    &[],
    Options::default(),
    Transports { http: transport.clone(), ..Default::default() },
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  let log = transport.request_log();
  assert_eq!(log.len(), 2);
  assert_eq!(log[0].method, "POST");
  // 302 downgrades to GET with an empty body.
  assert_eq!(log[1].method, "GET");
  assert_eq!(log[1].url, "http://site.local/b");
  assert!(log[1].body.is_empty());

  // Both hops emitted their own request samples.
  let samples = run.drain();
  assert_eq!(samples_for(&samples, "http_reqs").len(), 2);
}

#[test]
fn custom_metrics1() {
  let script = r#"
    import { Counter, Trend } from "k6/metrics";
    var errors = new Counter("my_errors");
    var latency = new Trend("my_latency", true);
    export default function () {
      errors.add(2, { reason: "timeout" });
      latency.add(150.5);
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  assert!(run.runner.bundle.registry.get("my_errors").is_some());
  let samples = run.drain();
  let errors = samples_for(&samples, "my_errors");
  assert_eq!(errors.len(), 1);
  assert_eq!(errors[0].value, 2.0);
  assert_eq!(errors[0].tags.get("reason"), Some("timeout"));
  assert_eq!(samples_for(&samples, "my_latency")[0].value, 150.5);
}

#[test]
fn random_seed_determinism1() {
  let script = r#"
    import { check, randomSeed } from "k6";
    export default function () {
      randomSeed(42);
      var a = Math.random();
      randomSeed(42);
      var b = Math.random();
      check(null, { "deterministic": function () { return a === b; } });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);
  let checks = run.runner.group_root.checks();
  let det = checks.iter().find(|c| c.name == "deterministic").unwrap();
  assert_eq!((det.passes(), det.fails()), (1, 0));
}

#[test]
fn event_loop_timer1() {
  let script = r#"
    import { check } from "k6";
    export default function () {
      setTimeout(function () {
        check(true, { "timer fired": function (v) { return v; } });
      }, 20);
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  // run_once drains the loop, so the iteration waits for the timer.
  active.run_once().unwrap();
  drop(active);
  let checks = run.runner.group_root.checks();
  let fired = checks.iter().find(|c| c.name == "timer fired").unwrap();
  assert_eq!((fired.passes(), fired.fails()), (1, 0));
}

#[test]
fn scenario_exec_selector1() {
  let script = r#"
    import { check } from "k6";
    import exec from "k6/execution";
    export default function () { throw new Error("wrong entry"); }
    export function browse() {
      check(exec.scenario.name, {
        "scenario name": function (n) { return n === "browsing"; },
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(VuActivationParams {
    scenario: Some("browsing".to_string()),
    exec: Some("browse".to_string()),
    ..Default::default()
  });
  active.run_once().unwrap();
  drop(active);

  let checks = run.runner.group_root.checks();
  let name = checks.iter().find(|c| c.name == "scenario name").unwrap();
  assert_eq!((name.passes(), name.fails()), (1, 0));

  let samples = run.drain();
  let iterations = samples_for(&samples, "iterations");
  assert_eq!(iterations[0].tags.get("scenario"), Some("browsing"));
}

#[test]
fn crypto_and_encoding1() {
  let script = r#"
    import crypto from "k6/crypto";
    import encoding from "k6/encoding";
    import { check } from "k6";
    export default function () {
      check(null, {
        "md5": function () {
          return crypto.md5("hello", "hex") === "5d41402abc4b2a76b9719d911017c592";
        },
        "sha256 incremental": function () {
          var h = crypto.createHash("sha256");
          h.update("he");
          h.update("llo");
          return h.digest("hex") === crypto.sha256("hello", "hex");
        },
        "hmac": function () {
          return crypto.hmac("sha256", "key", "msg", "hex").length === 64;
        },
        "b64": function () {
          return encoding.b64encode("stampede") === "c3RhbXBlZGU=" &&
            encoding.b64decode("c3RhbXBlZGU=", "std", "s") === "stampede";
        },
        "hex": function () {
          return encoding.hexEncode("\x01\x02") === "0102";
        },
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  for check in run.runner.group_root.checks() {
    assert_eq!(
      (check.passes(), check.fails()),
      (1, 0),
      "check {} failed",
      check.name
    );
  }
}

// A self-signed certificate for stampede.test, valid until 2046.
static TEST_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIID5jCCAs6gAwIBAgIUOXiKOij+luNaldZeAGv2fq7hWJEwDQYJKoZIhvcNAQEL
BQAwaTELMAkGA1UEBhMCREUxDzANBgNVBAgMBkJlcmxpbjEPMA0GA1UEBwwGQmVy
bGluMREwDwYDVQQKDAhTdGFtcGVkZTENMAsGA1UECwwETG9hZDEWMBQGA1UEAwwN
c3RhbXBlZGUudGVzdDAeFw0yNjA4MDExMTE2MDBaFw00NjA3MjcxMTE2MDBaMGkx
CzAJBgNVBAYTAkRFMQ8wDQYDVQQIDAZCZXJsaW4xDzANBgNVBAcMBkJlcmxpbjER
MA8GA1UECgwIU3RhbXBlZGUxDTALBgNVBAsMBExvYWQxFjAUBgNVBAMMDXN0YW1w
ZWRlLnRlc3QwggEiMA0GCSqGSIb3DQEBAQUAA4IBDwAwggEKAoIBAQCpTfkTtNGr
SOIhr8VkUUe9edLWpFc0e21eIfL3L6kt7WrGMqPYQUWPT/68oxoZ+ZFoBwDBWfQb
Egc2f6/1fmyWo4twf4jLXTcG/6kVgi8mAPj3qtGGLqQLrDaPCYf9o067nTJTES15
p9kS0bkVr/N6a31NQUVd4KqEHjWMvhW89oeSutcqUhZiYpLZxaEU2I8PvMrKcZGK
4j2t3vuwkJ0bRCJGbYQ+SQvrtKnSUqhj7m8TX4mTfPBPeOc5dzsPAzo3LsJ2OY48
e91MbpVeRg0FCoArsF30CgK67bS0aCuHQWsnQlC+sKsGcyCL6q0fPHjrBceoNljf
TvOFHmCyKkIRAgMBAAGjgYUwgYIwHQYDVR0OBBYEFEq+66h0c3HNXPL8L1f8wWht
CV96MB8GA1UdIwQYMBaAFEq+66h0c3HNXPL8L1f8wWhtCV96MA8GA1UdEwEB/wQF
MAMBAf8wLwYDVR0RBCgwJoIRYWx0LnN0YW1wZWRlLnRlc3SCEXd3dy5zdGFtcGVk
ZS50ZXN0MA0GCSqGSIb3DQEBCwUAA4IBAQAffSftCOsP31OUz7L+fL2VtvPizYtq
nIu+/zSwcOvezqG87BprUU5v4JZQG8z87//7CBBQzpJZaYPn7/YlLo33jBQoPr65
AvsMEga90EChCSGSo5PDXLtKSYXAbfzoGQJUcEkuY348WCgsJXYGuiDEoCJM4cWB
9ozsvQfxYCy4f0aJWYFtRhTTK5nv1LmAzOBWIXZrJEI5yo+AVXgSBD9NnhElLiq6
UTL/37/OFp3PlCmHobRd0yrSGegKWp2hLn6OHXWcR/zvLoXtRUhXt6w5SUMk7ivb
ibTi7VGz7I9crOy0wLxmkGIo/v4DuHZX4cL+V0e2pqM3G8jcwmz7h/sU
-----END CERTIFICATE-----
";

#[test]
fn x509_parsing1() {
  let script = r#"
    import x509 from "k6/crypto/x509";
    import { check } from "k6";
    const pem = open("./cert.pem");
    export default function () {
      var cert = x509.parse(pem);
      check(cert, {
        "subject": function (c) {
          return c.subject.commonName === "stampede.test" &&
            c.subject.organizationName === "Stampede" &&
            c.subject.organizationalUnitName === "Load" &&
            c.subject.country === "DE" &&
            c.subject.localityName === "Berlin";
        },
        "issuer": function (c) {
          // Self-signed: issuer mirrors the subject.
          return c.issuer.commonName === "stampede.test";
        },
        "algorithms": function (c) {
          return c.signatureAlgorithm === "SHA256-RSA" &&
            c.publicKey.algorithm === "RSA";
        },
        "shape": function (c) {
          return c.version === 3 &&
            c.serialNumber.length > 0 &&
            typeof c.notBefore === "string" && c.notBefore.length > 0 &&
            typeof c.notAfter === "string" && c.notAfter.length > 0 &&
            c.fingerPrint instanceof ArrayBuffer &&
            c.fingerPrint.byteLength === 20;
        },
      });
      check(x509.altNames(pem), {
        "altNames": function (names) {
          return names.length === 2 &&
            names.indexOf("alt.stampede.test") !== -1 &&
            names.indexOf("www.stampede.test") !== -1;
        },
      });
      check(x509.subject(pem), {
        "standalone subject": function (s) {
          return s.commonName === "stampede.test";
        },
      });
      check(null, {
        "garbage throws": function () {
          try { x509.parse("not a certificate"); return false; }
          catch (e) { return true; }
        },
      });
    }
  "#;
  let mut run = crate::test::make_run_with(
    script,
    &[("/scripts/cert.pem", TEST_CERT_PEM)],
    Options::default(),
    Transports::default(),
  )
  .unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  for check in run.runner.group_root.checks() {
    assert_eq!(
      (check.passes(), check.fails()),
      (1, 0),
      "check {} failed",
      check.name
    );
  }
}

#[test]
fn html_parsing1() {
  let script = r#"
    import { parseHTML } from "k6/html";
    import { check } from "k6";
    export default function () {
      var doc = parseHTML(
        "<html><body><ul><li class='a'>one</li><li>two</li></ul></body></html>"
      );
      var items = doc.find("li");
      check(items, {
        "size": function (s) { return s.size() === 2; },
        "text": function (s) { return s.first().text() === "one"; },
        "attr": function (s) { return s.first().attr("class") === "a"; },
        "map": function (s) {
          var texts = s.map(function (i, el) { return el.text(); });
          return texts.join(",") === "one,two";
        },
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);

  for check in run.runner.group_root.checks() {
    assert_eq!(
      (check.passes(), check.fails()),
      (1, 0),
      "check {} failed",
      check.name
    );
  }
}

#[test]
fn group_return_value1() {
  let script = r#"
    import { group, check } from "k6";
    export default function () {
      var v = group("g", function () { return 42; });
      var t = group("h", function () {});
      check(null, {
        "value": function () { return v === 42; },
        "undefined becomes true": function () { return t === true; },
      });
    }
  "#;
  let mut run = make_run(script).unwrap();
  let mut vu = run.runner.new_vu(1, 1).unwrap();
  let mut active = vu.activate(activation());
  active.run_once().unwrap();
  drop(active);
  for check in run.runner.group_root.checks() {
    assert_eq!((check.passes(), check.fails()), (1, 0), "{}", check.name);
  }
}
