//! Shared test fixtures: in-memory bundles, a scripted HTTP transport and
//! sample-channel draining.

use crate::bundle::options::Options;
use crate::bundle::{Bundle, RuntimeOptions};
use crate::fs::{FsMap, MemFs};
use crate::metrics::{DeliveryMode, MetricRegistry, Sample, SampleSender};
use crate::modules::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::prelude::*;
use crate::runner::{Runner, Transports};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One tokio runtime for the whole test binary; VUs run on plain test
/// threads and only native timers land here.
static TOKIO: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(2)
    .enable_all()
    .build()
    .unwrap()
});

pub fn tokio_handle() -> tokio::runtime::Handle {
  TOKIO.handle().clone()
}

pub const MAIN_URL: &str = "file:///scripts/main.js";

/// A filesystem map holding the main script plus any sibling files.
pub fn mem_fs(script: &str, files: &[(&str, &str)]) -> Arc<FsMap> {
  let mut all: Vec<(String, Vec<u8>)> =
    vec![("/scripts/main.js".to_string(), script.as_bytes().to_vec())];
  for (path, content) in files {
    all.push((path.to_string(), content.as_bytes().to_vec()));
  }
  let map = FsMap::new();
  map.set_layer(
    "file",
    Arc::new(crate::fs::GatedFs::new(Arc::new(MemFs::with_files(all)))),
  );
  map.set_layer("https", Arc::new(MemFs::new()));
  Arc::new(map)
}

pub fn make_bundle(script: &str) -> AnyResult<Arc<Bundle>> {
  make_bundle_with(script, &[], RuntimeOptions::default(), Options::default())
}

pub fn make_bundle_with(
  script: &str,
  files: &[(&str, &str)],
  runtime_options: RuntimeOptions,
  external: Options,
) -> AnyResult<Arc<Bundle>> {
  crate::log::try_init();
  let fs = mem_fs(script, files);
  let bundle = Bundle::new(
    script.as_bytes(),
    url::Url::parse(MAIN_URL).unwrap(),
    fs,
    runtime_options,
    external,
    Arc::new(MetricRegistry::new()),
    tokio_handle(),
  )?;
  Ok(Arc::new(bundle))
}

/// A runner plus the read half of its sample channel.
pub struct TestRun {
  pub runner: Runner,
  pub rx: tokio::sync::mpsc::Receiver<Vec<Sample>>,
}

impl TestRun {
  /// Everything emitted so far, flattened.
  pub fn drain(&mut self) -> Vec<Sample> {
    let mut out = vec![];
    while let Ok(batch) = self.rx.try_recv() {
      out.extend(batch);
    }
    out
  }
}

pub fn make_run(script: &str) -> AnyResult<TestRun> {
  make_run_with(
    script,
    &[],
    Options::default(),
    Transports::default(),
  )
}

pub fn make_run_with(
  script: &str,
  files: &[(&str, &str)],
  external: Options,
  transports: Transports,
) -> AnyResult<TestRun> {
  let bundle =
    make_bundle_with(script, files, RuntimeOptions::default(), external)?;
  run_from_bundle(bundle, transports)
}

pub fn run_from_bundle(
  bundle: Arc<Bundle>,
  transports: Transports,
) -> AnyResult<TestRun> {
  let (out, rx) = SampleSender::channel(4096, DeliveryMode::Drop);
  let runner = Runner::new(bundle, out, transports, tokio_handle())?;
  Ok(TestRun { runner, rx })
}

/// A scripted HTTP transport: a handler function plus a request log.
pub struct MockTransport {
  handler: Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>,
  pub requests: Mutex<Vec<HttpRequest>>,
}

impl std::fmt::Debug for MockTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MockTransport")
      .field("requests", &self.requests.lock().len())
      .finish()
  }
}

impl MockTransport {
  pub fn new(
    handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
  ) -> Arc<Self> {
    Arc::new(Self {
      handler: Box::new(handler),
      requests: Mutex::new(vec![]),
    })
  }

  /// Always replies 200 with the given body.
  pub fn ok(body: &'static str) -> Arc<Self> {
    Self::new(move |_req| ok_response(body))
  }

  pub fn request_log(&self) -> Vec<HttpRequest> {
    self.requests.lock().clone()
  }
}

pub fn ok_response(body: &str) -> HttpResponse {
  HttpResponse {
    status: 200,
    status_text: "OK".to_string(),
    proto: "HTTP/1.1".to_string(),
    body: body.as_bytes().to_vec(),
    ..Default::default()
  }
}

impl HttpTransport for MockTransport {
  fn round_trip(
    &self,
    request: &HttpRequest,
    _cancel: &CancellationToken,
  ) -> AnyResult<HttpResponse> {
    self.requests.lock().push(request.clone());
    Ok((self.handler)(request))
  }
}

/// Samples for one metric name.
pub fn samples_for<'a>(samples: &'a [Sample], metric: &str) -> Vec<&'a Sample> {
  samples
    .iter()
    .filter(|s| s.metric.name == metric)
    .collect()
}
