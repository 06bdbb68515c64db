//! The stampede command line: a thin local executor around
//! `stampede_core`. Wire transports, outputs and threshold evaluation are
//! collaborator territory and stay out of this binary.

use stampede_core::bundle::archive::Archive;
use stampede_core::bundle::options::Options;
use stampede_core::bundle::{Bundle, RuntimeOptions};
use stampede_core::fs::FsMap;
use stampede_core::js::compiler::CompatMode;
use stampede_core::metrics::{
  DeliveryMode, MetricRegistry, MetricType, SampleSender,
};
use stampede_core::res::RunnerError;
use stampede_core::runner::{Runner, Transports, VuActivationParams};
use stampede_core::{loader, log};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "stampede", version, about = "A scriptable load generator")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Run a test script or archive.
  Run(RunArgs),
  /// Bundle a script and everything it needs into an archive.
  Archive(ArchiveArgs),
}

#[derive(Debug, clap::Args)]
struct CommonArgs {
  /// Script file or archive to load.
  target: PathBuf,

  /// Number of virtual users.
  #[arg(short = 'u', long)]
  vus: Option<u64>,

  /// Total number of iterations, shared across VUs.
  #[arg(short = 'i', long)]
  iterations: Option<u64>,

  /// Test duration, e.g. "30s" or "1m30s".
  #[arg(short = 'd', long)]
  duration: Option<String>,

  /// Compatibility mode: "base" or "extended".
  #[arg(long)]
  compat_mode: Option<CompatMode>,

  /// Environment variables exposed as __ENV, KEY=VALUE.
  #[arg(short = 'e', long = "env", value_parser = parse_env)]
  env: Vec<(String, String)>,

  /// Escalate builtin errors into thrown exceptions.
  #[arg(long)]
  throw: bool,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
  #[command(flatten)]
  common: CommonArgs,
}

#[derive(Debug, clap::Args)]
struct ArchiveArgs {
  #[command(flatten)]
  common: CommonArgs,

  /// Output file.
  #[arg(short = 'O', long, default_value = "archive.tar")]
  output: PathBuf,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None => Err(format!("invalid env var {raw:?}, expected KEY=VALUE")),
  }
}

fn external_options(args: &CommonArgs) -> anyhow::Result<Options> {
  let mut object = serde_json::Map::new();
  if let Some(vus) = args.vus {
    object.insert("vus".into(), vus.into());
  }
  if let Some(iterations) = args.iterations {
    object.insert("iterations".into(), iterations.into());
  }
  if let Some(duration) = &args.duration {
    object.insert("duration".into(), duration.clone().into());
  }
  if args.throw {
    object.insert("throw".into(), true.into());
  }
  Ok(Options::from_json(serde_json::Value::Object(object))?)
}

fn load_bundle(
  args: &CommonArgs,
  registry: Arc<MetricRegistry>,
  tokio: tokio::runtime::Handle,
) -> anyhow::Result<Arc<Bundle>> {
  let runtime_options = RuntimeOptions {
    env: args.env.iter().cloned().collect(),
    compat_mode: args.compat_mode,
    include_source_maps: true,
  };
  let external = external_options(args)?;

  let is_archive = args
    .target
    .extension()
    .map(|e| e == "tar")
    .unwrap_or(false);

  let bundle = if is_archive {
    let file = std::fs::File::open(&args.target)
      .with_context(|| format!("opening {:?}", args.target))?;
    let archive = Archive::read(file)?;
    Bundle::from_archive(archive, runtime_options, external, registry, tokio)?
  } else {
    let cwd = std::env::current_dir()?;
    let main_url =
      loader::resolve_main(&cwd, &args.target.display().to_string())?;
    let fs = Arc::new(FsMap::os_defaults());
    let source = loader::load(&fs, &main_url)
      .with_context(|| format!("reading {:?}", args.target))?;
    Bundle::new(
      &source,
      main_url,
      fs,
      runtime_options,
      external,
      registry,
      tokio,
    )?
  };
  Ok(Arc::new(bundle))
}

/// Aggregated view of one metric for the end-of-run summary.
#[derive(Debug, Default, Clone, Copy)]
struct Aggregate {
  count: u64,
  sum: f64,
  min: f64,
  max: f64,
}

impl Aggregate {
  fn add(&mut self, value: f64) {
    if self.count == 0 || value < self.min {
      self.min = value;
    }
    if self.count == 0 || value > self.max {
      self.max = value;
    }
    self.count += 1;
    self.sum += value;
  }
}

fn run(args: RunArgs) -> anyhow::Result<i32> {
  let rt = tokio::runtime::Runtime::new()?;
  let registry = Arc::new(MetricRegistry::new());
  let bundle = load_bundle(&args.common, registry, rt.handle().clone())?;

  let (out, mut rx) = SampleSender::channel(65536, DeliveryMode::Drop);
  let runner = Arc::new(Runner::new(
    bundle.clone(),
    out,
    Transports::default(),
    rt.handle().clone(),
  )?);

  // The aggregator drains every VU's samples into per-metric summaries.
  let aggregator = rt.spawn(async move {
    let mut aggregates: BTreeMap<String, (MetricType, Aggregate)> =
      BTreeMap::new();
    while let Some(batch) = rx.recv().await {
      for sample in batch {
        let entry = aggregates
          .entry(sample.metric.name.clone())
          .or_insert((sample.metric.metric_type, Aggregate::default()));
        entry.1.add(sample.value);
      }
    }
    aggregates
  });

  runner.run_setup().map_err(exit_with)?;

  let vus = bundle.options.vus.unwrap_or(1).max(1);
  let total_iterations = bundle.options.iterations;
  let duration = bundle.options.duration.map(|d| d.0);

  let token = CancellationToken::new();
  if let Some(duration) = duration {
    let token = token.clone();
    rt.spawn(async move {
      tokio::time::sleep(duration).await;
      token.cancel();
    });
  }

  let claimed = Arc::new(AtomicU64::new(0));
  let limit = total_iterations.unwrap_or(if duration.is_some() {
    u64::MAX
  } else {
    vus
  });
  let exit_code = Arc::new(AtomicI32::new(0));

  std::thread::scope(|scope| {
    for vu_id in 1..=vus {
      let runner = runner.clone();
      let bundle = bundle.clone();
      let token = token.clone();
      let claimed = claimed.clone();
      let exit_code = exit_code.clone();
      scope.spawn(move || {
        let mut vu = match runner.new_vu(vu_id, vu_id) {
          Ok(vu) => vu,
          Err(e) => {
            error!("spawning vu {vu_id} failed: {e}");
            exit_code.store(107, Ordering::Relaxed);
            token.cancel();
            return;
          }
        };
        let mut active = vu.activate(VuActivationParams {
          token: token.clone(),
          ..Default::default()
        });
        while !token.is_cancelled() {
          if claimed.fetch_add(1, Ordering::Relaxed) >= limit {
            break;
          }
          match active.run_once() {
            Ok(()) => {}
            Err(e) if e.recoverable() => {
              if bundle.options.throw_on_error() {
                exit_code.store(e.exit_code(), Ordering::Relaxed);
                token.cancel();
              }
            }
            Err(RunnerError::Aborted(_)) => break,
            Err(e) => {
              exit_code.store(e.exit_code(), Ordering::Relaxed);
              token.cancel();
            }
          }
        }
      });
    }
  });

  runner.run_teardown().map_err(exit_with)?;

  drop(runner);
  let aggregates = rt.block_on(aggregator)?;
  print_summary(&aggregates);

  Ok(exit_code.load(Ordering::Relaxed))
}

fn exit_with(e: RunnerError) -> anyhow::Error {
  error!("{e}");
  std::process::exit(e.exit_code());
}

fn print_summary(aggregates: &BTreeMap<String, (MetricType, Aggregate)>) {
  println!();
  for (name, (metric_type, agg)) in aggregates {
    match metric_type {
      MetricType::Counter => {
        println!("  {name:.<32} {}", agg.sum);
      }
      MetricType::Gauge => {
        println!("  {name:.<32} {}", agg.max);
      }
      MetricType::Rate => {
        let rate = if agg.count > 0 {
          agg.sum / agg.count as f64 * 100.0
        } else {
          0.0
        };
        println!("  {name:.<32} {rate:.2}%");
      }
      MetricType::Trend => {
        let avg = if agg.count > 0 { agg.sum / agg.count as f64 } else { 0.0 };
        println!(
          "  {name:.<32} avg={avg:.2}ms min={:.2}ms max={:.2}ms",
          agg.min, agg.max
        );
      }
    }
  }
}

fn archive(args: ArchiveArgs) -> anyhow::Result<i32> {
  let rt = tokio::runtime::Runtime::new()?;
  let registry = Arc::new(MetricRegistry::new());
  let bundle = load_bundle(&args.common, registry, rt.handle().clone())?;

  let file = std::fs::File::create(&args.output)
    .with_context(|| format!("creating {:?}", args.output))?;
  bundle.make_archive().write(file)?;
  println!("wrote {:?}", args.output);
  Ok(0)
}

fn main() {
  log::init();
  let cli = Cli::parse();
  let result = match cli.command {
    Command::Run(args) => run(args),
    Command::Archive(args) => archive(args),
  };
  match result {
    Ok(code) => std::process::exit(code),
    Err(e) => {
      error!("{e:#}");
      std::process::exit(1);
    }
  }
}
