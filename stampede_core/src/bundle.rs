//! The immutable compiled bundle.
//!
//! `Bundle::new` compiles the main file and runs it once in a throwaway
//! runtime, purely to collect `exports`, parse `options` and record every
//! file the init phase touched. VUs are spawned from the collected caches
//! and never touch the filesystems for anything unseen.

use crate::bundle::archive::{Archive, ArchiveMeta, ARCHIVE_TYPE};
use crate::bundle::options::Options;
use crate::fs::FsMap;
use crate::js::compiler::CompatMode;
use crate::js::err::JsError;
use crate::js::module::{self, ProgramCache};
use crate::js::{JsRuntime, JsRuntimeOptions, JsRuntimeParams};
use crate::metrics::MetricRegistry;
use crate::modules::data::SharedArrayRegistry;
use crate::prelude::*;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use url::Url;

pub mod archive;
pub mod options;

#[cfg(test)]
mod bundle_tests;

/// Engine-level options snapshotted into the bundle: the environment, the
/// compatibility mode and whether source maps resolve stacks.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
  pub env: HashMap<String, String>,
  pub compat_mode: Option<CompatMode>,
  pub include_source_maps: bool,
}

/// The immutable compiled artifact a test run is spawned from.
#[derive(Debug)]
pub struct Bundle {
  pub main_url: Url,
  pub source: String,
  pub options: Arc<Options>,
  pub compat_mode: CompatMode,
  pub env: HashMap<String, String>,
  pub enable_source_maps: bool,
  /// Compiled programs keyed by canonical URL, in first-compile order.
  pub programs: Arc<ProgramCache>,
  /// Data files recorded by `open` during init.
  pub files: HashMap<String, Vec<u8>>,
  /// Names of the callable exports the engine may invoke.
  pub exports: Vec<String>,
  pub fs: Arc<FsMap>,
  pub shared_arrays: Arc<SharedArrayRegistry>,
  pub registry: Arc<MetricRegistry>,
}

impl Bundle {
  /// Compiles and init-executes `source`, validating the script contract.
  pub fn new(
    source: &[u8],
    main_url: Url,
    fs: Arc<FsMap>,
    runtime_options: RuntimeOptions,
    external_options: Options,
    registry: Arc<MetricRegistry>,
    tokio: tokio::runtime::Handle,
  ) -> AnyResult<Bundle> {
    let compat_mode = runtime_options.compat_mode.unwrap_or_default();
    let text = String::from_utf8_lossy(source).to_string();

    let programs = Arc::new(ProgramCache::new());
    let program = crate::js::compiler::compile(
      &main_url,
      &text,
      compat_mode,
      Some(&fs),
    )?;
    programs.insert(Arc::new(program));

    let shared_arrays = Arc::new(SharedArrayRegistry::new());
    let mut runtime = JsRuntime::new(JsRuntimeParams {
      options: JsRuntimeOptions {
        compat_mode,
        env: runtime_options.env.clone(),
        enable_source_maps: runtime_options.include_source_maps,
      },
      pwd: main_url.clone(),
      fs: fs.clone(),
      programs: programs.clone(),
      files: HashMap::new(),
      init_recording: true,
      registry: registry.clone(),
      shared_arrays: shared_arrays.clone(),
      tokio,
    });

    // Run the init phase.
    let captured: Rc<RefCell<Option<v8::Global<v8::Value>>>> =
      Rc::new(RefCell::new(None));
    let capture = captured.clone();
    let url = main_url.clone();
    let init_result = runtime.start(move |scope| {
      let exports = module::require_module(scope, &url)
        .map_err(|e| JsError::from_reason(e.to_string()))?;
      capture.replace(Some(v8::Global::new(scope, exports)));
      Ok(None)
    });
    if let Err(e) = init_result {
      runtime.wait_on_registered();
      anyhow::bail!("init context error: {e}");
    }
    let exports_global = captured
      .borrow_mut()
      .take()
      .ok_or_else(|| anyhow::anyhow!("init produced no exports"))?;

    // Validate the exports contract and pull out `options`.
    let (export_names, script_options) =
      validate_exports(&mut runtime, &exports_global)?;

    let options = script_options.merged_with(&external_options);
    let files = runtime.state.borrow().files.clone();
    drop(runtime);

    // From here on, spawning VUs must not race against disk changes.
    fs.gate_file_layer(true);

    Ok(Bundle {
      main_url,
      source: text,
      options: Arc::new(options),
      compat_mode,
      env: runtime_options.env,
      enable_source_maps: runtime_options.include_source_maps,
      programs,
      files,
      exports: export_names,
      fs,
      shared_arrays,
      registry,
    })
  }

  /// Construction parameters for a per-VU runtime.
  pub fn runtime_params(
    &self,
    tokio: tokio::runtime::Handle,
  ) -> JsRuntimeParams {
    JsRuntimeParams {
      options: JsRuntimeOptions {
        compat_mode: self.compat_mode,
        env: self.env.clone(),
        enable_source_maps: self.enable_source_maps,
      },
      pwd: self.main_url.clone(),
      fs: self.fs.clone(),
      programs: self.programs.clone(),
      files: self.files.clone(),
      init_recording: false,
      registry: self.registry.clone(),
      shared_arrays: self.shared_arrays.clone(),
      tokio,
    }
  }

  pub fn has_export(&self, name: &str) -> bool {
    self.exports.iter().any(|e| e == name)
  }

  /// The directory URL imports of the main file resolve against.
  fn pwd_url(&self) -> String {
    let mut pwd = self.main_url.clone();
    if let Ok(mut segments) = pwd.path_segments_mut() {
      segments.pop();
      segments.push("");
    }
    pwd.to_string()
  }

  /// Serialises the bundle: main source, the originals of every compiled
  /// program, the opened data files, env and compatibility mode.
  pub fn make_archive(&self) -> Archive {
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    for program in self.programs.ordered() {
      files.insert(program.url.clone(), program.original.clone().into_bytes());
    }
    for (url, data) in &self.files {
      files.insert(url.clone(), data.clone());
    }

    Archive {
      meta: ArchiveMeta {
        archive_type: ARCHIVE_TYPE.to_string(),
        filename: self.main_url.to_string(),
        pwd: self.pwd_url(),
        options: (*self.options).clone(),
        env: self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        compatibility_mode: self.compat_mode,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
      },
      data: self.source.clone().into_bytes(),
      files,
    }
  }

  /// Re-hydrates an archive into a functionally identical bundle: fresh
  /// in-memory filesystems, the recorded compatibility mode, and runtime
  /// overrides applied on top of the recorded env and options.
  pub fn from_archive(
    archive: Archive,
    runtime_overrides: RuntimeOptions,
    external_options: Options,
    registry: Arc<MetricRegistry>,
    tokio: tokio::runtime::Handle,
  ) -> AnyResult<Bundle> {
    let fs = FsMap::mem_defaults();
    for (url, data) in &archive.files {
      let parsed = Url::parse(url)?;
      let layer = fs.layer(parsed.scheme()).ok_or_else(|| {
        ResolveError::UnhandledScheme(parsed.scheme().to_string())
      })?;
      layer.write_file(&crate::loader::fs_key(&parsed), data)?;
    }

    let main_url = Url::parse(&archive.meta.filename)?;

    let mut env: HashMap<String, String> = archive
      .meta
      .env
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    for (k, v) in runtime_overrides.env.iter() {
      env.insert(k.clone(), v.clone());
    }

    let runtime_options = RuntimeOptions {
      env,
      compat_mode: runtime_overrides
        .compat_mode
        .or(Some(archive.meta.compatibility_mode)),
      include_source_maps: runtime_overrides.include_source_maps,
    };
    let external = archive.meta.options.merged_with(&external_options);

    Bundle::new(
      &archive.data,
      main_url,
      Arc::new(fs),
      runtime_options,
      external,
      registry,
      tokio,
    )
  }
}

/// Checks the exports contract: an object with at least one callable,
/// `setup`/`teardown` callable when present, `options` JSON-parseable.
fn validate_exports(
  runtime: &mut JsRuntime,
  exports: &v8::Global<v8::Value>,
) -> AnyResult<(Vec<String>, Options)> {
  let scope = &mut runtime.handle_scope();
  let exports = v8::Local::new(scope, exports);

  if !exports.is_object() || exports.is_function() {
    anyhow::bail!(ContractError::ExportsNotObject);
  }
  let exports = exports.to_object(scope).unwrap();

  let mut names: Vec<String> = vec![];
  let mut script_options = Options::default();

  let keys = exports
    .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
    .ok_or_else(|| ContractError::NoExportedFunctions)?;

  for i in 0..keys.length() {
    let Some(key) = keys.get_index(scope, i) else { continue };
    let name = key.to_rust_string_lossy(scope);
    let Some(value) = exports.get(scope, key) else { continue };

    match name.as_str() {
      "options" => {
        let rendered = v8::json::stringify(scope, value)
          .map(|s| s.to_rust_string_lossy(scope))
          .unwrap_or_else(|| "null".to_string());
        let parsed: serde_json::Value = serde_json::from_str(&rendered)
          .map_err(|e| ContractError::InvalidOption(e.to_string()))?;
        script_options = Options::from_json(parsed)?;
      }
      "setup" => {
        if !value.is_function() {
          anyhow::bail!(ContractError::SetupNotAFunction);
        }
        names.push(name);
      }
      "teardown" => {
        if !value.is_function() {
          anyhow::bail!(ContractError::TeardownNotAFunction);
        }
        names.push(name);
      }
      _ => {
        if value.is_function() {
          names.push(name);
        }
      }
    }
  }

  if !names.iter().any(|n| n != "setup" && n != "teardown") {
    anyhow::bail!(ContractError::NoExportedFunctions);
  }

  Ok((names, script_options))
}
