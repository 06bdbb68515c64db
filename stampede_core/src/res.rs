//! Errors and results.

use std::time::Duration;

// anyhow {

/// [`anyhow::Error`]
pub type AnyError = anyhow::Error;

/// [`anyhow::Result`] with `T` if ok, [`AnyError`] if error.
pub type AnyResult<T> = anyhow::Result<T>;

// anyhow }

// std::io {

/// [`std::io::Result`] with `T` if ok.
pub type IoResult<T> = std::io::Result<T>;

// std::io }

// thiserror {

/// Errors produced while turning source bytes into an executable program.
/// All of them are fatal to the bundle that owns the offending file.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
  #[error("SyntaxError: {url}:{line}:{column}: {message}")]
  Syntax {
    url: String,
    line: u32,
    column: u32,
    message: String,
  },
  #[error("TranspileError: {url}: {message}")]
  Transpile { url: String, message: String },
}

/// Errors produced while resolving a module specifier to a canonical URL.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
  #[error("unknown builtin module {0:?}")]
  UnknownModule(String),
  #[error("module {0:?} not found")]
  ModuleNotFound(String),
  #[error("invalid module specifier {specifier:?}: {reason}")]
  InvalidSpecifier { specifier: String, reason: String },
  #[error("no filesystem handler declared for scheme {0:?}")]
  UnhandledScheme(String),
}

/// Errors produced by the layered virtual filesystems.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FsError {
  #[error("file {0:?} not found")]
  NotFound(String),
  #[error("{0:?} is a directory, not a file")]
  IsDirectory(String),
  #[error("file {0:?} was not opened during the init phase")]
  PathNeverOpenedDuringInit(String),
  #[error("i/o error on {path:?}: {message}")]
  Io { path: String, message: String },
}

/// Violations of the script contract, all fatal to the bundle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContractError {
  #[error("the script exports must be an object")]
  ExportsNotObject,
  #[error("the script must export at least one function")]
  NoExportedFunctions,
  #[error("the exported setup must be a function")]
  SetupNotAFunction,
  #[error("the exported teardown must be a function")]
  TeardownNotAFunction,
  #[error("{0}() is not allowed in the init context")]
  ForbiddenInInitContext(&'static str),
  #[error("open() is only allowed in the init context")]
  OpenOutsideInit,
  #[error("invalid metric name {0:?}")]
  InvalidMetricName(String),
  #[error("invalid option: {0}")]
  InvalidOption(String),
}

/// Errors surfaced by the iteration driver. [`RunnerError::Script`] and
/// [`RunnerError::UnhandledRejection`] are per-iteration; the rest abort the
/// whole run and carry a distinct exit code for the CLI.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
  #[error("{0}")]
  Script(crate::js::err::JsError),
  #[error("unhandled promise rejection: {0}")]
  UnhandledRejection(crate::js::err::JsError),
  #[error("setup timed out after {0:?}")]
  SetupTimeout(Duration),
  #[error("teardown timed out after {0:?}")]
  TeardownTimeout(Duration),
  #[error("operation timed out after {0:?}")]
  Timeout(Duration),
  #[error("iteration aborted: {0}")]
  Aborted(String),
}

impl RunnerError {
  /// The process exit code the embedding CLI maps this error to.
  pub fn exit_code(&self) -> i32 {
    match self {
      RunnerError::Script(_) | RunnerError::UnhandledRejection(_) => 107,
      RunnerError::SetupTimeout(_) => 100,
      RunnerError::TeardownTimeout(_) => 101,
      RunnerError::Timeout(_) => 102,
      RunnerError::Aborted(_) => 105,
    }
  }

  /// Whether the next iteration may proceed after this error.
  pub fn recoverable(&self) -> bool {
    matches!(
      self,
      RunnerError::Script(_) | RunnerError::UnhandledRejection(_)
    )
  }
}

// thiserror }
