//! Module specifier resolution and byte loading.
//!
//! A specifier is one of: a reserved builtin name (`k6`, `k6/...`), an
//! absolute OS path, a URL with an explicit scheme, or a path relative to
//! the *requiring* module. Resolution always produces a canonical URL, and
//! loading goes through the scheme's [`crate::fs::Filesystem`] layer.

use crate::fs::{FsMap, normalize_path};
use crate::prelude::*;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

#[cfg(test)]
mod loader_tests;

/// The reserved builtin module prefix. User files can never shadow it.
pub const BUILTIN_PREFIX: &str = "k6";

/// The synthetic scheme builtin specifiers canonicalise into.
pub const BUILTIN_SCHEME: &str = "builtin";

/// Matches `C:\...` and `C:/...` Windows drive-letter paths.
static WINDOWS_DRIVE_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[a-zA-Z]:[/\\]").unwrap());

/// Whether the specifier names a builtin module.
pub fn is_builtin(specifier: &str) -> bool {
  specifier == BUILTIN_PREFIX
    || specifier.starts_with(&format!("{BUILTIN_PREFIX}/"))
}

/// Resolves `specifier` against the canonical URL of the requiring module
/// (`pwd`). See the module docs for the precedence rules.
pub fn resolve(pwd: &Url, specifier: &str) -> Result<Url, ResolveError> {
  if specifier.is_empty() {
    return Err(ResolveError::InvalidSpecifier {
      specifier: specifier.to_string(),
      reason: "empty specifier".to_string(),
    });
  }

  // 1. Reserved builtin names canonicalise into the builtin scheme.
  if is_builtin(specifier) {
    let url = format!("{BUILTIN_SCHEME}://{specifier}");
    return Url::parse(&url).map_err(|e| ResolveError::InvalidSpecifier {
      specifier: specifier.to_string(),
      reason: e.to_string(),
    });
  }

  // 2. OS-absolute paths, including the Windows drive-letter form.
  if specifier.starts_with('/') || WINDOWS_DRIVE_REGEX.is_match(specifier) {
    let path = normalize_path(specifier);
    let url = format!("file://{path}");
    return Url::parse(&url).map_err(|e| ResolveError::InvalidSpecifier {
      specifier: specifier.to_string(),
      reason: e.to_string(),
    });
  }

  // 3. Scheme-qualified URLs pass through canonicalisation directly. A
  // single letter before `:` is a drive, not a scheme, and was handled
  // above.
  if let Ok(url) = Url::parse(specifier) {
    if url.scheme().len() > 1 {
      return Ok(url);
    }
  }

  // 4. Everything else joins against the requiring module's URL.
  if escapes_root(pwd, specifier) {
    return Err(ResolveError::InvalidSpecifier {
      specifier: specifier.to_string(),
      reason: "path escapes the virtual root".to_string(),
    });
  }
  let specifier = specifier.replace('\\', "/");
  pwd
    .join(&specifier)
    .map_err(|e| ResolveError::InvalidSpecifier {
      specifier,
      reason: e.to_string(),
    })
}

/// Whether a relative specifier's leading `..` segments climb above the
/// virtual root of `pwd`. URL joining silently clamps at the root, so this
/// has to be detected up front.
fn escapes_root(pwd: &Url, specifier: &str) -> bool {
  let mut depth = pwd
    .path()
    .split('/')
    .filter(|s| !s.is_empty())
    .count()
    .saturating_sub(1); // The last segment is the module file itself.

  for seg in specifier.replace('\\', "/").split('/') {
    match seg {
      "" | "." => {}
      ".." => {
        if depth == 0 {
          return true;
        }
        depth -= 1;
      }
      _ => break,
    }
  }
  false
}

/// The path key a URL maps to inside its scheme's filesystem layer. `file`
/// URLs use the URL path directly; remote schemes prefix the host so that
/// `https://a.io/lib.js` and `https://b.io/lib.js` never collide.
pub fn fs_key(url: &Url) -> String {
  match url.scheme() {
    "file" => url.path().to_string(),
    _ => match url.host_str() {
      Some(host) => format!("/{}{}", host, url.path()),
      None => url.path().to_string(),
    },
  }
}

/// Loads the bytes behind a canonical URL through the layered filesystems.
pub fn load(fs: &FsMap, url: &Url) -> AnyResult<Vec<u8>> {
  let layer = fs
    .layer(url.scheme())
    .ok_or_else(|| ResolveError::UnhandledScheme(url.scheme().to_string()))?;
  let key = fs_key(url);
  trace!("load url:{}, key:{:?}", url, key);
  Ok(layer.read_file(&key)?)
}

/// Resolves a main-script argument given on the command line: either an
/// absolute/relative OS path or a full URL.
pub fn resolve_main(cwd: &std::path::Path, arg: &str) -> Result<Url, ResolveError> {
  if let Ok(url) = Url::parse(arg) {
    if url.scheme().len() > 1 {
      return Ok(url);
    }
  }
  let joined = if arg.starts_with('/') || WINDOWS_DRIVE_REGEX.is_match(arg) {
    normalize_path(arg)
  } else {
    normalize_path(&format!("{}/{}", cwd.display(), arg))
  };
  Url::parse(&format!("file://{joined}")).map_err(|e| {
    ResolveError::InvalidSpecifier {
      specifier: arg.to_string(),
      reason: e.to_string(),
    }
  })
}
