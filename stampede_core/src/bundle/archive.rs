//! The archive format: a tar file reproducing a test byte-for-byte on any
//! host.
//!
//! Layout: `metadata.json`, `data` (the main source), and a `files/` tree
//! with every required or opened file at its canonical path under a
//! scheme-qualified root (`files/file/...`, `files/https/...`).

use crate::bundle::options::Options;
use crate::js::compiler::CompatMode;
use crate::loader;
use crate::prelude::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use url::Url;

#[cfg(test)]
mod archive_tests;

pub const ARCHIVE_TYPE: &str = "js";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
  #[serde(rename = "type")]
  pub archive_type: String,
  /// Canonical URL of the main script.
  pub filename: String,
  /// Canonical URL of the directory imports resolve against.
  pub pwd: String,
  pub options: Options,
  pub env: BTreeMap<String, String>,
  pub compatibility_mode: CompatMode,
  pub tool_version: String,
  pub os: String,
}

/// The deserialised form of a bundle: enough to rebuild it anywhere the
/// recorded compatibility mode is supported.
#[derive(Debug)]
pub struct Archive {
  pub meta: ArchiveMeta,
  /// Main source bytes.
  pub data: Vec<u8>,
  /// Every file required or opened during init, keyed by canonical URL.
  pub files: HashMap<String, Vec<u8>>,
}

/// The tar member path of a canonical URL.
fn tar_path(url: &Url) -> String {
  format!("files/{}{}", url.scheme(), loader::fs_key(url))
}

/// Reverses [`tar_path`]: `files/<scheme>/...` back to a canonical URL.
fn url_from_tar_path(path: &str) -> Option<Url> {
  let rest = path.strip_prefix("files/")?;
  let (scheme, key) = rest.split_once('/')?;
  let url = match scheme {
    "file" => format!("file:///{key}"),
    other => format!("{other}://{key}"),
  };
  Url::parse(&url).ok()
}

impl Archive {
  pub fn write<W: Write>(&self, writer: W) -> AnyResult<()> {
    let mut builder = tar::Builder::new(writer);

    let meta = serde_json::to_vec_pretty(&self.meta)?;
    append(&mut builder, "metadata.json", &meta)?;
    append(&mut builder, "data", &self.data)?;

    // Deterministic member order.
    let mut urls: Vec<&String> = self.files.keys().collect();
    urls.sort();
    for url in urls {
      let parsed = Url::parse(url)?;
      append(&mut builder, &tar_path(&parsed), &self.files[url])?;
    }

    builder.finish()?;
    Ok(())
  }

  pub fn read<R: Read>(reader: R) -> AnyResult<Archive> {
    let mut archive = tar::Archive::new(reader);
    let mut meta: Option<ArchiveMeta> = None;
    let mut data: Vec<u8> = vec![];
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();

    for entry in archive.entries()? {
      let mut entry = entry?;
      let path = entry.path()?.to_string_lossy().to_string();
      let mut contents = vec![];
      entry.read_to_end(&mut contents)?;

      match path.as_str() {
        "metadata.json" => meta = Some(serde_json::from_slice(&contents)?),
        "data" => data = contents,
        other => {
          if let Some(url) = url_from_tar_path(other) {
            files.insert(url.to_string(), contents);
          } else {
            warn!("ignoring unrecognised archive member {other:?}");
          }
        }
      }
    }

    let meta = meta
      .ok_or_else(|| anyhow::anyhow!("archive is missing metadata.json"))?;
    if meta.archive_type != ARCHIVE_TYPE {
      anyhow::bail!("unsupported archive type {:?}", meta.archive_type);
    }
    Ok(Archive { meta, data, files })
  }
}

fn append<W: Write>(
  builder: &mut tar::Builder<W>,
  path: &str,
  data: &[u8],
) -> AnyResult<()> {
  let mut header = tar::Header::new_gnu();
  header.set_size(data.len() as u64);
  header.set_mode(0o644);
  header.set_cksum();
  builder.append_data(&mut header, path, data)?;
  Ok(())
}
