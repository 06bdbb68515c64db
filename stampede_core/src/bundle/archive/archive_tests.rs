use super::*;
use serde_json::json;

fn sample_archive() -> Archive {
  let mut files = HashMap::new();
  files.insert(
    "file:///scripts/lib.js".to_string(),
    b"module.exports.greeting = \"hi!\";".to_vec(),
  );
  files.insert(
    "https://example.com/remote.js".to_string(),
    b"module.exports.remote = true;".to_vec(),
  );
  files.insert(
    "file:///scripts/data.txt".to_string(),
    b"payload".to_vec(),
  );

  Archive {
    meta: ArchiveMeta {
      archive_type: ARCHIVE_TYPE.to_string(),
      filename: "file:///scripts/main.js".to_string(),
      pwd: "file:///scripts/".to_string(),
      options: Options::from_json(json!({"vus": 3})).unwrap(),
      env: BTreeMap::from([("STAGE".to_string(), "dev".to_string())]),
      compatibility_mode: CompatMode::Extended,
      tool_version: "0.1.0".to_string(),
      os: "linux".to_string(),
    },
    data: b"var lib = require(\"./lib.js\");".to_vec(),
    files,
  }
}

#[test]
fn tar_paths1() {
  let file = Url::parse("file:///a/b.js").unwrap();
  assert_eq!(tar_path(&file), "files/file/a/b.js");
  assert_eq!(
    url_from_tar_path("files/file/a/b.js").unwrap().as_str(),
    "file:///a/b.js"
  );

  let https = Url::parse("https://example.com/lib/a.js").unwrap();
  assert_eq!(tar_path(&https), "files/https/example.com/lib/a.js");
  assert_eq!(
    url_from_tar_path("files/https/example.com/lib/a.js")
      .unwrap()
      .as_str(),
    "https://example.com/lib/a.js"
  );

  assert!(url_from_tar_path("something/else").is_none());
}

#[test]
fn round_trip1() {
  let archive = sample_archive();
  let mut buffer = vec![];
  archive.write(&mut buffer).unwrap();

  let read = Archive::read(buffer.as_slice()).unwrap();
  assert_eq!(read.meta.filename, archive.meta.filename);
  assert_eq!(read.meta.env, archive.meta.env);
  assert_eq!(read.meta.compatibility_mode, CompatMode::Extended);
  assert_eq!(read.meta.options.vus, Some(3));
  assert_eq!(read.data, archive.data);
  assert_eq!(read.files.len(), 3);
  assert_eq!(
    read.files["file:///scripts/lib.js"],
    archive.files["file:///scripts/lib.js"]
  );
  assert_eq!(
    read.files["https://example.com/remote.js"],
    archive.files["https://example.com/remote.js"]
  );
}

#[test]
fn missing_metadata1() {
  let mut buffer = vec![];
  {
    let mut builder = tar::Builder::new(&mut buffer);
    append(&mut builder, "data", b"x").unwrap();
    builder.finish().unwrap();
  }
  assert!(Archive::read(buffer.as_slice()).is_err());
}

#[test]
fn wrong_type1() {
  let mut archive = sample_archive();
  archive.meta.archive_type = "lua".to_string();
  let mut buffer = vec![];
  archive.write(&mut buffer).unwrap();
  assert!(Archive::read(buffer.as_slice()).is_err());
}
