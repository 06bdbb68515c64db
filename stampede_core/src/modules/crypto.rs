//! The `k6/crypto` module: stateless digests, HMACs and random bytes.

use crate::js::binding::{
  get_internal_ref, set_function_to, set_internal_ref, throw_error,
  throw_type_error,
};
use crate::modules::{array_buffer_from_bytes, bytes_from_value};
use crate::prelude::*;

use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

pub mod x509;

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "md5", digest_md5);
  set_function_to(scope, exports, "sha1", digest_sha1);
  set_function_to(scope, exports, "sha256", digest_sha256);
  set_function_to(scope, exports, "sha512", digest_sha512);
  set_function_to(scope, exports, "hmac", hmac);
  set_function_to(scope, exports, "randomBytes", random_bytes);
  set_function_to(scope, exports, "createHash", create_hash);
  set_function_to(scope, exports, "createHMAC", create_hmac);
  exports
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
  Md5,
  Sha1,
  Sha256,
  Sha512,
}

impl Algorithm {
  fn parse(name: &str) -> Option<Algorithm> {
    match name {
      "md5" => Some(Algorithm::Md5),
      "sha1" => Some(Algorithm::Sha1),
      "sha256" => Some(Algorithm::Sha256),
      "sha512" => Some(Algorithm::Sha512),
      _ => None,
    }
  }
}

/// An incremental hasher or HMAC, the backing state of `createHash` and
/// `createHMAC` objects.
enum Hasher {
  Md5(Md5),
  Sha1(Sha1),
  Sha256(Sha256),
  Sha512(Sha512),
  HmacMd5(Hmac<Md5>),
  HmacSha1(Hmac<Sha1>),
  HmacSha256(Hmac<Sha256>),
  HmacSha512(Hmac<Sha512>),
}

impl Hasher {
  fn new(algorithm: Algorithm) -> Hasher {
    match algorithm {
      Algorithm::Md5 => Hasher::Md5(Md5::new()),
      Algorithm::Sha1 => Hasher::Sha1(Sha1::new()),
      Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
      Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
    }
  }

  fn new_hmac(algorithm: Algorithm, secret: &[u8]) -> Hasher {
    match algorithm {
      Algorithm::Md5 => {
        Hasher::HmacMd5(Hmac::<Md5>::new_from_slice(secret).unwrap())
      }
      Algorithm::Sha1 => {
        Hasher::HmacSha1(Hmac::<Sha1>::new_from_slice(secret).unwrap())
      }
      Algorithm::Sha256 => {
        Hasher::HmacSha256(Hmac::<Sha256>::new_from_slice(secret).unwrap())
      }
      Algorithm::Sha512 => {
        Hasher::HmacSha512(Hmac::<Sha512>::new_from_slice(secret).unwrap())
      }
    }
  }

  fn update(&mut self, data: &[u8]) {
    match self {
      Hasher::Md5(h) => h.update(data),
      Hasher::Sha1(h) => h.update(data),
      Hasher::Sha256(h) => h.update(data),
      Hasher::Sha512(h) => h.update(data),
      Hasher::HmacMd5(h) => h.update(data),
      Hasher::HmacSha1(h) => h.update(data),
      Hasher::HmacSha256(h) => h.update(data),
      Hasher::HmacSha512(h) => h.update(data),
    }
  }

  fn digest(&self) -> Vec<u8> {
    match self.clone_state() {
      Hasher::Md5(h) => h.finalize().to_vec(),
      Hasher::Sha1(h) => h.finalize().to_vec(),
      Hasher::Sha256(h) => h.finalize().to_vec(),
      Hasher::Sha512(h) => h.finalize().to_vec(),
      Hasher::HmacMd5(h) => h.finalize().into_bytes().to_vec(),
      Hasher::HmacSha1(h) => h.finalize().into_bytes().to_vec(),
      Hasher::HmacSha256(h) => h.finalize().into_bytes().to_vec(),
      Hasher::HmacSha512(h) => h.finalize().into_bytes().to_vec(),
    }
  }

  // `digest()` may be called repeatedly on the same hasher.
  fn clone_state(&self) -> Hasher {
    match self {
      Hasher::Md5(h) => Hasher::Md5(h.clone()),
      Hasher::Sha1(h) => Hasher::Sha1(h.clone()),
      Hasher::Sha256(h) => Hasher::Sha256(h.clone()),
      Hasher::Sha512(h) => Hasher::Sha512(h.clone()),
      Hasher::HmacMd5(h) => Hasher::HmacMd5(h.clone()),
      Hasher::HmacSha1(h) => Hasher::HmacSha1(h.clone()),
      Hasher::HmacSha256(h) => Hasher::HmacSha256(h.clone()),
      Hasher::HmacSha512(h) => Hasher::HmacSha512(h.clone()),
    }
  }
}

/// Renders a digest in the requested output encoding. `binary` returns an
/// ArrayBuffer, everything else a string.
fn encode_digest<'s>(
  scope: &mut v8::HandleScope<'s>,
  digest: Vec<u8>,
  encoding: &str,
) -> Option<v8::Local<'s, v8::Value>> {
  let rendered = match encoding {
    "hex" | "" => hex::encode(&digest),
    "base64" => base64::engine::general_purpose::STANDARD.encode(&digest),
    "base64url" => {
      base64::engine::general_purpose::URL_SAFE.encode(&digest)
    }
    "base64rawurl" => {
      base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest)
    }
    "binary" => return Some(array_buffer_from_bytes(scope, digest).into()),
    _ => return None,
  };
  Some(v8::String::new(scope, &rendered).unwrap().into())
}

fn output_encoding(
  scope: &mut v8::HandleScope,
  args: &v8::FunctionCallbackArguments,
  index: i32,
) -> String {
  if args.length() > index && args.get(index).is_string() {
    args.get(index).to_rust_string_lossy(scope)
  } else {
    "hex".to_string()
  }
}

fn digest_with(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
  algorithm: Algorithm,
) {
  let Some(input) = bytes_from_value(scope, args.get(0)) else {
    throw_type_error(scope, "input must be a string or binary data");
    return;
  };
  let encoding = output_encoding(scope, &args, 1);

  let mut hasher = Hasher::new(algorithm);
  hasher.update(&input);
  match encode_digest(scope, hasher.digest(), &encoding) {
    Some(value) => rv.set(value),
    None => throw_type_error(
      scope,
      &format!("invalid output encoding {encoding:?}"),
    ),
  }
}

fn digest_md5(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  rv: v8::ReturnValue,
) {
  digest_with(scope, args, rv, Algorithm::Md5);
}

fn digest_sha1(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  rv: v8::ReturnValue,
) {
  digest_with(scope, args, rv, Algorithm::Sha1);
}

fn digest_sha256(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  rv: v8::ReturnValue,
) {
  digest_with(scope, args, rv, Algorithm::Sha256);
}

fn digest_sha512(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  rv: v8::ReturnValue,
) {
  digest_with(scope, args, rv, Algorithm::Sha512);
}

/// `hmac(algorithm, secret, data, outputEncoding?)`
fn hmac(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let algorithm = args.get(0).to_rust_string_lossy(scope);
  let Some(algorithm) = Algorithm::parse(&algorithm) else {
    throw_type_error(scope, &format!("invalid algorithm {algorithm:?}"));
    return;
  };
  let Some(secret) = bytes_from_value(scope, args.get(1)) else {
    throw_type_error(scope, "secret must be a string or binary data");
    return;
  };
  let Some(data) = bytes_from_value(scope, args.get(2)) else {
    throw_type_error(scope, "data must be a string or binary data");
    return;
  };
  let encoding = output_encoding(scope, &args, 3);

  let mut hasher = Hasher::new_hmac(algorithm, &secret);
  hasher.update(&data);
  match encode_digest(scope, hasher.digest(), &encoding) {
    Some(value) => rv.set(value),
    None => throw_type_error(
      scope,
      &format!("invalid output encoding {encoding:?}"),
    ),
  }
}

/// `randomBytes(n)` returns an ArrayBuffer of `n` random bytes.
fn random_bytes(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let n = args.get(0).integer_value(scope).unwrap_or(0);
  if n <= 0 {
    throw_type_error(scope, "randomBytes() requires a positive size");
    return;
  }
  let mut bytes = vec![0u8; n as usize];
  rand::thread_rng().fill_bytes(&mut bytes);
  rv.set(array_buffer_from_bytes(scope, bytes).into());
}

/// `createHash(algorithm)` returns an incremental hasher object.
fn create_hash(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let algorithm = args.get(0).to_rust_string_lossy(scope);
  let Some(algorithm) = Algorithm::parse(&algorithm) else {
    throw_type_error(scope, &format!("invalid algorithm {algorithm:?}"));
    return;
  };
  rv.set(new_hasher_object(scope, Hasher::new(algorithm)).into());
}

/// `createHMAC(algorithm, secret)` returns an incremental HMAC object.
fn create_hmac(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let algorithm = args.get(0).to_rust_string_lossy(scope);
  let Some(algorithm) = Algorithm::parse(&algorithm) else {
    throw_type_error(scope, &format!("invalid algorithm {algorithm:?}"));
    return;
  };
  let Some(secret) = bytes_from_value(scope, args.get(1)) else {
    throw_type_error(scope, "secret must be a string or binary data");
    return;
  };
  rv.set(new_hasher_object(scope, Hasher::new_hmac(algorithm, &secret)).into());
}

fn new_hasher_object<'s>(
  scope: &mut v8::HandleScope<'s>,
  hasher: Hasher,
) -> v8::Local<'s, v8::Object> {
  let template = v8::ObjectTemplate::new(scope);
  template.set_internal_field_count(1);
  let object = template.new_instance(scope).unwrap();
  set_internal_ref(scope, object, 0, hasher);
  set_function_to(scope, object, "update", hasher_update);
  set_function_to(scope, object, "digest", hasher_digest);
  object
}

fn hasher_update(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let this = args.this();
  let Some(data) = bytes_from_value(scope, args.get(0)) else {
    throw_type_error(scope, "input must be a string or binary data");
    return;
  };
  let hasher = get_internal_ref::<Hasher>(scope, this, 0);
  hasher.update(&data);
}

fn hasher_digest(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let this = args.this();
  let encoding = output_encoding(scope, &args, 0);
  let digest = get_internal_ref::<Hasher>(scope, this, 0).digest();
  match encode_digest(scope, digest, &encoding) {
    Some(value) => rv.set(value),
    None => throw_error(scope, &format!("invalid output encoding {encoding:?}")),
  }
}
