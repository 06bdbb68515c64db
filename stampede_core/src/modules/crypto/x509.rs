//! The `k6/crypto/x509` module: stateless certificate parsing.

use crate::js::binding::{
  set_function_to, set_number_to, set_property_to, set_string_to,
  throw_error, throw_type_error,
};
use crate::modules::{array_buffer_from_bytes, bytes_from_value};

use sha1::{Digest, Sha1};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::x509::X509Name;

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "parse", parse);
  set_function_to(scope, exports, "altNames", alt_names);
  set_function_to(scope, exports, "issuer", issuer);
  set_function_to(scope, exports, "subject", subject);
  exports
}

fn decode_pem(
  scope: &mut v8::HandleScope,
  args: &v8::FunctionCallbackArguments,
) -> Option<Pem> {
  let Some(input) = bytes_from_value(scope, args.get(0)) else {
    throw_type_error(scope, "certificate must be a PEM string or binary data");
    return None;
  };
  match parse_x509_pem(&input) {
    Ok((_, pem)) => Some(pem),
    Err(e) => {
      throw_error(scope, &format!("failed to decode PEM: {e}"));
      None
    }
  }
}

/// Renders a few well-known algorithm OIDs the way users expect; anything
/// else stays dotted.
fn algorithm_name(oid: &str) -> String {
  match oid {
    "1.2.840.113549.1.1.1" => "RSA",
    "1.2.840.113549.1.1.5" => "SHA1-RSA",
    "1.2.840.113549.1.1.11" => "SHA256-RSA",
    "1.2.840.113549.1.1.12" => "SHA384-RSA",
    "1.2.840.113549.1.1.13" => "SHA512-RSA",
    "1.2.840.10045.2.1" => "ECDSA",
    "1.2.840.10045.4.3.2" => "ECDSA-SHA256",
    "1.2.840.10045.4.3.3" => "ECDSA-SHA384",
    "1.3.101.112" => "Ed25519",
    other => return other.to_string(),
  }
  .to_string()
}

fn name_to_js<'s>(
  scope: &mut v8::HandleScope<'s>,
  name: &X509Name,
) -> v8::Local<'s, v8::Object> {
  let object = v8::Object::new(scope);

  let attrs: [(&str, Vec<String>); 6] = [
    (
      "commonName",
      name
        .iter_common_name()
        .filter_map(|a| a.as_str().ok().map(str::to_string))
        .collect(),
    ),
    (
      "country",
      name
        .iter_country()
        .filter_map(|a| a.as_str().ok().map(str::to_string))
        .collect(),
    ),
    (
      "stateOrProvinceName",
      name
        .iter_state_or_province()
        .filter_map(|a| a.as_str().ok().map(str::to_string))
        .collect(),
    ),
    (
      "localityName",
      name
        .iter_locality()
        .filter_map(|a| a.as_str().ok().map(str::to_string))
        .collect(),
    ),
    (
      "organizationName",
      name
        .iter_organization()
        .filter_map(|a| a.as_str().ok().map(str::to_string))
        .collect(),
    ),
    (
      "organizationalUnitName",
      name
        .iter_organizational_unit()
        .filter_map(|a| a.as_str().ok().map(str::to_string))
        .collect(),
    ),
  ];
  for (key, values) in attrs {
    let value = values.into_iter().next().unwrap_or_default();
    set_string_to(scope, object, key, &value);
  }
  object
}

fn cert_alt_names(cert: &X509Certificate) -> Vec<String> {
  let mut names = vec![];
  if let Ok(Some(san)) = cert.subject_alternative_name() {
    for general in &san.value.general_names {
      match general {
        GeneralName::DNSName(name) => names.push(name.to_string()),
        GeneralName::RFC822Name(name) => names.push(name.to_string()),
        GeneralName::URI(uri) => names.push(uri.to_string()),
        GeneralName::IPAddress(bytes) => match bytes.len() {
          4 => names.push(
            bytes
              .iter()
              .map(|b| b.to_string())
              .collect::<Vec<_>>()
              .join("."),
          ),
          _ => names.push(hex::encode(bytes)),
        },
        _ => {}
      }
    }
  }
  names
}

fn alt_names_to_js<'s>(
  scope: &mut v8::HandleScope<'s>,
  cert: &X509Certificate,
) -> v8::Local<'s, v8::Array> {
  let names = cert_alt_names(cert);
  let array = v8::Array::new(scope, names.len() as i32);
  for (i, name) in names.iter().enumerate() {
    let value = v8::String::new(scope, name).unwrap();
    array.set_index(scope, i as u32, value.into());
  }
  array
}

/// `parse(pem)`: the certificate's subject, issuer, validity, altNames,
/// algorithms, serial and SHA-1 fingerprint.
fn parse(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Some(pem) = decode_pem(scope, &args) else { return };
  let cert = match pem.parse_x509() {
    Ok(cert) => cert,
    Err(e) => {
      throw_error(scope, &format!("failed to parse certificate: {e}"));
      return;
    }
  };

  let object = v8::Object::new(scope);

  // X.509 encodes v3 as 2; report the human version.
  set_number_to(scope, object, "version", (cert.version().0 + 1) as f64);
  set_string_to(
    scope,
    object,
    "serialNumber",
    &cert.tbs_certificate.raw_serial_as_string(),
  );
  set_string_to(
    scope,
    object,
    "signatureAlgorithm",
    &algorithm_name(&cert.signature_algorithm.algorithm.to_id_string()),
  );

  let subject = name_to_js(scope, cert.subject());
  set_property_to(scope, object, "subject", subject.into());
  let issuer = name_to_js(scope, cert.issuer());
  set_property_to(scope, object, "issuer", issuer.into());

  let validity = cert.validity();
  set_string_to(scope, object, "notBefore", &validity.not_before.to_string());
  set_string_to(scope, object, "notAfter", &validity.not_after.to_string());

  let alt_names = alt_names_to_js(scope, &cert);
  set_property_to(scope, object, "altNames", alt_names.into());

  let public_key = v8::Object::new(scope);
  set_string_to(
    scope,
    public_key,
    "algorithm",
    &algorithm_name(&cert.public_key().algorithm.algorithm.to_id_string()),
  );
  set_property_to(scope, object, "publicKey", public_key.into());

  let fingerprint = Sha1::digest(&pem.contents).to_vec();
  let fingerprint = array_buffer_from_bytes(scope, fingerprint);
  set_property_to(scope, object, "fingerPrint", fingerprint.into());

  rv.set(object.into());
}

/// `altNames(pem)`
fn alt_names(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Some(pem) = decode_pem(scope, &args) else { return };
  match pem.parse_x509() {
    Ok(cert) => {
      let names = alt_names_to_js(scope, &cert);
      rv.set(names.into());
    }
    Err(e) => throw_error(scope, &format!("failed to parse certificate: {e}")),
  }
}

/// `issuer(pem)`
fn issuer(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Some(pem) = decode_pem(scope, &args) else { return };
  match pem.parse_x509() {
    Ok(cert) => {
      let name = name_to_js(scope, cert.issuer());
      rv.set(name.into());
    }
    Err(e) => throw_error(scope, &format!("failed to parse certificate: {e}")),
  }
}

/// `subject(pem)`
fn subject(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Some(pem) = decode_pem(scope, &args) else { return };
  match pem.parse_x509() {
    Ok(cert) => {
      let name = name_to_js(scope, cert.subject());
      rv.set(name.into());
    }
    Err(e) => throw_error(scope, &format!("failed to parse certificate: {e}")),
  }
}
