//! Per-VU cookie jar.
//!
//! A deliberately small jar: session cookies with domain/path/secure
//! matching, enough for load scripts that bounce between endpoints of one
//! system under test. Expiry timestamps are not tracked; `Max-Age<=0`
//! deletes immediately.

use url::Url;

#[cfg(test)]
mod cookiejar_tests;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
  pub name: String,
  pub value: String,
  pub domain: String,
  pub path: String,
  pub secure: bool,
  pub http_only: bool,
  /// Set by an explicit `Domain` attribute; such cookies also match
  /// subdomains.
  pub host_only: bool,
}

#[derive(Debug, Default, Clone)]
pub struct CookieJar {
  cookies: Vec<Cookie>,
}

fn default_path(url: &Url) -> String {
  let path = url.path();
  match path.rfind('/') {
    Some(0) | None => "/".to_string(),
    Some(idx) => path[..idx].to_string(),
  }
}

fn domain_matches(cookie: &Cookie, host: &str) -> bool {
  if cookie.host_only {
    return cookie.domain == host;
  }
  host == cookie.domain || host.ends_with(&format!(".{}", cookie.domain))
}

fn path_matches(cookie: &Cookie, path: &str) -> bool {
  if cookie.path == "/" || cookie.path == path {
    return true;
  }
  path.starts_with(&cookie.path)
    && (cookie.path.ends_with('/')
      || path.as_bytes().get(cookie.path.len()) == Some(&b'/'))
}

impl CookieJar {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts or replaces a cookie for the URL's host.
  pub fn set(
    &mut self,
    url: &Url,
    name: &str,
    value: &str,
    domain: Option<&str>,
    path: Option<&str>,
    secure: bool,
  ) {
    let host = url.host_str().unwrap_or_default().to_string();
    let cookie = Cookie {
      name: name.to_string(),
      value: value.to_string(),
      host_only: domain.is_none(),
      domain: domain.map(|d| d.trim_start_matches('.').to_string()).unwrap_or(host),
      path: path.map(|p| p.to_string()).unwrap_or_else(|| default_path(url)),
      secure,
      http_only: false,
    };
    self.replace(cookie);
  }

  /// Stores a cookie parsed from one `Set-Cookie` header value.
  pub fn set_from_header(&mut self, url: &Url, header: &str) {
    let mut parts = header.split(';').map(str::trim);
    let Some(pair) = parts.next() else { return };
    let Some((name, value)) = pair.split_once('=') else { return };

    let mut cookie = Cookie {
      name: name.trim().to_string(),
      value: value.trim().to_string(),
      domain: url.host_str().unwrap_or_default().to_string(),
      path: default_path(url),
      host_only: true,
      ..Default::default()
    };
    let mut delete = false;

    for attr in parts {
      let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
      match key.to_ascii_lowercase().as_str() {
        "domain" if !val.is_empty() => {
          cookie.domain = val.trim_start_matches('.').to_string();
          cookie.host_only = false;
        }
        "path" if !val.is_empty() => cookie.path = val.to_string(),
        "secure" => cookie.secure = true,
        "httponly" => cookie.http_only = true,
        "max-age" => {
          if val.parse::<i64>().map(|age| age <= 0).unwrap_or(false) {
            delete = true;
          }
        }
        _ => {}
      }
    }

    if delete {
      self
        .cookies
        .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain));
    } else {
      self.replace(cookie);
    }
  }

  fn replace(&mut self, cookie: Cookie) {
    self.cookies.retain(|c| {
      !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
    });
    self.cookies.push(cookie);
  }

  /// The cookies that apply to a request for `url`.
  pub fn cookies_for(&self, url: &Url) -> Vec<&Cookie> {
    let host = url.host_str().unwrap_or_default();
    let path = url.path();
    let https = url.scheme() == "https";
    self
      .cookies
      .iter()
      .filter(|c| domain_matches(c, host))
      .filter(|c| path_matches(c, path))
      .filter(|c| !c.secure || https)
      .collect()
  }

  /// The `Cookie` request-header value for `url`, if any cookie applies.
  pub fn header_for(&self, url: &Url) -> Option<String> {
    let cookies = self.cookies_for(url);
    if cookies.is_empty() {
      return None;
    }
    Some(
      cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; "),
    )
  }

  pub fn delete(&mut self, url: &Url, name: &str) {
    let host = url.host_str().unwrap_or_default().to_string();
    self
      .cookies
      .retain(|c| !(c.name == name && domain_matches(c, &host)));
  }

  pub fn clear(&mut self, url: &Url) {
    let host = url.host_str().unwrap_or_default().to_string();
    self.cookies.retain(|c| !domain_matches(c, &host));
  }

  pub fn clear_all(&mut self) {
    self.cookies.clear();
  }

  pub fn len(&self) -> usize {
    self.cookies.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cookies.is_empty()
  }
}
