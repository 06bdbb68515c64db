use super::*;

fn url(s: &str) -> Url {
  Url::parse(s).unwrap()
}

#[test]
fn set_and_match1() {
  let mut jar = CookieJar::new();
  let u = url("http://example.com/app/login");
  jar.set(&u, "sid", "abc", None, Some("/"), false);

  assert_eq!(jar.header_for(&u).as_deref(), Some("sid=abc"));
  // Host-only cookies don't leak to other hosts.
  assert!(jar.header_for(&url("http://other.com/")).is_none());
  // Without a Domain attribute, subdomains don't match either.
  assert!(jar.header_for(&url("http://www.example.com/")).is_none());
}

#[test]
fn domain_attribute1() {
  let mut jar = CookieJar::new();
  let u = url("http://example.com/");
  jar.set(&u, "sid", "abc", Some("example.com"), Some("/"), false);
  assert!(jar.header_for(&url("http://www.example.com/")).is_some());
}

#[test]
fn set_from_header1() {
  let mut jar = CookieJar::new();
  let u = url("http://example.com/");
  jar.set_from_header(&u, "sid=abc; Path=/; HttpOnly");
  assert_eq!(jar.header_for(&u).as_deref(), Some("sid=abc"));

  // Replacement by name/domain/path.
  jar.set_from_header(&u, "sid=def; Path=/");
  assert_eq!(jar.header_for(&u).as_deref(), Some("sid=def"));
  assert_eq!(jar.len(), 1);

  // Max-Age=0 deletes.
  jar.set_from_header(&u, "sid=; Max-Age=0");
  assert!(jar.header_for(&u).is_none());
}

#[test]
fn secure_cookies1() {
  let mut jar = CookieJar::new();
  let https = url("https://example.com/");
  jar.set_from_header(&https, "sid=abc; Secure");
  assert!(jar.header_for(&https).is_some());
  assert!(jar.header_for(&url("http://example.com/")).is_none());
}

#[test]
fn path_matching1() {
  let mut jar = CookieJar::new();
  let u = url("http://example.com/app/x");
  jar.set_from_header(&u, "a=1; Path=/app");
  assert!(jar.header_for(&url("http://example.com/app/deep")).is_some());
  assert!(jar.header_for(&url("http://example.com/apple")).is_none());
  assert!(jar.header_for(&url("http://example.com/")).is_none());
}

#[test]
fn clear1() {
  let mut jar = CookieJar::new();
  let u = url("http://example.com/");
  jar.set_from_header(&u, "a=1");
  jar.set_from_header(&u, "b=2");
  jar.delete(&u, "a");
  assert_eq!(jar.header_for(&u).as_deref(), Some("b=2"));
  jar.clear(&u);
  assert!(jar.is_empty());
}
