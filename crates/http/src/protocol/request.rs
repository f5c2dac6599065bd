//! The request assembled by [`HttpContext`](crate::codec::HttpContext).

use bytes::BytesMut;
use http::header::{self, AsHeaderName};
use http::{HeaderMap, Method, Version};

use crate::protocol::query::parse_query;
use crate::protocol::range::ByteRange;

/// A fully parsed HTTP/1.x request.
///
/// The body is buffered in memory. Header names are case-insensitive.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    version: Version,
    path: String,
    query: String,
    query_params: Vec<(String, String)>,
    path_params: Vec<(String, String)>,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: Method::GET,
            version: Version::HTTP_11,
            path: String::new(),
            query: String::new(),
            query_params: Vec::new(),
            path_params: Vec::new(),
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }
}

impl HttpRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The request target up to the first `?`, not percent-decoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string after the first `?`, empty when there is none.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of the header, if it is present and visible ASCII.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decoded query pairs in request order, repeated keys included.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// The first value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query_params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Every value of a query parameter, in request order.
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query_params.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    pub fn path_param(&self, key: &str) -> Option<&str> {
        self.path_params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn path_params(&self) -> &[(String, String)] {
        &self.path_params
    }

    pub fn set_path_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.path_params.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.path_params.push((key, value)),
        }
    }

    /// Matches the path against a pattern such as `/users/:id/files`.
    ///
    /// Segments starting with `:` capture the segment at the same position. Returns false,
    /// leaving the params untouched, when the segment count or a literal segment differs.
    pub fn extract_path_params(&mut self, pattern: &str) -> bool {
        let path_segments: Vec<&str> = self.path.split('/').filter(|s| !s.is_empty()).collect();
        let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        if path_segments.len() != pattern_segments.len() {
            return false;
        }

        let mut captured = Vec::new();
        for (expected, actual) in pattern_segments.iter().zip(&path_segments) {
            match expected.strip_prefix(':') {
                Some(name) => captured.push((name.to_string(), (*actual).to_string())),
                None if expected == actual => {}
                None => return false,
            }
        }

        for (key, value) in captured {
            self.set_path_param(key, value);
        }
        true
    }

    /// The requested byte range. Absent or malformed `Range` headers both give `None`.
    pub fn range(&self) -> Option<ByteRange> {
        self.header(header::RANGE).and_then(ByteRange::parse)
    }

    /// HTTP/1.1 stays open unless `Connection: close`, HTTP/1.0 closes unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header(header::CONNECTION);
        let has_token = |token: &str| connection.is_some_and(|value| value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)));

        match self.version {
            Version::HTTP_10 => has_token("keep-alive"),
            _ => !has_token("close"),
        }
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_target(&mut self, target: &str) {
        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = query.to_string();
                self.query_params = parse_query(query);
            }
            None => {
                self.path = target.to_string();
                self.query.clear();
                self.query_params.clear();
            }
        }
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request(version: Version, connection: Option<&'static str>) -> HttpRequest {
        let mut request = HttpRequest::default();
        request.set_version(version);
        if let Some(value) = connection {
            request.headers_mut().insert(header::CONNECTION, HeaderValue::from_static(value));
        }
        request
    }

    #[test]
    fn keep_alive_rules() {
        assert!(request(Version::HTTP_11, None).keep_alive());
        assert!(!request(Version::HTTP_11, Some("close")).keep_alive());
        assert!(!request(Version::HTTP_11, Some("Close")).keep_alive());
        assert!(!request(Version::HTTP_10, None).keep_alive());
        assert!(request(Version::HTTP_10, Some("Keep-Alive")).keep_alive());
        assert!(request(Version::HTTP_10, Some("keep-alive, upgrade")).keep_alive());
    }

    #[test]
    fn target_split() {
        let mut request = HttpRequest::default();
        request.set_target("/search?q=rust+lang&page=2&q=epoll");
        assert_eq!(request.path(), "/search");
        assert_eq!(request.query(), "q=rust+lang&page=2&q=epoll");
        assert_eq!(request.query_value("q"), Some("rust lang"));
        assert_eq!(request.query_values("q"), vec!["rust lang", "epoll"]);
        assert_eq!(request.query_value("missing"), None);

        request.set_target("/plain");
        assert_eq!(request.query(), "");
        assert!(request.query_params().is_empty());
    }

    #[test]
    fn path_params() {
        let mut request = HttpRequest::default();
        request.set_target("/users/42/files/report.txt");

        assert!(!request.extract_path_params("/users/:id"));
        assert!(!request.extract_path_params("/groups/:id/files/:name"));
        assert!(request.path_params().is_empty());

        assert!(request.extract_path_params("/users/:id/files/:name"));
        assert_eq!(request.path_param("id"), Some("42"));
        assert_eq!(request.path_param("name"), Some("report.txt"));

        request.set_path_param("id", "7");
        assert_eq!(request.path_param("id"), Some("7"));
        assert_eq!(request.path_params().len(), 2);
    }

    #[test]
    fn range_header() {
        let mut request = HttpRequest::default();
        assert_eq!(request.range(), None);

        request.headers_mut().insert(header::RANGE, HeaderValue::from_static("bytes=10-19"));
        assert_eq!(request.range(), Some(ByteRange::FromTo(10, 19)));

        request.headers_mut().insert(header::RANGE, HeaderValue::from_static("lines=1-2"));
        assert_eq!(request.range(), None);
    }
}
