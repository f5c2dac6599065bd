//! The response handed to request callbacks.

use std::fmt;
use std::fs::File;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use tracing::warn;

/// What follows the response head on the wire.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// `len` bytes of `file` starting at `offset`, sent with `sendfile(2)`.
    File { file: File, offset: u64, len: u64 },
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponseBody::File { offset, len, .. } => f.debug_struct("File").field("offset", offset).field("len", len).finish_non_exhaustive(),
        }
    }
}

impl ResponseBody {
    pub fn len(&self) -> u64 {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Bytes(bytes) => bytes.len() as u64,
            ResponseBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response under construction.
///
/// `Connection`, `Content-Length`, `Accept-Ranges` and `Content-Range` are written by the
/// encoder from the fields below; put everything else in [`headers_mut`](Self::headers_mut).
#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    reason: Option<String>,
    close_connection: bool,
    headers: HeaderMap,
    accept_ranges: bool,
    content_range: Option<String>,
    body: ResponseBody,
    head_only: bool,
}

impl HttpResponse {
    pub fn new(close_connection: bool) -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            close_connection,
            headers: HeaderMap::new(),
            accept_ranges: false,
            content_range: None,
            body: ResponseBody::Empty,
            head_only: false,
        }
    }

    /// A plain text response in one call.
    pub fn simple(close_connection: bool, status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(close_connection);
        response.set_status(status);
        response.set_content_type(&mime::TEXT_PLAIN_UTF_8);
        response.set_body(body);
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The reason phrase; the canonical one for the status unless overridden.
    pub fn status_message(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    /// Control characters other than tab are dropped, so the phrase always stays on the
    /// status line.
    pub fn set_status_message(&mut self, reason: impl Into<String>) {
        let mut reason = reason.into();
        if reason.chars().any(|c| c.is_control() && c != '\t') {
            warn!(reason = %reason.escape_debug(), "strip control characters from reason phrase");
            reason.retain(|c| !c.is_control() || c == '\t');
        }
        self.reason = Some(reason);
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_close_connection(&mut self, close_connection: bool) {
        self.close_connection = close_connection;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn set_content_type(&mut self, content_type: &mime::Mime) {
        match HeaderValue::from_str(content_type.as_ref()) {
            Ok(value) => {
                self.headers.insert(header::CONTENT_TYPE, value);
            }
            Err(_) => warn!(%content_type, "content type is not a valid header value"),
        }
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = ResponseBody::Bytes(body.into());
    }

    pub fn set_file(&mut self, file: File, offset: u64, len: u64) {
        self.body = ResponseBody::File { file, offset, len };
    }

    pub fn take_body(&mut self) -> ResponseBody {
        std::mem::replace(&mut self.body, ResponseBody::Empty)
    }

    /// Always the body size, also for `HEAD` where the body itself is not sent.
    pub fn content_length(&self) -> u64 {
        self.body.len()
    }

    pub fn accept_ranges(&self) -> bool {
        self.accept_ranges
    }

    pub fn enable_accept_ranges(&mut self) {
        self.accept_ranges = true;
    }

    pub fn content_range(&self) -> Option<&str> {
        self.content_range.as_deref()
    }

    pub fn set_content_range(&mut self, content_range: impl Into<String>) {
        self.content_range = Some(content_range.into());
    }

    /// Set for `HEAD` requests: the head is sent, the body is not.
    pub fn head_only(&self) -> bool {
        self.head_only
    }

    pub(crate) fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let response = HttpResponse::new(false);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.status_message(), "OK");
        assert!(!response.close_connection());
        assert!(response.body().is_empty());
        assert_eq!(response.content_length(), 0);
    }

    #[test]
    fn simple_and_custom_reason() {
        let mut response = HttpResponse::simple(true, StatusCode::NOT_FOUND, "404 Not Found\n");
        assert_eq!(response.status_message(), "Not Found");
        assert_eq!(response.content_length(), 14);
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain; charset=utf-8");

        response.set_status_message("Nope");
        assert_eq!(response.status_message(), "Nope");
    }

    #[test]
    fn reason_phrase_drops_control_characters() {
        let mut response = HttpResponse::new(false);
        response.set_status_message("OK\r\nSet-Cookie: admin=1");
        assert_eq!(response.status_message(), "OKSet-Cookie: admin=1");

        response.set_status_message("Still\tFine\0\x7f");
        assert_eq!(response.status_message(), "Still\tFine");
    }
}
