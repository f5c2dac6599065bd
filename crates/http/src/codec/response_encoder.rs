//! Serializes [`HttpResponse`] heads and in-memory bodies.

use std::io;
use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::HeaderName;
use http::header;

use crate::protocol::{HttpResponse, ResponseBody};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 256;

/// Written from the response fields, never copied from the user headers.
const FRAMING_HEADERS: [HeaderName; 4] = [header::CONNECTION, header::CONTENT_LENGTH, header::ACCEPT_RANGES, header::CONTENT_RANGE];

/// Writes the status line and all headers, up to and including the blank line.
///
/// The framing headers come first, in this order: `Connection`, `Content-Length`,
/// `Accept-Ranges`, `Content-Range`. Any of them set in the user headers is skipped
/// there so it is never sent twice.
pub fn encode_head(response: &HttpResponse, dst: &mut BytesMut) {
    dst.reserve(INIT_HEADER_SIZE);

    // FastWrite never fails
    let _ = write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", response.status().as_str(), response.status_message());

    if response.close_connection() {
        dst.put_slice(b"Connection: close\r\n");
    } else {
        dst.put_slice(b"Connection: Keep-Alive\r\n");
    }

    let _ = write!(FastWrite(dst), "Content-Length: {}\r\n", response.content_length());

    if response.accept_ranges() {
        dst.put_slice(b"Accept-Ranges: bytes\r\n");
    }
    if let Some(content_range) = response.content_range() {
        dst.put_slice(b"Content-Range: ");
        dst.put_slice(content_range.as_bytes());
        dst.put_slice(b"\r\n");
    }

    for (header_name, header_value) in response.headers() {
        if FRAMING_HEADERS.contains(header_name) {
            continue;
        }
        dst.put_slice(header_name.as_ref());
        dst.put_slice(b": ");
        dst.put_slice(header_value.as_ref());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

/// Writes the head followed by the body when the body lives in memory.
///
/// A file body is left alone: it goes out separately with `sendfile(2)`.
pub fn encode(response: &HttpResponse, dst: &mut BytesMut) {
    encode_head(response, dst);
    if response.head_only() {
        return;
    }
    if let ResponseBody::Bytes(bytes) = response.body() {
        dst.put_slice(bytes);
    }
}

/// Fast writer implementation for writing to BytesMut.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};

    fn encoded(response: &HttpResponse) -> String {
        let mut dst = BytesMut::new();
        encode(response, &mut dst);
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn keep_alive_with_body() {
        let mut response = HttpResponse::new(false);
        response.insert_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response.set_body("hello");

        let expected = "HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: 5\r\ncontent-type: text/plain\r\n\r\nhello";
        assert_eq!(encoded(&response), expected);
    }

    #[test]
    fn close_always_has_content_length() {
        let response = HttpResponse::simple(true, StatusCode::NOT_FOUND, "");
        let text = encoded(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn range_headers_and_no_duplicates() {
        let mut response = HttpResponse::new(false);
        response.set_status(StatusCode::PARTIAL_CONTENT);
        response.enable_accept_ranges();
        response.set_content_range("bytes 10-19/100");
        response.insert_header(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        response.insert_header(header::CONNECTION, HeaderValue::from_static("upgrade"));
        response.set_body(vec![b'x'; 10]);

        let text = encoded(&response);
        assert!(text.starts_with(
            "HTTP/1.1 206 Partial Content\r\nConnection: Keep-Alive\r\nContent-Length: 10\r\nAccept-Ranges: bytes\r\nContent-Range: bytes 10-19/100\r\n\r\n"
        ));
        assert!(!text.contains("999"));
        assert!(!text.contains("upgrade"));
    }

    #[test]
    fn head_only_keeps_length_but_drops_body() {
        let mut response = HttpResponse::new(false);
        response.set_body("twelve bytes");
        response.set_head_only(true);

        let text = encoded(&response);
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn custom_reason_phrase() {
        let mut response = HttpResponse::new(false);
        response.set_status(StatusCode::IM_A_TEAPOT);
        response.set_status_message("Short And Stout");
        assert!(encoded(&response).starts_with("HTTP/1.1 418 Short And Stout\r\n"));
    }

    #[test]
    fn reason_phrase_cannot_add_header_lines() {
        let mut response = HttpResponse::new(false);
        response.set_status_message("OK\r\nX-Injected: 1\r\n");
        let text = encoded(&response);
        assert!(text.starts_with("HTTP/1.1 200 OKX-Injected: 1\r\n"));
        assert!(!text.lines().any(|line| line.starts_with("X-Injected")));
    }
}
