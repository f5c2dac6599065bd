//! Incremental HTTP/1.x request parsing.
//!
//! [`HttpContext`] is fed the readable bytes of a connection's input buffer and
//! reports how many of them it has consumed. It never blocks and never needs to
//! see a byte twice: a header line is retired only once its terminating LF has
//! arrived, and the already scanned prefix of an unfinished line is remembered.
//!
//! Lines end with CRLF; a bare LF is accepted as well.

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tracing::trace;

use crate::codec::chunked_decoder::ChunkedDecoder;
use crate::ensure;
use crate::protocol::{HttpRequest, HttpResponse, ParseError};

/// Upper bounds applied while parsing. Breaking any of them is a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    max_line_bytes: usize,
    max_header_bytes: usize,
    max_headers: usize,
    max_body_bytes: u64,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self { max_line_bytes: 8 * 1024, max_header_bytes: 16 * 1024, max_headers: 64, max_body_bytes: 8 * 1024 * 1024 }
    }
}

impl ParseLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Longest request line or header line, line terminator excluded.
    #[must_use]
    pub fn max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Request line plus all header lines, terminators included.
    #[must_use]
    pub fn max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.max_header_bytes = max_header_bytes;
        self
    }

    #[must_use]
    pub fn max_headers(mut self, max_headers: usize) -> Self {
        self.max_headers = max_headers;
        self
    }

    /// Largest body, checked against `Content-Length` up front and against chunk sizes as they arrive.
    #[must_use]
    pub fn max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn get_max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    pub fn get_max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn get_max_headers(&self) -> usize {
        self.max_headers
    }

    pub fn get_max_body_bytes(&self) -> u64 {
        self.max_body_bytes
    }

    /// The most a single request may occupy before its body framing.
    pub fn max_request_bytes(&self) -> u64 {
        (self.max_header_bytes as u64).saturating_add(self.max_body_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    Body,
    Chunked,
    Complete,
}

/// Per-connection parser state plus the request being assembled.
///
/// It also holds at most one deferred response: a response the application
/// has not finished yet. [`reset`](Self::reset) keeps it.
#[derive(Debug)]
pub struct HttpContext {
    limits: ParseLimits,
    phase: Phase,
    request: HttpRequest,
    // bytes of the pending line already searched for LF
    scanned: usize,
    header_bytes: usize,
    remaining: u64,
    chunked: ChunkedDecoder,
    chunked_body: bool,
    deferred: Option<HttpResponse>,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new(ParseLimits::default())
    }
}

impl HttpContext {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            phase: Phase::RequestLine,
            request: HttpRequest::default(),
            scanned: 0,
            header_bytes: 0,
            remaining: 0,
            chunked: ChunkedDecoder::new(),
            chunked_body: false,
            deferred: None,
        }
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    /// Feeds the currently readable bytes.
    ///
    /// `data` must start at the first byte not yet consumed. Returns how many bytes
    /// were consumed; the caller drops exactly that many from its buffer and passes
    /// the rest (plus whatever arrived since) on the next call. Once a request is
    /// complete nothing more is consumed until [`reset`](Self::reset).
    pub fn parse(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut pos = 0;
        loop {
            match self.phase {
                Phase::RequestLine | Phase::Headers => {
                    let Some((line, consumed)) = self.next_line(&data[pos..])? else {
                        return Ok(pos);
                    };
                    pos += consumed;

                    if self.phase == Phase::RequestLine {
                        // empty lines ahead of the request line are skipped
                        if !line.is_empty() {
                            self.parse_request_line(line)?;
                            self.phase = Phase::Headers;
                        }
                    } else if line.is_empty() {
                        self.finish_headers()?;
                    } else {
                        self.parse_header_line(line)?;
                    }
                }

                Phase::Body => {
                    let available = &data[pos..];
                    let take = usize::try_from(self.remaining).map_or(available.len(), |remaining| remaining.min(available.len()));
                    self.request.body_mut().extend_from_slice(&available[..take]);
                    self.remaining -= take as u64;
                    pos += take;

                    if self.remaining > 0 {
                        return Ok(pos);
                    }
                    trace!(body_size = self.request.body().len(), "finished reading body");
                    self.phase = Phase::Complete;
                }

                Phase::Chunked => {
                    pos += self.chunked.decode(&data[pos..], self.request.body_mut(), self.limits.max_body_bytes)?;
                    if !self.chunked.is_finished() {
                        return Ok(pos);
                    }
                    self.phase = Phase::Complete;
                }

                Phase::Complete => return Ok(pos),
            }
        }
    }

    /// Finds the next complete line, returning it without its terminator together with
    /// the number of bytes it occupies.
    fn next_line<'a>(&mut self, data: &'a [u8]) -> Result<Option<(&'a [u8], usize)>, ParseError> {
        let start = self.scanned.min(data.len());
        let Some(offset) = data[start..].iter().position(|&b| b == b'\n') else {
            self.scanned = data.len();
            let pending = data.len() - usize::from(data.last() == Some(&b'\r'));
            ensure!(pending <= self.limits.max_line_bytes, ParseError::too_long_line(pending, self.limits.max_line_bytes));
            let header_bytes = self.header_bytes + data.len();
            ensure!(header_bytes <= self.limits.max_header_bytes, ParseError::too_large_header(header_bytes, self.limits.max_header_bytes));
            return Ok(None);
        };

        let lf = start + offset;
        self.scanned = 0;
        let line = data[..lf].strip_suffix(b"\r").unwrap_or(&data[..lf]);
        ensure!(line.len() <= self.limits.max_line_bytes, ParseError::too_long_line(line.len(), self.limits.max_line_bytes));

        self.header_bytes += lf + 1;
        ensure!(
            self.header_bytes <= self.limits.max_header_bytes,
            ParseError::too_large_header(self.header_bytes, self.limits.max_header_bytes)
        );
        Ok(Some((line, lf + 1)))
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let mut parts = line.split(|&b| b == b' ');
        let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(ParseError::invalid_request_line("expect `METHOD target HTTP/1.x`"));
        };

        let method = Method::from_bytes(method).map_err(|_| ParseError::InvalidMethod)?;

        ensure!(!target.is_empty() && target.iter().all(u8::is_ascii_graphic), ParseError::InvalidUri);
        let target = std::str::from_utf8(target).map_err(|_| ParseError::InvalidUri)?;

        let version = match version {
            b"HTTP/1.1" => Version::HTTP_11,
            b"HTTP/1.0" => Version::HTTP_10,
            _ => return Err(ParseError::InvalidVersion),
        };

        trace!(%method, target, ?version, "parsed request line");
        self.request.set_method(method);
        self.request.set_target(target);
        self.request.set_version(version);
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        ensure!(!matches!(line.first(), Some(b' ' | b'\t')), ParseError::invalid_header("obsolete line folding is not supported"));
        ensure!(self.request.headers().len() < self.limits.max_headers, ParseError::too_many_headers(self.limits.max_headers));

        let colon = line.iter().position(|&b| b == b':').ok_or_else(|| ParseError::invalid_header("missing colon"))?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| ParseError::invalid_header("invalid header name"))?;
        let value = HeaderValue::from_bytes(trim_ows(&line[colon + 1..])).map_err(|_| ParseError::invalid_header(format!("invalid value for {name}")))?;

        self.request.headers_mut().append(name, value);
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        let headers = self.request.headers();
        // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-transfer-encoding
        let transfer_encoding = headers.get_all(TRANSFER_ENCODING).iter().last();
        let content_length = content_length(headers)?;

        self.phase = match (transfer_encoding, content_length) {
            (Some(_), Some(_)) => {
                return Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers"));
            }
            (Some(te), None) if is_chunked(te) => {
                self.chunked = ChunkedDecoder::new();
                self.chunked_body = true;
                Phase::Chunked
            }
            // refer: https://www.rfc-editor.org/rfc/rfc9112.html#section-6.3-2.4.3
            (Some(_), None) => return Err(ParseError::invalid_header("transfer-encoding does not end with chunked")),
            (None, None | Some(0)) => Phase::Complete,
            (None, Some(length)) => {
                let max = self.limits.max_body_bytes;
                ensure!(length <= max, ParseError::too_large_body(length, max));
                self.remaining = length;
                Phase::Body
            }
        };

        trace!(header_bytes = self.header_bytes, phase = ?self.phase, "finished reading headers");
        Ok(())
    }

    pub fn headers_complete(&self) -> bool {
        matches!(self.phase, Phase::Body | Phase::Chunked | Phase::Complete)
    }

    pub fn body_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// A whole request has been parsed and waits to be taken.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// Whether the current request frames its body with chunked encoding. False until its
    /// headers are complete and again after [`reset`](Self::reset).
    pub fn is_chunked(&self) -> bool {
        self.chunked_body
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// Moves the request out, leaving an empty one behind.
    pub fn take_request(&mut self) -> HttpRequest {
        std::mem::take(&mut self.request)
    }

    /// Gets ready for the next request on the same connection. A deferred response survives.
    pub fn reset(&mut self) {
        self.phase = Phase::RequestLine;
        self.request = HttpRequest::default();
        self.scanned = 0;
        self.header_bytes = 0;
        self.remaining = 0;
        self.chunked = ChunkedDecoder::new();
        self.chunked_body = false;
    }

    pub fn store_deferred(&mut self, response: HttpResponse) {
        self.deferred = Some(response);
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn deferred_mut(&mut self) -> Option<&mut HttpResponse> {
        self.deferred.as_mut()
    }

    pub fn take_deferred(&mut self) -> Option<HttpResponse> {
        self.deferred.take()
    }

    pub fn clear_deferred(&mut self) {
        self.deferred = None;
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// Every `Content-Length` field must hold the same plain decimal number.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let cl_str = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
        ensure!(
            !cl_str.is_empty() && cl_str.bytes().all(|b| b.is_ascii_digit()),
            ParseError::invalid_content_length(format!("value {cl_str} is not u64"))
        );
        let parsed = cl_str.parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;

        match length {
            Some(previous) if previous != parsed => return Err(ParseError::invalid_content_length("conflicting values")),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Chunked must be the final encoding to frame the body.
fn is_chunked(value: &HeaderValue) -> bool {
    value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
