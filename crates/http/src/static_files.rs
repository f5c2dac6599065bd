//! Serves regular files below a root directory.
//!
//! Bodies are sent with `sendfile(2)` through the connection; a single
//! `Range: bytes=...` is honoured with `206 Partial Content`.

use std::fs::File;
use std::path::{Path, PathBuf};

use http::{HeaderValue, Method, StatusCode, header};
use mime::Mime;
use tracing::{trace, warn};

use crate::protocol::{HttpRequest, HttpResponse, percent_decode, unsatisfiable_content_range};

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone)]
pub struct StaticFileHandler {
    root: PathBuf,
}

impl StaticFileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fills `response` for `request`. Always returns `true`, so it can be the
    /// body of an HTTP callback directly.
    ///
    /// The `Connection` decision already made for the response is kept for
    /// errors too.
    pub fn handle(&self, request: &HttpRequest, response: &mut HttpResponse) -> bool {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            error_response(response, StatusCode::METHOD_NOT_ALLOWED);
            response.insert_header(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return true;
        }

        let path = match self.resolve(request.path()) {
            Ok(path) => path,
            Err(status) => {
                error_response(response, status);
                return true;
            }
        };

        let size = match path.metadata() {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => {
                trace!(path = %path.display(), "no such file");
                error_response(response, StatusCode::NOT_FOUND);
                return true;
            }
        };

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), cause = %e, "failed to open file");
                error_response(response, StatusCode::INTERNAL_SERVER_ERROR);
                return true;
            }
        };

        response.set_content_type(&content_type(&path));
        response.enable_accept_ranges();

        let Some(range) = request.range() else {
            response.set_status(StatusCode::OK);
            if size > 0 {
                response.set_file(file, 0, size);
            }
            return true;
        };

        match range.resolve(size) {
            Some(resolved) => {
                response.set_status(StatusCode::PARTIAL_CONTENT);
                response.set_content_range(resolved.content_range(size));
                response.set_file(file, resolved.start, resolved.len());
            }
            None => {
                response.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
                response.set_content_range(unsatisfiable_content_range(size));
            }
        }
        true
    }

    /// Maps a request path onto the file system, `Err` carries the status to answer.
    fn resolve(&self, request_path: &str) -> Result<PathBuf, StatusCode> {
        if !request_path.starts_with('/') {
            return Err(StatusCode::BAD_REQUEST);
        }
        let decoded = percent_decode(request_path);

        let mut path = self.root.clone();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(StatusCode::FORBIDDEN),
                segment if segment.contains('\0') => return Err(StatusCode::BAD_REQUEST),
                segment => path.push(segment),
            }
        }
        if decoded.ends_with('/') {
            path.push(INDEX_FILE);
        }
        Ok(path)
    }
}

fn error_response(response: &mut HttpResponse, status: StatusCode) {
    response.set_status(status);
    response.set_content_type(&mime::TEXT_PLAIN_UTF_8);
    let body = format!("{} {}\n", status.as_str(), response.status_message());
    response.set_body(body);
}

fn content_type(path: &Path) -> Mime {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => mime::TEXT_HTML_UTF_8,
        Some("css") => mime::TEXT_CSS_UTF_8,
        Some("js" | "mjs") => mime::APPLICATION_JAVASCRIPT_UTF_8,
        Some("json") => mime::APPLICATION_JSON,
        Some("txt") => mime::TEXT_PLAIN_UTF_8,
        Some("csv") => mime::TEXT_CSV_UTF_8,
        Some("xml") => mime::TEXT_XML,
        Some("png") => mime::IMAGE_PNG,
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("gif") => mime::IMAGE_GIF,
        Some("svg") => mime::IMAGE_SVG,
        Some("bmp") => mime::IMAGE_BMP,
        Some("pdf") => mime::APPLICATION_PDF,
        Some("woff") => mime::FONT_WOFF,
        Some("woff2") => mime::FONT_WOFF2,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}
