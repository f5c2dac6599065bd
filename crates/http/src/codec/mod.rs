//! Wire format: the incremental request parser and the response encoder.
//!
//! - [`HttpContext`] consumes request bytes as they arrive and assembles an
//!   [`HttpRequest`](crate::protocol::HttpRequest), bounded by [`ParseLimits`].
//! - [`encode_head`] and [`encode`] turn an [`HttpResponse`](crate::protocol::HttpResponse)
//!   back into bytes.
//!
//! # Example
//!
//! ```
//! use ember_http::codec::HttpContext;
//!
//! let mut context = HttpContext::default();
//! let data = b"GET /hello?name=ember HTTP/1.1\r\nHost: localhost\r\n\r\n";
//!
//! let consumed = context.parse(data).unwrap();
//! assert_eq!(consumed, data.len());
//! assert!(context.is_complete());
//! assert_eq!(context.request().query_value("name"), Some("ember"));
//! ```

mod chunked_decoder;
mod context;
mod response_encoder;

pub use context::{HttpContext, ParseLimits};
pub use response_encoder::{encode, encode_head};
