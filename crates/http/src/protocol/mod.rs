//! Protocol types: the request, the response, byte ranges and parse errors.

mod error;
mod query;
mod range;
mod request;
mod response;

pub use error::ParseError;
pub use query::{parse_query, percent_decode, url_decode};
pub use range::{ByteRange, ResolvedRange, unsatisfiable_content_range};
pub use request::HttpRequest;
pub use response::{HttpResponse, ResponseBody};
