//! Single byte-range requests, `Range: bytes=...`.
//!
//! Only one range per request is understood. Multi-range specs and other
//! units are treated as if no `Range` header was sent.

/// A parsed `bytes=` range, not yet checked against a resource size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end`, both inclusive.
    FromTo(u64, u64),
    /// `bytes=start-`
    From(u64),
    /// `bytes=-len`, the last `len` bytes.
    Suffix(u64),
}

/// An inclusive range that fits inside the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    /// Never zero: a resolved range holds at least one byte.
    #[allow(clippy::len_without_is_empty, reason = "a resolved range is never empty")]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The `Content-Range` value for a `206` response.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// The `Content-Range` value for a `416` response.
pub fn unsatisfiable_content_range(total: u64) -> String {
    format!("bytes */{total}")
}

impl ByteRange {
    /// Parses a `Range` header value, `None` means the header should be ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => None,
            (true, false) => parse_u64(end).map(ByteRange::Suffix),
            (false, true) => parse_u64(start).map(ByteRange::From),
            (false, false) => Some(ByteRange::FromTo(parse_u64(start)?, parse_u64(end)?)),
        }
    }

    /// Fits the range into a resource of `size` bytes, `None` when it can't be satisfied.
    pub fn resolve(&self, size: u64) -> Option<ResolvedRange> {
        if size == 0 {
            return None;
        }
        let last = size - 1;

        let (start, end) = match *self {
            ByteRange::FromTo(start, end) => (start, end.min(last)),
            ByteRange::From(start) => (start, last),
            ByteRange::Suffix(0) => return None,
            ByteRange::Suffix(len) => (size - len.min(size), last),
        };

        if start > last || end < start {
            return None;
        }
        Some(ResolvedRange { start, end })
    }
}

// `u64::from_str` accepts a leading `+`
fn parse_u64(s: &str) -> Option<u64> {
    if s.bytes().all(|b| b.is_ascii_digit()) { s.parse().ok() } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(ByteRange::parse("bytes=100-200"), Some(ByteRange::FromTo(100, 200)));
        assert_eq!(ByteRange::parse("bytes=-500"), Some(ByteRange::Suffix(500)));
        assert_eq!(ByteRange::parse("bytes=100-"), Some(ByteRange::From(100)));
        assert_eq!(ByteRange::parse(" bytes=0-0 "), Some(ByteRange::FromTo(0, 0)));
    }

    #[test]
    fn parse_rejects_the_rest() {
        for value in ["", "bytes=", "bytes=-", "items=0-10", "bytes=a-b", "bytes=+1-2", "bytes=0-1,3-4", "bytes 0-1", "bytes=99999999999999999999-"] {
            assert_eq!(ByteRange::parse(value), None, "{value:?}");
        }
    }

    #[test]
    fn resolve_clamps_and_rejects() {
        assert_eq!(ByteRange::FromTo(10, 19).resolve(100), Some(ResolvedRange { start: 10, end: 19 }));
        assert_eq!(ByteRange::FromTo(90, 500).resolve(100), Some(ResolvedRange { start: 90, end: 99 }));
        assert_eq!(ByteRange::From(40).resolve(100), Some(ResolvedRange { start: 40, end: 99 }));
        assert_eq!(ByteRange::Suffix(30).resolve(100), Some(ResolvedRange { start: 70, end: 99 }));
        assert_eq!(ByteRange::Suffix(300).resolve(100), Some(ResolvedRange { start: 0, end: 99 }));

        assert_eq!(ByteRange::From(100).resolve(100), None);
        assert_eq!(ByteRange::FromTo(20, 10).resolve(100), None);
        assert_eq!(ByteRange::Suffix(0).resolve(100), None);
        assert_eq!(ByteRange::From(0).resolve(0), None);
    }

    #[test]
    fn content_range_values() {
        let range = ByteRange::FromTo(10, 19).resolve(100).unwrap();
        assert_eq!(range.len(), 10);
        assert_eq!(range.content_range(100), "bytes 10-19/100");
        assert_eq!(unsatisfiable_content_range(100), "bytes */100");
    }
}
