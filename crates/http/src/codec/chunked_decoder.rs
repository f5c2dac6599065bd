//! Decoder for `Transfer-Encoding: chunked` request bodies.
//!
//! The decoder walks the framing one byte at a time, so it can stop at any
//! byte boundary and pick up again when more input arrives. Chunk data is
//! copied straight into the request body.

use std::task::Poll;

use ChunkedState::*;
use bytes::BytesMut;
use tracing::trace;

use crate::ensure;
use crate::protocol::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// first hex digit of the chunk size
    SizeStart,
    /// chunk size in hex
    Size,
    /// whitespace after the size
    SizeLws,
    /// `;ext=value`, ignored
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    /// trailer field after the last chunk, skipped
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self { state: SizeStart, remaining_size: 0 }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == End
    }

    /// Consumes framing and data from `src`, appending chunk data to `body`.
    ///
    /// Returns how many bytes of `src` were consumed. Everything up to the end of the
    /// message or the end of `src` is consumed, whichever comes first.
    pub(crate) fn decode(&mut self, src: &[u8], body: &mut BytesMut, max_body: u64) -> Result<usize, ParseError> {
        let mut cursor = src;
        while self.state != End && !cursor.is_empty() {
            let previous = self.state;
            self.state = match self.state.step(&mut cursor, &mut self.remaining_size, body) {
                Poll::Pending => break,
                Poll::Ready(result) => result?,
            };

            if previous == SizeLf && self.state == Body {
                let total = (body.len() as u64).saturating_add(self.remaining_size);
                ensure!(total <= max_body, ParseError::too_large_body(total, max_body));
                trace!(size = self.remaining_size, "read chunk size");
            }
        }

        if self.state == End {
            trace!(body_size = body.len(), "finished reading chunked data");
        }
        Ok(src.len() - cursor.len())
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        let slice: &[u8] = *$src;
        match slice.split_first() {
            Some((&b, rest)) => {
                *$src = rest;
                b
            }
            None => return Poll::Pending,
        }
    }};
}

impl ChunkedState {
    fn step(self, src: &mut &[u8], remaining_size: &mut u64, body: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match self {
            SizeStart => ChunkedState::read_size_start(src, remaining_size),
            Size => ChunkedState::read_size(src, remaining_size),
            SizeLws => ChunkedState::read_size_lws(src),
            Extension => ChunkedState::read_extension(src),
            SizeLf => ChunkedState::read_size_lf(src, *remaining_size),
            Body => ChunkedState::read_body(src, remaining_size, body),
            BodyCr => ChunkedState::read_body_cr(src),
            BodyLf => ChunkedState::read_body_lf(src),
            Trailer => ChunkedState::read_trailer(src),
            TrailerLf => ChunkedState::read_trailer_lf(src),
            EndCr => ChunkedState::read_end_cr(src),
            EndLf => ChunkedState::read_end_lf(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    fn read_size_start(src: &mut &[u8], size: &mut u64) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        match hex_digit(b) {
            Some(digit) => {
                *size = u64::from(digit);
                Poll::Ready(Ok(Size))
            }
            None => Poll::Ready(Err(ParseError::invalid_chunk("missing chunk size"))),
        }
    }

    fn read_size(src: &mut &[u8], size: &mut u64) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        let Some(digit) = hex_digit(b) else {
            return Poll::Ready(match b {
                b'\t' | b' ' => Ok(SizeLws),
                b';' => Ok(Extension),
                b'\r' => Ok(SizeLf),
                _ => Err(ParseError::invalid_chunk("invalid chunk size")),
            });
        };

        match size.checked_mul(16).and_then(|s| s.checked_add(u64::from(digit))) {
            Some(new_size) => {
                *size = new_size;
                Poll::Ready(Ok(Size))
            }
            None => Poll::Ready(Err(ParseError::invalid_chunk("chunk size overflow"))),
        }
    }

    fn read_size_lws(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            // no more digits after whitespace
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size linear white space"))),
        }
    }

    fn read_extension(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        // extensions end at CRLF, a bare LF inside one is rejected
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => Poll::Ready(Err(ParseError::invalid_chunk("chunk extension contains newline"))),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    fn read_size_lf(src: &mut &[u8], size: u64) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' if size == 0 => Poll::Ready(Ok(EndCr)),
            b'\n' => Poll::Ready(Ok(Body)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size LF"))),
        }
    }

    fn read_body(src: &mut &[u8], remaining_size: &mut u64, body: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        if src.is_empty() {
            return Poll::Pending;
        }

        let read_size = usize::try_from(*remaining_size).map_or(src.len(), |remaining| remaining.min(src.len()));
        let slice: &[u8] = *src;
        let (data, rest) = slice.split_at(read_size);
        body.extend_from_slice(data);
        *src = rest;
        *remaining_size -= read_size as u64;

        if *remaining_size > 0 { Poll::Ready(Ok(Body)) } else { Poll::Ready(Ok(BodyCr)) }
    }

    fn read_body_cr(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk body CR"))),
        }
    }

    fn read_body_lf(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(SizeStart)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk body LF"))),
        }
    }

    fn read_trailer(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(TrailerLf)),
            _ => Poll::Ready(Ok(Trailer)),
        }
    }

    fn read_trailer_lf(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(EndCr)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid trailer end LF"))),
        }
    }

    fn read_end_cr(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(EndLf)),
            _ => Poll::Ready(Ok(Trailer)),
        }
    }

    fn read_end_lf(src: &mut &[u8]) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(End)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk end LF"))),
        }
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b + 10 - b'a'),
        b'A'..=b'F' => Some(b + 10 - b'A'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_LIMIT: u64 = u64::MAX;

    fn decode_all(input: &[u8]) -> Result<(BytesMut, usize, bool), ParseError> {
        let mut decoder = ChunkedDecoder::new();
        let mut body = BytesMut::new();
        let consumed = decoder.decode(input, &mut body, NO_LIMIT)?;
        Ok((body, consumed, decoder.is_finished()))
    }

    #[test]
    fn test_basic() {
        let input = b"10\r\n1234567890abcdef\r\n0\r\n\r\n";
        let (body, consumed, finished) = decode_all(input).unwrap();
        assert_eq!(&body[..], b"1234567890abcdef");
        assert_eq!(consumed, input.len());
        assert!(finished);
    }

    #[test]
    fn test_multiple_chunks() {
        let (body, _, finished) = decode_all(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(&body[..], b"Wikipedia");
        assert!(finished);
    }

    #[test]
    fn test_stops_at_message_end() {
        let input = b"5\r\nhello\r\n0\r\n\r\nGET / HTTP/1.1\r\n";
        let (body, consumed, finished) = decode_all(input).unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(finished);
        assert_eq!(&input[consumed..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_chunks_with_extensions() {
        let (body, _, finished) = decode_all(b"5;chunk-ext=value\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(finished);
    }

    #[test]
    fn test_chunks_with_trailers() {
        let (body, _, finished) = decode_all(b"5\r\nhello\r\n0\r\nExpires: never\r\nX-Checksum: 1\r\n\r\n").unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(finished);
    }

    #[test]
    fn test_every_split_point() {
        let input = b"4\r\nWiki\r\n5;x=y\r\npedia\r\n0\r\nTrailer: v\r\n\r\n";
        for split in 0..=input.len() {
            let mut decoder = ChunkedDecoder::new();
            let mut body = BytesMut::new();
            let first = decoder.decode(&input[..split], &mut body, NO_LIMIT).unwrap();
            assert_eq!(first, split);
            let second = decoder.decode(&input[split..], &mut body, NO_LIMIT).unwrap();
            assert_eq!(first + second, input.len());
            assert!(decoder.is_finished(), "split at {split}");
            assert_eq!(&body[..], b"Wikipedia");
        }
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert!(matches!(decode_all(b"xyz\r\n"), Err(ParseError::InvalidChunk { .. })));
    }

    #[test]
    fn test_empty_chunk_size() {
        assert!(matches!(decode_all(b"\r\n\r\n"), Err(ParseError::InvalidChunk { .. })));
        assert!(matches!(decode_all(b";ext=1\r\nabc\r\n"), Err(ParseError::InvalidChunk { .. })));
        assert!(matches!(decode_all(b" 5\r\nhello\r\n"), Err(ParseError::InvalidChunk { .. })));

        // the size line of a later chunk is checked too
        assert!(matches!(decode_all(b"3\r\nabc\r\n\r\n"), Err(ParseError::InvalidChunk { .. })));
    }

    #[test]
    fn test_size_overflow() {
        assert!(matches!(decode_all(b"fffffffffffffffff\r\n"), Err(ParseError::InvalidChunk { .. })));
    }

    #[test]
    fn test_missing_crlf() {
        assert!(matches!(decode_all(b"5\r\nhelloBad"), Err(ParseError::InvalidChunk { .. })));
    }

    #[test]
    fn test_body_limit() {
        let mut decoder = ChunkedDecoder::new();
        let mut body = BytesMut::new();
        let result = decoder.decode(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n", &mut body, 8);
        assert_eq!(result, Err(ParseError::too_large_body(9, 8)));
    }

    #[test]
    fn test_large_chunk() {
        let size = 1024 * 1024;
        let mut data = format!("{size:x}\r\n").into_bytes();
        data.extend(vec![b'A'; size]);
        data.extend(b"\r\n0\r\n\r\n");

        let (body, _, finished) = decode_all(&data).unwrap();
        assert_eq!(body.len(), size);
        assert!(body.iter().all(|&b| b == b'A'));
        assert!(finished);
    }

    #[test]
    fn test_zero_size_chunk() {
        let (body, consumed, finished) = decode_all(b"0\r\n\r\n").unwrap();
        assert!(body.is_empty());
        assert_eq!(consumed, 5);
        assert!(finished);
    }
}
