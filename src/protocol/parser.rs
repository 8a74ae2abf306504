//! Incremental protocol parser.
//!
//! The parser reads from a byte buffer and returns either:
//!
//! - `Ok(Some((frame, consumed)))`: a complete value, `consumed` bytes used
//! - `Ok(None)`: the frame is incomplete, the caller should read more
//! - `Err(ParseError)`: malformed input
//!
//! The caller appends network data to a buffer, attempts a parse, and on
//! success advances the buffer by `consumed`. Binary payloads come out as
//! `bytes::Bytes`, so pipelined requests never copy more than once.
//!
//! Parse errors come in two classes. A *recoverable* error means the
//! malformed value's full extent is known (its length line was read up to
//! CRLF), so the stream can resync at the next frame boundary; these carry
//! the byte count to skip. Everything else is fatal to the connection
//! because the remaining stream position is undefined.
//!
//! Any first byte outside the five type prefixes starts an inline command:
//! the rest of the line up to LF is split on runs of ASCII whitespace and
//! emitted as an array of bulk-string tokens. This is the entry point for
//! clients that send raw unframed commands.

use crate::protocol::types::{prefix, Frame, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Maximum size for a single bulk string (512 MB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Errors produced while parsing a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Integer frame whose payload is not a decimal i64.
    #[error("invalid integer frame")]
    BadInteger { consumed: usize },

    /// Bulk length not decodable, or negative other than -1.
    #[error("invalid bulk string length")]
    BadBulkLength { consumed: usize },

    /// Array count not decodable, or negative other than -1.
    #[error("invalid array length")]
    BadArrayLength { consumed: usize },

    /// Inline line containing only whitespace. Skipped without a reply.
    #[error("empty inline command")]
    EmptyInline { consumed: usize },

    /// Bulk body not terminated by CRLF.
    #[error("bulk string missing trailing CRLF")]
    MissingTerminator,

    /// Invalid UTF-8 in a simple string, error, or inline line.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Declared size exceeds the cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Arrays nested deeper than [`MAX_NESTING_DEPTH`].
    #[error("maximum nesting depth exceeded")]
    DepthExceeded,

    /// Corruption inside a partially-parsed array; no resync point.
    #[error("malformed frame")]
    Malformed,
}

impl ParseError {
    /// For recoverable errors, the number of bytes the malformed value
    /// occupied. The connection skips them, replies with a protocol
    /// error, and keeps serving.
    pub fn recoverable_skip(&self) -> Option<usize> {
        match self {
            ParseError::BadInteger { consumed }
            | ParseError::BadBulkLength { consumed }
            | ParseError::BadArrayLength { consumed }
            | ParseError::EmptyInline { consumed } => Some(*consumed),
            _ => None,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Incremental frame parser. Holds only the current nesting depth; all
/// buffering lives with the caller.
#[derive(Debug, Default)]
pub struct Parser {
    depth: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one frame from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::DepthExceeded);
        }

        match buf[0] {
            prefix::SIMPLE => self.parse_line(buf, Frame::Simple),
            prefix::ERROR => self.parse_line(buf, Frame::Error),
            prefix::INTEGER => self.parse_integer(buf),
            prefix::BULK => self.parse_bulk(buf),
            prefix::ARRAY => self.parse_array(buf),
            _ => self.parse_inline(buf),
        }
    }

    /// Parses `+<text>\r\n` or `-<text>\r\n`.
    fn parse_line(
        &mut self,
        buf: &[u8],
        build: fn(String) -> Frame,
    ) -> ParseResult<Option<(Frame, usize)>> {
        let pos = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let text = std::str::from_utf8(&buf[1..1 + pos])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
        Ok(Some((build(text.to_string()), 1 + pos + 2)))
    }

    /// Parses `:<decimal>\r\n`. A leading `+` is tolerated on the wire.
    fn parse_integer(&mut self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        let pos = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let consumed = 1 + pos + 2;
        let payload = &buf[1..1 + pos];
        let digits = match payload.first() {
            Some(b'+') => &payload[1..],
            _ => payload,
        };
        match std::str::from_utf8(digits).ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(n) => Ok(Some((Frame::Integer(n), consumed))),
            None => Err(ParseError::BadInteger { consumed }),
        }
    }

    /// Parses `$<len>\r\n<body>\r\n`, with `$-1\r\n` as the null bulk.
    fn parse_bulk(&mut self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        let len_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let header = 1 + len_end + 2;

        let length = std::str::from_utf8(&buf[1..1 + len_end])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(ParseError::BadBulkLength { consumed: header })?;

        if length == -1 {
            return Ok(Some((Frame::NullBulk, header)));
        }
        if length < 0 {
            return Err(ParseError::BadBulkLength { consumed: header });
        }
        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(ParseError::FrameTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let total = header + length + 2;
        if buf.len() < total {
            return Ok(None);
        }
        if &buf[header + length..total] != CRLF {
            return Err(ParseError::MissingTerminator);
        }

        let data = Bytes::copy_from_slice(&buf[header..header + length]);
        Ok(Some((Frame::Bulk(data), total)))
    }

    /// Parses `*<count>\r\n` followed by `count` frames.
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        let count_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let header = 1 + count_end + 2;

        let count = std::str::from_utf8(&buf[1..1 + count_end])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(ParseError::BadArrayLength { consumed: header })?;

        if count == -1 {
            return Ok(Some((Frame::NullBulk, header)));
        }
        if count < 0 {
            return Err(ParseError::BadArrayLength { consumed: header });
        }

        let mut items = Vec::with_capacity(count as usize);
        let mut consumed = header;

        self.depth += 1;
        for _ in 0..count {
            if consumed >= buf.len() {
                return Ok(None);
            }
            // A recoverable error inside an array leaves the element
            // boundary unknown from the outside; escalate to fatal.
            match self.parse_value(&buf[consumed..]).map_err(|e| {
                if e.recoverable_skip().is_some() {
                    ParseError::Malformed
                } else {
                    e
                }
            })? {
                Some((item, used)) => {
                    items.push(item);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((Frame::Array(items), consumed)))
    }

    /// Parses an unframed command line terminated by LF. A trailing CR
    /// before the LF is dropped.
    fn parse_inline(&mut self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        let lf = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let consumed = lf + 1;
        let mut line = &buf[..lf];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        let line = std::str::from_utf8(line)
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let tokens: Vec<Frame> = line
            .split_ascii_whitespace()
            .map(|tok| Frame::Bulk(Bytes::from(tok.to_string())))
            .collect();
        if tokens.is_empty() {
            return Err(ParseError::EmptyInline { consumed });
        }

        Ok(Some((Frame::Array(tokens), consumed)))
    }
}

/// Position of the `\r` of the first CRLF in `buf`, if complete.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single frame from a standalone byte slice.
pub fn parse_frame(buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    Parser::new().parse(buf)
}
