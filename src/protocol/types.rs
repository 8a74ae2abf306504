//! Wire protocol value types.
//!
//! The server speaks a length-prefixed, line-oriented protocol in which
//! every value starts with a single type byte and ends with CRLF:
//!
//! | byte | type          | example                |
//! |------|---------------|------------------------|
//! | `+`  | simple string | `+OK\r\n`              |
//! | `-`  | error         | `-ERR oops\r\n`        |
//! | `:`  | integer       | `:1000\r\n`            |
//! | `$`  | bulk string   | `$5\r\nhello\r\n`      |
//! | `*`  | array         | `*1\r\n$4\r\nPING\r\n` |
//!
//! The null bulk string is the distinguished absent-value reply and is
//! wire-encoded as `$-1\r\n`.

use bytes::Bytes;
use std::fmt;

/// CRLF line terminator used by every frame.
pub const CRLF: &[u8] = b"\r\n";

/// Frame type prefix bytes.
pub mod prefix {
    pub const SIMPLE: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// One protocol value, either side of the wire.
///
/// Requests arrive as `Array`s of `Bulk` tokens (the inline fallback
/// produces the same shape); replies may be any variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Non-binary-safe text; must not contain CR or LF.
    Simple(String),
    /// Application-level error, carrying its error-class prefix
    /// (`ERR …`, `WRONGTYPE …`). Same CR/LF constraint as `Simple`.
    Error(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Binary-safe byte string.
    Bulk(Bytes),
    /// The null bulk string, `$-1\r\n`.
    NullBulk,
    /// Ordered sequence of frames; may nest, may be empty.
    Array(Vec<Frame>),
}

impl Frame {
    pub fn simple(s: impl Into<String>) -> Self {
        Frame::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Frame::Error(s.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// The canonical success reply, `+OK`.
    pub fn ok() -> Self {
        Frame::Simple("OK".to_string())
    }

    /// Serializes the frame to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes into an existing buffer, avoiding a fresh allocation
    /// when replies are batched.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                buf.push(prefix::SIMPLE);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Bulk(data) => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Frame::NullBulk => {
                buf.extend_from_slice(b"$-1");
                buf.extend_from_slice(CRLF);
            }
            Frame::Array(items) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for item in items {
                    item.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// The inner bytes of a `Bulk` frame.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "{}", s),
            Frame::Error(s) => write!(f, "(error) {}", s),
            Frame::Integer(n) => write!(f, "(integer) {}", n),
            Frame::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary, {} bytes)", data.len()),
            },
            Frame::NullBulk => write!(f, "(nil)"),
            Frame::Array(items) => {
                if items.is_empty() {
                    return write!(f, "(empty array)");
                }
                writeln!(f)?;
                for (i, item) in items.iter().enumerate() {
                    writeln!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}
