//! Request/response protocol codec.
//!
//! Stateless with respect to the connection: [`types`] defines the
//! [`Frame`] value and its serialization, [`parser`] turns raw bytes back
//! into frames incrementally, with a fallback for inline (unframed)
//! commands.
//!
//! ```
//! use emberkv::protocol::{parse_frame, Frame};
//! use bytes::Bytes;
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (frame, consumed) = parse_frame(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//!
//! let reply = Frame::bulk(Bytes::from("value"));
//! assert_eq!(reply.serialize(), b"$5\r\nvalue\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_frame, ParseError, ParseResult, Parser};
pub use types::Frame;
