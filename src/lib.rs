//! # EmberKV, an in-memory key-value server
//!
//! EmberKV is a wire-compatible clone of the well-known in-memory
//! key-value server: it speaks the same length-prefixed protocol over
//! TCP (framed or inline), stores byte strings, 64-bit counters and
//! lists under binary-safe keys, and expires volatile keys both lazily
//! on access and actively from a background sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  TCP listener (main.rs)                                      │
//! │        │ accept, one task per client                         │
//! │        ▼                                                     │
//! │  ConnectionHandler ──► Parser ──► CommandHandler             │
//! │        ▲                              │                      │
//! │        │ serialized replies           ▼                      │
//! │        └──────────────────────── Store ◄──── Sweeper         │
//! │                         keyspace + expiration table          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Three pieces carry the correctness guarantees:
//!
//! - the **codec** ([`protocol`]) parses one request and serializes one
//!   reply, statelessly;
//! - the **store** ([`storage`]) owns the typed keyspace and the
//!   expiration table behind separate reader-writer locks, giving every
//!   command a linearizable view;
//! - the **dispatcher** ([`commands`]) maps names to handlers through a
//!   static arity-checked table.
//!
//! Per-connection plumbing lives in [`connection`]; requests on one
//! connection are answered strictly in arrival order, so pipelining
//! works without any extra machinery.
//!
//! ## Expiry
//!
//! A key becomes *volatile* when `EXPIRE`/`EXPIREAT` installs a record
//! for it. Expired keys are reclaimed two ways: any access deletes them
//! on sight (lazy), and the sweeper samples the expiration table every
//! 100 ms to catch the keys nobody touches again (active).

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Frame, ParseError, Parser};
pub use storage::{start_sweeper, ExpireOption, Store, Sweeper, SweeperConfig};

/// Default port, shared with the server this one clones.
pub const DEFAULT_PORT: u16 = 6379;

/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Crate version, from the manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
