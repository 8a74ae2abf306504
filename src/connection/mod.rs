//! Client connection management.
//!
//! The accept loop in `main` spawns one task per client; each task owns
//! a [`ConnectionHandler`] that reads, parses, dispatches and replies
//! until the client goes away, an idle deadline fires, or the stream
//! breaks.

pub mod handler;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionStats, READ_TIMEOUT,
    WRITE_TIMEOUT,
};
