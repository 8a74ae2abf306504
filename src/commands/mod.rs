//! Command processing layer.
//!
//! Sits between the codec and the store: receives one parsed request
//! frame, validates the command name, arity and argument types against
//! the static command table, runs the store operation, and shapes the
//! reply.

pub mod handler;

pub use handler::CommandHandler;
