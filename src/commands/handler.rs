//! Command dispatch.
//!
//! A static table maps each ASCII-uppercase command name to its handler
//! and declared arity. Arity counts the command name itself: positive
//! means exactly that many elements, negative means at least `|arity|`.
//! Handlers validate argument types (every argument is expected to be a
//! bulk string), parse numeric arguments strictly, run the store
//! operation, and translate the outcome into a reply frame.
//!
//! Supported commands: `PING`, `ECHO`, `GET`, `SET`, `DEL`, `INCR`,
//! `DECR`, `INCRBY`, `DECRBY`, `EXPIRE`, `EXPIREAT`, `TTL`, `LPUSH`,
//! `RPUSH`, `LPOP`, `RPOP`, `LRANGE`, `LLEN`, and a `CONFIG` stub that
//! satisfies benchmark clients.

use crate::protocol::Frame;
use crate::storage::{parse_strict_i64, ExpireOption, Store, StoreError};
use bytes::Bytes;
use std::sync::Arc;

type Handler = fn(&CommandHandler, &[Frame]) -> Frame;

struct CommandSpec {
    name: &'static str,
    /// Positive = exact element count including the command name;
    /// negative = at least `|arity|`.
    arity: i32,
    handler: Handler,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "PING", arity: 1, handler: CommandHandler::cmd_ping },
    CommandSpec { name: "ECHO", arity: 2, handler: CommandHandler::cmd_echo },
    CommandSpec { name: "GET", arity: 2, handler: CommandHandler::cmd_get },
    CommandSpec { name: "SET", arity: 3, handler: CommandHandler::cmd_set },
    CommandSpec { name: "DEL", arity: -2, handler: CommandHandler::cmd_del },
    CommandSpec { name: "INCR", arity: 2, handler: CommandHandler::cmd_incr },
    CommandSpec { name: "DECR", arity: 2, handler: CommandHandler::cmd_decr },
    CommandSpec { name: "INCRBY", arity: 3, handler: CommandHandler::cmd_incrby },
    CommandSpec { name: "DECRBY", arity: 3, handler: CommandHandler::cmd_decrby },
    CommandSpec { name: "EXPIRE", arity: -3, handler: CommandHandler::cmd_expire },
    CommandSpec { name: "EXPIREAT", arity: -3, handler: CommandHandler::cmd_expireat },
    CommandSpec { name: "TTL", arity: 2, handler: CommandHandler::cmd_ttl },
    CommandSpec { name: "LPUSH", arity: -3, handler: CommandHandler::cmd_lpush },
    CommandSpec { name: "RPUSH", arity: -3, handler: CommandHandler::cmd_rpush },
    CommandSpec { name: "LPOP", arity: -2, handler: CommandHandler::cmd_lpop },
    CommandSpec { name: "RPOP", arity: -2, handler: CommandHandler::cmd_rpop },
    CommandSpec { name: "LRANGE", arity: 4, handler: CommandHandler::cmd_lrange },
    CommandSpec { name: "LLEN", arity: 2, handler: CommandHandler::cmd_llen },
    CommandSpec { name: "CONFIG", arity: -2, handler: CommandHandler::cmd_config },
];

/// Executes parsed requests against the shared store.
#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<Store>,
}

impl CommandHandler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Dispatches one request and produces its reply. Every failure mode
    /// comes back as an `Error` frame; the connection keeps serving.
    pub fn execute(&self, request: Frame) -> Frame {
        let args = match request {
            Frame::Array(args) if !args.is_empty() => args,
            _ => return Frame::error("ERR protocol error"),
        };

        let name = match &args[0] {
            Frame::Bulk(raw) => match std::str::from_utf8(raw) {
                Ok(s) => s.to_ascii_uppercase(),
                Err(_) => return Frame::error("ERR protocol error"),
            },
            Frame::Simple(s) => s.to_ascii_uppercase(),
            _ => return Frame::error("ERR protocol error"),
        };

        let spec = match COMMANDS.iter().find(|spec| spec.name == name) {
            Some(spec) => spec,
            None => return Frame::error(format!("ERR unknown command '{}'", name)),
        };

        let argc = args.len() as i32;
        let arity_ok = if spec.arity > 0 {
            argc == spec.arity
        } else {
            argc >= -spec.arity
        };
        if !arity_ok {
            return Frame::error(format!(
                "ERR wrong number of arguments for '{}' command",
                name
            ));
        }

        (spec.handler)(self, &args[1..])
    }

    fn cmd_ping(&self, _args: &[Frame]) -> Frame {
        Frame::simple("PONG")
    }

    fn cmd_echo(&self, args: &[Frame]) -> Frame {
        match bulk_arg(&args[0]) {
            Some(msg) => Frame::Bulk(msg),
            None => wrong_argument_type(),
        }
    }

    fn cmd_get(&self, args: &[Frame]) -> Frame {
        let key = match bulk_arg(&args[0]) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        match self.store.get(&key) {
            Ok(Some(value)) => Frame::Bulk(value),
            Ok(None) => Frame::NullBulk,
            Err(e) => store_error(e),
        }
    }

    fn cmd_set(&self, args: &[Frame]) -> Frame {
        let (key, value) = match (bulk_arg(&args[0]), bulk_arg(&args[1])) {
            (Some(key), Some(value)) => (key, value),
            _ => return wrong_argument_type(),
        };
        self.store.set(key, value);
        Frame::ok()
    }

    fn cmd_del(&self, args: &[Frame]) -> Frame {
        let mut keys = Vec::with_capacity(args.len());
        for arg in args {
            match bulk_arg(arg) {
                Some(key) => keys.push(key),
                None => return wrong_argument_type(),
            }
        }
        Frame::Integer(self.store.del(&keys) as i64)
    }

    fn cmd_incr(&self, args: &[Frame]) -> Frame {
        self.apply_delta(&args[0], 1)
    }

    fn cmd_decr(&self, args: &[Frame]) -> Frame {
        self.apply_delta(&args[0], -1)
    }

    fn cmd_incrby(&self, args: &[Frame]) -> Frame {
        let delta = match int_arg(&args[1]) {
            Some(delta) => delta,
            None => return store_error(StoreError::NotAnInteger),
        };
        self.apply_delta(&args[0], delta)
    }

    fn cmd_decrby(&self, args: &[Frame]) -> Frame {
        let delta = match int_arg(&args[1]) {
            Some(delta) => delta,
            None => return store_error(StoreError::NotAnInteger),
        };
        match delta.checked_neg() {
            Some(delta) => self.apply_delta(&args[0], delta),
            None => store_error(StoreError::Overflow),
        }
    }

    fn apply_delta(&self, key_arg: &Frame, delta: i64) -> Frame {
        let key = match bulk_arg(key_arg) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        match self.store.incr_by(&key, delta) {
            Ok(n) => Frame::Integer(n),
            Err(e) => store_error(e),
        }
    }

    fn cmd_expire(&self, args: &[Frame]) -> Frame {
        self.expire_command(args, false)
    }

    fn cmd_expireat(&self, args: &[Frame]) -> Frame {
        self.expire_command(args, true)
    }

    fn expire_command(&self, args: &[Frame], absolute: bool) -> Frame {
        let key = match bulk_arg(&args[0]) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        let time = match int_arg(&args[1]) {
            Some(time) => time,
            None => return store_error(StoreError::NotAnInteger),
        };
        let option = match args.get(2) {
            None => ExpireOption::Always,
            Some(arg) => match expire_option(arg) {
                Ok(option) => option,
                Err(reply) => return reply,
            },
        };
        let installed = if absolute {
            self.store.expire_at(&key, time, option)
        } else {
            self.store.expire(&key, time, option)
        };
        Frame::Integer(installed as i64)
    }

    fn cmd_ttl(&self, args: &[Frame]) -> Frame {
        match bulk_arg(&args[0]) {
            Some(key) => Frame::Integer(self.store.ttl(&key)),
            None => wrong_argument_type(),
        }
    }

    fn cmd_lpush(&self, args: &[Frame]) -> Frame {
        self.push_command(args, true)
    }

    fn cmd_rpush(&self, args: &[Frame]) -> Frame {
        self.push_command(args, false)
    }

    fn push_command(&self, args: &[Frame], front: bool) -> Frame {
        let key = match bulk_arg(&args[0]) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        let mut elements = Vec::with_capacity(args.len() - 1);
        for arg in &args[1..] {
            match bulk_arg(arg) {
                Some(element) => elements.push(element),
                None => return wrong_argument_type(),
            }
        }
        let result = if front {
            self.store.lpush(&key, elements)
        } else {
            self.store.rpush(&key, elements)
        };
        match result {
            Ok(len) => Frame::Integer(len as i64),
            Err(e) => store_error(e),
        }
    }

    fn cmd_lpop(&self, args: &[Frame]) -> Frame {
        self.pop_command(args, true)
    }

    fn cmd_rpop(&self, args: &[Frame]) -> Frame {
        self.pop_command(args, false)
    }

    fn pop_command(&self, args: &[Frame], front: bool) -> Frame {
        let key = match bulk_arg(&args[0]) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        // Without a count the reply is a single bulk; with one, an array.
        let count = match args.get(1) {
            None => None,
            Some(arg) => match int_arg(arg) {
                Some(n) if n >= 0 => Some(n as usize),
                Some(_) => {
                    return Frame::error("ERR value is out of range, must be positive")
                }
                None => return store_error(StoreError::NotAnInteger),
            },
        };
        let result = if front {
            self.store.lpop(&key, count.unwrap_or(1))
        } else {
            self.store.rpop(&key, count.unwrap_or(1))
        };
        match result {
            Err(e) => store_error(e),
            Ok(None) => Frame::NullBulk,
            Ok(Some(mut popped)) => match count {
                None => popped.pop().map(Frame::Bulk).unwrap_or(Frame::NullBulk),
                Some(_) => Frame::Array(popped.into_iter().map(Frame::Bulk).collect()),
            },
        }
    }

    fn cmd_lrange(&self, args: &[Frame]) -> Frame {
        let key = match bulk_arg(&args[0]) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        let (start, stop) = match (int_arg(&args[1]), int_arg(&args[2])) {
            (Some(start), Some(stop)) => (start, stop),
            _ => return store_error(StoreError::NotAnInteger),
        };
        match self.store.lrange(&key, start, stop) {
            Ok(elements) => Frame::Array(elements.into_iter().map(Frame::Bulk).collect()),
            Err(e) => store_error(e),
        }
    }

    fn cmd_llen(&self, args: &[Frame]) -> Frame {
        let key = match bulk_arg(&args[0]) {
            Some(key) => key,
            None => return wrong_argument_type(),
        };
        match self.store.llen(&key) {
            Ok(len) => Frame::Integer(len as i64),
            Err(e) => store_error(e),
        }
    }

    /// Placeholder that keeps benchmark clients happy: whatever the
    /// arguments, reply with a single key/value pair.
    fn cmd_config(&self, _args: &[Frame]) -> Frame {
        Frame::Array(vec![
            Frame::bulk(Bytes::from_static(b"maxmemory")),
            Frame::bulk(Bytes::from_static(b"0")),
        ])
    }
}

/// Extracts the payload of a bulk-string argument.
fn bulk_arg(frame: &Frame) -> Option<Bytes> {
    match frame {
        Frame::Bulk(b) => Some(b.clone()),
        _ => None,
    }
}

/// Strictly parses a bulk-string argument as a signed 64-bit integer.
fn int_arg(frame: &Frame) -> Option<i64> {
    match frame {
        Frame::Bulk(b) => parse_strict_i64(b),
        _ => None,
    }
}

fn expire_option(frame: &Frame) -> Result<ExpireOption, Frame> {
    let token = match frame {
        Frame::Bulk(b) => match std::str::from_utf8(b) {
            Ok(token) => token,
            Err(_) => return Err(wrong_argument_type()),
        },
        _ => return Err(wrong_argument_type()),
    };
    if token.eq_ignore_ascii_case("NX") {
        Ok(ExpireOption::Nx)
    } else if token.eq_ignore_ascii_case("XX") {
        Ok(ExpireOption::Xx)
    } else if token.eq_ignore_ascii_case("GT") {
        Ok(ExpireOption::Gt)
    } else if token.eq_ignore_ascii_case("LT") {
        Ok(ExpireOption::Lt)
    } else {
        Err(Frame::error(format!("ERR Unsupported option {}", token)))
    }
}

fn wrong_argument_type() -> Frame {
    Frame::error("ERR wrong argument type")
}

fn store_error(e: StoreError) -> Frame {
    Frame::error(e.to_string())
}
