//! The typed key-value store and its expiration machinery.
//!
//! [`engine`] owns all user data: a keyspace of typed values and a
//! separate expiration table, each behind its own reader-writer lock.
//! [`expiry`] runs the background sweeper that probabilistically evicts
//! expired keys the clients never touch again.
//!
//! ```
//! use emberkv::storage::{ExpireOption, Store};
//! use bytes::Bytes;
//!
//! let store = Store::new();
//! store.set(Bytes::from("name"), Bytes::from("ember"));
//! assert_eq!(store.get(&Bytes::from("name")).unwrap(), Some(Bytes::from("ember")));
//!
//! store.expire(&Bytes::from("name"), 60, ExpireOption::Always);
//! assert!(store.ttl(&Bytes::from("name")) > 0);
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{parse_strict_i64, ExpireOption, ExpireRecord, Store, StoreError, Value};
pub use expiry::{start_sweeper, Sweeper, SweeperConfig};
