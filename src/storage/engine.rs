//! Typed key-value store with expiration metadata.
//!
//! Two maps back the store, each behind its own reader-writer lock:
//!
//! - the **keyspace**, mapping keys to typed values (byte string,
//!   64-bit counter, or list);
//! - the **expiration table**, mapping keys to an absolute deadline plus
//!   the duration that was supplied when the expiration was installed
//!   (the latter drives the `GT`/`LT` comparison rules).
//!
//! Keeping the maps separate means a counter increment never contends
//! with a TTL query. Lock ordering is keyspace before expiration,
//! everywhere. Read paths that discover an expired key release their
//! shared hold before re-acquiring both locks exclusively for the lazy
//! deletion, and re-check the deadline after re-acquisition because
//! another task may have raced ahead.
//!
//! A key with an expiration record is called *volatile*. A volatile key
//! whose deadline has passed is logically absent for every operation
//! except TTL inspection; physically it lingers until lazy eviction on
//! access or the background sweeper removes it. An expiration record may
//! also outlive its key entirely (installing an expiration does not
//! require the key to exist).

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A stored value. The variant is the key's dynamic type; commands that
/// expect a different variant fail with [`StoreError::WrongType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Arbitrary byte string.
    Bytes(Bytes),
    /// Signed 64-bit counter. A `Bytes` value holding decimal digits is
    /// equivalent for increment purposes and is converted on first use.
    Counter(i64),
    /// Ordered byte-string sequence. Never stored empty: an operation
    /// that drains the list removes the key.
    List(VecDeque<Bytes>),
}

/// Expiration metadata for one volatile key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireRecord {
    /// Absolute instant at which the key stops being visible.
    pub deadline: Instant,
    /// The duration supplied when this record was installed, kept
    /// verbatim for `GT`/`LT` comparisons.
    pub set_ttl: Duration,
}

/// Conditional-update mode for `EXPIRE`/`EXPIREAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpireOption {
    /// Install unconditionally.
    #[default]
    Always,
    /// Only if the key is not currently volatile (`NX`).
    Nx,
    /// Only if the key is currently volatile (`XX`).
    Xx,
    /// Only if volatile and the new duration is greater (`GT`).
    Gt,
    /// Only if volatile and the new duration is smaller (`LT`).
    Lt,
}

/// Typed failure of a store operation. The `Display` strings are the
/// exact wire error messages.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,
    #[error("ERR increment or decrement would overflow")]
    Overflow,
}

/// The shared store. Wrap in an `Arc` and hand a clone of the handle to
/// every connection task and the sweeper; all operations take `&self`
/// and are linearizable through the two locks.
#[derive(Debug, Default)]
pub struct Store {
    keys: RwLock<HashMap<Bytes, Value>>,
    expirations: RwLock<HashMap<Bytes, ExpireRecord>>,
}

/// Strict decimal i64 parse for stored values and command arguments:
/// no surrounding whitespace and no leading `+`.
pub fn parse_strict_i64(raw: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(raw).ok()?;
    if s.starts_with('+') {
        return None;
    }
    s.parse::<i64>().ok()
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally stores a byte-string value. An existing live
    /// expiration record survives; a stale one is dropped together with
    /// the old value before the insert.
    pub fn set(&self, key: Bytes, value: Bytes) {
        let mut keys = self.keys.write().unwrap();
        if self.record_expired(&key) {
            keys.remove(&key);
            self.expirations.write().unwrap().remove(&key);
        }
        keys.insert(key, Value::Bytes(value));
    }

    /// Looks up a key. Counters read back as their decimal rendering;
    /// lists reject the read with `WRONGTYPE`.
    pub fn get(&self, key: &Bytes) -> Result<Option<Bytes>, StoreError> {
        {
            let keys = self.keys.read().unwrap();
            match keys.get(key) {
                None => return Ok(None),
                Some(value) => {
                    if !self.record_expired(key) {
                        return match value {
                            Value::Bytes(b) => Ok(Some(b.clone())),
                            Value::Counter(n) => Ok(Some(Bytes::from(n.to_string()))),
                            Value::List(_) => Err(StoreError::WrongType),
                        };
                    }
                }
            }
        }
        // Expired: the shared hold is gone, delete under the write locks.
        self.evict_if_expired(key);
        Ok(None)
    }

    /// Removes each present key from both maps. Returns how many were
    /// logically present (an expired leftover does not count).
    pub fn del(&self, targets: &[Bytes]) -> u64 {
        let mut keys = self.keys.write().unwrap();
        let mut expirations = self.expirations.write().unwrap();
        let now = Instant::now();
        let mut removed = 0;
        for key in targets {
            let live = keys.remove(key).is_some()
                && expirations.get(key).map_or(true, |r| r.deadline > now);
            expirations.remove(key);
            if live {
                removed += 1;
            }
        }
        removed
    }

    /// Adds `delta` to the counter at `key`, creating it at `delta` if
    /// absent. Byte strings holding decimal digits convert to counters
    /// as a side effect. One critical section under the exclusive
    /// keyspace lock: read, parse, add, store.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StoreError> {
        let mut keys = self.keys.write().unwrap();
        if self.record_expired(key) {
            keys.remove(key);
            self.expirations.write().unwrap().remove(key);
        }
        let current = match keys.get(key) {
            None => 0,
            Some(Value::Counter(n)) => *n,
            Some(Value::Bytes(b)) => parse_strict_i64(b).ok_or(StoreError::NotAnInteger)?,
            Some(Value::List(_)) => return Err(StoreError::WrongType),
        };
        let updated = current.checked_add(delta).ok_or(StoreError::Overflow)?;
        keys.insert(key.clone(), Value::Counter(updated));
        Ok(updated)
    }

    pub fn incr(&self, key: &Bytes) -> Result<i64, StoreError> {
        self.incr_by(key, 1)
    }

    pub fn decr(&self, key: &Bytes) -> Result<i64, StoreError> {
        self.incr_by(key, -1)
    }

    /// Prepends elements one at a time, so the last argument ends up at
    /// the head. Creates the list if the key is absent. Returns the new
    /// length.
    pub fn lpush(&self, key: &Bytes, elements: Vec<Bytes>) -> Result<usize, StoreError> {
        self.push(key, elements, true)
    }

    /// Appends elements in argument order. Returns the new length.
    pub fn rpush(&self, key: &Bytes, elements: Vec<Bytes>) -> Result<usize, StoreError> {
        self.push(key, elements, false)
    }

    fn push(&self, key: &Bytes, elements: Vec<Bytes>, front: bool) -> Result<usize, StoreError> {
        let mut keys = self.keys.write().unwrap();
        if self.record_expired(key) {
            keys.remove(key);
            self.expirations.write().unwrap().remove(key);
        }
        match keys
            .entry(key.clone())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(list) => {
                for element in elements {
                    if front {
                        list.push_front(element);
                    } else {
                        list.push_back(element);
                    }
                }
                Ok(list.len())
            }
            _ => Err(StoreError::WrongType),
        }
    }

    /// Removes up to `count` elements from the head, returned in removal
    /// order. `None` means the key is absent (distinct from an empty
    /// result). A drained list is removed from the keyspace together
    /// with any expiration record.
    pub fn lpop(&self, key: &Bytes, count: usize) -> Result<Option<Vec<Bytes>>, StoreError> {
        self.pop(key, count, true)
    }

    /// Removes up to `count` elements from the tail, returned in
    /// ascending positional order (the former tail last).
    pub fn rpop(&self, key: &Bytes, count: usize) -> Result<Option<Vec<Bytes>>, StoreError> {
        self.pop(key, count, false)
    }

    fn pop(
        &self,
        key: &Bytes,
        count: usize,
        front: bool,
    ) -> Result<Option<Vec<Bytes>>, StoreError> {
        let mut keys = self.keys.write().unwrap();
        if self.record_expired(key) {
            keys.remove(key);
            self.expirations.write().unwrap().remove(key);
        }
        let (popped, emptied) = match keys.get_mut(key) {
            None => return Ok(None),
            Some(Value::List(list)) => {
                let take = count.min(list.len());
                let popped: Vec<Bytes> = if front {
                    list.drain(..take).collect()
                } else {
                    let at = list.len() - take;
                    list.split_off(at).into_iter().collect()
                };
                (popped, list.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType),
        };
        if emptied {
            keys.remove(key);
            self.expirations.write().unwrap().remove(key);
        }
        Ok(Some(popped))
    }

    /// Inclusive range with signed indices: negatives count from the
    /// tail, then both ends clamp to the list. An inverted or
    /// out-of-range window, or an absent key, yields an empty result.
    pub fn lrange(&self, key: &Bytes, start: i64, stop: i64) -> Result<Vec<Bytes>, StoreError> {
        {
            let keys = self.keys.read().unwrap();
            match keys.get(key) {
                None => return Ok(Vec::new()),
                Some(value) => {
                    if !self.record_expired(key) {
                        let list = match value {
                            Value::List(list) => list,
                            _ => return Err(StoreError::WrongType),
                        };
                        let len = list.len() as i64;
                        let start = if start < 0 { len + start } else { start }.max(0);
                        let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
                        if start > stop {
                            return Ok(Vec::new());
                        }
                        return Ok(list
                            .iter()
                            .skip(start as usize)
                            .take((stop - start + 1) as usize)
                            .cloned()
                            .collect());
                    }
                }
            }
        }
        self.evict_if_expired(key);
        Ok(Vec::new())
    }

    /// List length, or 0 for an absent key.
    pub fn llen(&self, key: &Bytes) -> Result<usize, StoreError> {
        {
            let keys = self.keys.read().unwrap();
            match keys.get(key) {
                None => return Ok(0),
                Some(value) => {
                    if !self.record_expired(key) {
                        return match value {
                            Value::List(list) => Ok(list.len()),
                            _ => Err(StoreError::WrongType),
                        };
                    }
                }
            }
        }
        self.evict_if_expired(key);
        Ok(0)
    }

    /// Installs a relative expiration. Non-positive `seconds` deletes
    /// the key outright (both maps); the reply is then whether the key
    /// was logically present. Otherwise returns whether the record was
    /// installed under `option`.
    pub fn expire(&self, key: &Bytes, seconds: i64, option: ExpireOption) -> bool {
        if seconds <= 0 {
            return self.purge(key);
        }
        let ttl = Duration::from_secs(seconds as u64);
        self.install_expiration(key, Instant::now() + ttl, ttl, option)
    }

    /// Installs an absolute expiration given a unix timestamp in
    /// seconds. A deadline at or before now behaves like a non-positive
    /// `expire`.
    pub fn expire_at(&self, key: &Bytes, unix_secs: i64, option: ExpireOption) -> bool {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        if unix_secs <= now_unix {
            return self.purge(key);
        }
        let ttl = Duration::from_secs((unix_secs - now_unix) as u64);
        self.install_expiration(key, Instant::now() + ttl, ttl, option)
    }

    /// Remaining time to live in whole seconds, rounded up. `-2` if the
    /// key is absent from the keyspace, `-1` if it carries no live
    /// expiration.
    pub fn ttl(&self, key: &Bytes) -> i64 {
        let keys = self.keys.read().unwrap();
        if !keys.contains_key(key) {
            return -2;
        }
        let expirations = self.expirations.read().unwrap();
        let now = Instant::now();
        match expirations.get(key) {
            Some(record) if record.deadline > now => {
                (record.deadline - now).as_millis().div_ceil(1000) as i64
            }
            _ => -1,
        }
    }

    /// Number of keys physically present in the keyspace.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of expiration records, live or stale.
    pub fn expiration_count(&self) -> usize {
        self.expirations.read().unwrap().len()
    }

    /// Samples up to `max` keys from the expiration table starting at
    /// `offset` into its iteration order and evicts every sampled key
    /// whose deadline has passed. Returns `(sampled, evicted)`. This is
    /// the sweeper's workhorse.
    pub fn evict_expired_sample(&self, max: usize, offset: usize) -> (usize, usize) {
        let sampled: Vec<Bytes> = {
            let expirations = self.expirations.read().unwrap();
            if expirations.is_empty() {
                return (0, 0);
            }
            let skip = offset % expirations.len();
            expirations
                .keys()
                .cycle()
                .skip(skip)
                .take(max.min(expirations.len()))
                .cloned()
                .collect()
        };
        let mut evicted = 0;
        for key in &sampled {
            if self.evict_if_expired(key) {
                evicted += 1;
            }
        }
        (sampled.len(), evicted)
    }

    /// True when `key` has an expiration record whose deadline has
    /// passed. Callers may hold the keyspace lock; the expiration lock
    /// is always taken second.
    fn record_expired(&self, key: &Bytes) -> bool {
        self.expirations
            .read()
            .unwrap()
            .get(key)
            .map(|record| record.deadline <= Instant::now())
            .unwrap_or(false)
    }

    /// Deletes `key` from both maps iff its record is (still) expired.
    /// The deadline is re-checked under the write locks because a racing
    /// task may have already evicted or re-expired the key.
    fn evict_if_expired(&self, key: &Bytes) -> bool {
        let mut keys = self.keys.write().unwrap();
        let mut expirations = self.expirations.write().unwrap();
        match expirations.get(key) {
            Some(record) if record.deadline <= Instant::now() => {
                expirations.remove(key);
                keys.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Deletes key and record outright. Returns whether the key was
    /// logically present in the keyspace.
    fn purge(&self, key: &Bytes) -> bool {
        let mut keys = self.keys.write().unwrap();
        let mut expirations = self.expirations.write().unwrap();
        let live = keys.remove(key).is_some()
            && expirations
                .get(key)
                .map_or(true, |r| r.deadline > Instant::now());
        expirations.remove(key);
        live
    }

    /// Evaluates `option` against the current record and conditionally
    /// writes, all under one continuous exclusive hold of the expiration
    /// lock; a racing expire cannot interleave between the comparison
    /// and the write.
    fn install_expiration(
        &self,
        key: &Bytes,
        deadline: Instant,
        set_ttl: Duration,
        option: ExpireOption,
    ) -> bool {
        let mut expirations = self.expirations.write().unwrap();
        let now = Instant::now();
        if expirations
            .get(key)
            .is_some_and(|record| record.deadline <= now)
        {
            // A stale record no longer counts as volatile.
            expirations.remove(key);
        }
        let current = expirations.get(key).map(|record| record.set_ttl);
        let install = match option {
            ExpireOption::Always => true,
            ExpireOption::Nx => current.is_none(),
            ExpireOption::Xx => current.is_some(),
            ExpireOption::Gt => current.is_some_and(|cur| set_ttl > cur),
            ExpireOption::Lt => current.is_some_and(|cur| set_ttl < cur),
        };
        if install {
            expirations.insert(key.clone(), ExpireRecord { deadline, set_ttl });
        }
        install
    }
}
