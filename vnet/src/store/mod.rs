//! Configuration/state store.
//!
//! [`Store`] is the key/value, hash and list interface the dataplane uses to
//! publish and read state. [`Rpc`] wraps any store and validates writes
//! before they are sent; [`SockfileClient`] reaches a store served over a
//! Unix socket. The store itself is run by another process.

mod sockfile;
pub mod wire;

pub use sockfile::SockfileClient;

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("hset {field}: invalid speed \"auto\" for a lane other than the first")]
    InvalidSpeed { field: String },

    #[error("invalid field {field:?}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("WRONGTYPE key {0:?} holds the wrong kind of value")]
    WrongType(String),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("store server error: {0}")]
    Remote(String),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key/value, hash and list operations.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete keys, returning how many existed.
    fn del(&self, keys: &[&str]) -> Result<usize>;

    /// Set a hash field, returning 1 if the field is new and 0 if it was
    /// overwritten.
    fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<usize>;

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Delete hash fields, returning how many existed.
    fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize>;

    fn hexists(&self, key: &str, field: &str) -> Result<bool>;

    /// All field/value pairs of a hash, ordered by field.
    fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn hkeys(&self, key: &str) -> Result<Vec<String>>;

    /// Push values to the head of a list, one at a time, returning the new
    /// length.
    fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize>;

    /// Push values to the tail of a list, returning the new length.
    fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize>;

    /// Elements `start..=stop`; negative indices count from the end.
    fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>>;

    /// Pop from the head of the first non-empty list among `keys`, waiting up
    /// to `timeout`. Returns the key popped from and the value.
    fn blpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>>;

    /// Like [`Store::blpop`] but pops from the tail.
    fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>>;
}

/// Check a hash write against the field naming rules.
///
/// Fields are named `<category>.<instance>.<attribute>` (the category may be
/// omitted). For a `speed` attribute on an instance of the form
/// `<name>-<n>-<index>`, lanes with an index above 1 cannot be set to
/// `auto`.
pub fn validate_hset(field: &str, value: &[u8]) -> Result<()> {
    let parts: Vec<&str> = field.split('.').collect();
    if parts.len() < 2 || parts.len() > 3 || parts[parts.len() - 1] != "speed" {
        return Ok(());
    }
    let instance: Vec<&str> = parts[parts.len() - 2].split('-').collect();
    let Some(index) = instance.get(2) else {
        return Ok(());
    };
    let index: u32 = index.parse().map_err(|_| StoreError::InvalidField {
        field: field.to_string(),
        reason: format!("lane index {index:?} is not a number"),
    })?;
    if index > 1 && value == b"auto" {
        return Err(StoreError::InvalidSpeed {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validating front of a store.
pub struct Rpc<S> {
    inner: S,
}

impl<S: Store> Rpc<S> {
    pub fn new(inner: S) -> Self {
        Rpc { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for Rpc<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.set(key, value)
    }

    fn del(&self, keys: &[&str]) -> Result<usize> {
        self.inner.del(keys)
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<usize> {
        validate_hset(field, value)?;
        self.inner.hset(key, field, value)
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.inner.hget(key, field)
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize> {
        self.inner.hdel(key, fields)
    }

    fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        self.inner.hexists(key, field)
    }

    fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.hgetall(key)
    }

    fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.inner.hkeys(key)
    }

    fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        self.inner.lpush(key, values)
    }

    fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        self.inner.rpush(key, values)
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.inner.lrange(key, start, stop)
    }

    fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>> {
        self.inner.lindex(key, index)
    }

    fn blpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>> {
        self.inner.blpop(keys, timeout)
    }

    fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>> {
        self.inner.brpop(keys, timeout)
    }
}
