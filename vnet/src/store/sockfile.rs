//! Store RPC over a Unix socket.
//!
//! One JSON request line and one JSON response line per connection. The
//! request names the service it is addressed to so that several stores can
//! share a socket directory without mixing calls up. The server side lives
//! with whatever process owns the store; only the client is here.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::trace;

use super::wire::{Call, ReplyValue, Request, Response};
use super::{Result, Store, StoreError};

fn protocol(e: impl std::fmt::Display) -> StoreError {
    StoreError::Protocol(e.to_string())
}

fn unexpected(reply: ReplyValue) -> StoreError {
    StoreError::Protocol(format!("unexpected reply {reply:?}"))
}

fn owned(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Client for a store served on a Unix socket.
#[derive(Debug, Clone)]
pub struct SockfileClient {
    path: PathBuf,
    service: String,
}

impl SockfileClient {
    pub fn new(path: impl AsRef<Path>, service: impl Into<String>) -> Self {
        SockfileClient {
            path: path.as_ref().to_path_buf(),
            service: service.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn call(&self, call: Call) -> Result<ReplyValue> {
        trace!(path = %self.path.display(), ?call, "Store call");
        let stream = UnixStream::connect(&self.path)?;
        let request = Request {
            service: self.service.clone(),
            call,
        };
        let mut line = serde_json::to_vec(&request).map_err(protocol)?;
        line.push(b'\n');
        (&stream).write_all(&line)?;

        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply)?;
        if reply.is_empty() {
            return Err(StoreError::Protocol("connection closed without reply".into()));
        }
        let response: Response = serde_json::from_str(&reply).map_err(protocol)?;
        response.map_err(StoreError::Remote)
    }
}

impl Store for SockfileClient {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.call(Call::Get { key: key.into() })? {
            ReplyValue::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.call(Call::Set {
            key: key.into(),
            value: value.to_vec(),
        })? {
            ReplyValue::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn del(&self, keys: &[&str]) -> Result<usize> {
        match self.call(Call::Del { keys: owned(keys) })? {
            ReplyValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<usize> {
        match self.call(Call::Hset {
            key: key.into(),
            field: field.into(),
            value: value.to_vec(),
        })? {
            ReplyValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        match self.call(Call::Hget {
            key: key.into(),
            field: field.into(),
        })? {
            ReplyValue::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize> {
        match self.call(Call::Hdel {
            key: key.into(),
            fields: owned(fields),
        })? {
            ReplyValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        match self.call(Call::Hexists {
            key: key.into(),
            field: field.into(),
        })? {
            ReplyValue::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        match self.call(Call::Hgetall { key: key.into() })? {
            ReplyValue::Pairs(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }

    fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        match self.call(Call::Hkeys { key: key.into() })? {
            ReplyValue::Keys(k) => Ok(k),
            other => Err(unexpected(other)),
        }
    }

    fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        match self.call(Call::Lpush {
            key: key.into(),
            values: values.to_vec(),
        })? {
            ReplyValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        match self.call(Call::Rpush {
            key: key.into(),
            values: values.to_vec(),
        })? {
            ReplyValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        match self.call(Call::Lrange {
            key: key.into(),
            start,
            stop,
        })? {
            ReplyValue::List(l) => Ok(l),
            other => Err(unexpected(other)),
        }
    }

    fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>> {
        match self.call(Call::Lindex {
            key: key.into(),
            index,
        })? {
            ReplyValue::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    fn blpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>> {
        match self.call(Call::Blpop {
            keys: owned(keys),
            timeout_ms: millis(timeout),
        })? {
            ReplyValue::Popped(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }

    fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>> {
        match self.call(Call::Brpop {
            keys: owned(keys),
            timeout_ms: millis(timeout),
        })? {
            ReplyValue::Popped(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }
}
