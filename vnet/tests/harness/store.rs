//! In-process store and a Unix socket server for it, so the client can be
//! exercised end to end.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vnet::store::wire::{Call, ReplyValue, Request, Response};
use vnet::store::{Result, Store, StoreError};

#[derive(Debug)]
enum Value {
    String(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
}

/// Thread-safe in-memory store. Blocking pops wait on a condition variable
/// signalled by pushes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
    pushed: Condvar,
}

/// Resolve a redis-style inclusive range over `len` elements.
pub fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

pub fn resolve_index(len: usize, index: i64) -> Option<usize> {
    let i = if index < 0 { len as i64 + index } else { index };
    (0..len as i64).contains(&i).then_some(i as usize)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Value>>> {
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }

    fn hash<'a>(
        data: &'a mut HashMap<String, Value>,
        key: &str,
    ) -> Result<&'a mut BTreeMap<String, Vec<u8>>> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list<'a>(
        data: &'a mut HashMap<String, Value>,
        key: &str,
    ) -> Result<&'a mut VecDeque<Vec<u8>>> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(l) => Ok(l),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn read_hash<'a>(
        data: &'a HashMap<String, Value>,
        key: &str,
    ) -> Result<Option<&'a BTreeMap<String, Vec<u8>>>> {
        match data.get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn read_list<'a>(
        data: &'a HashMap<String, Value>,
        key: &str,
    ) -> Result<Option<&'a VecDeque<Vec<u8>>>> {
        match data.get(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn push(&self, key: &str, values: &[Vec<u8>], front: bool) -> Result<usize> {
        let mut data = self.lock()?;
        let list = Self::list(&mut data, key)?;
        for v in values {
            if front {
                list.push_front(v.clone());
            } else {
                list.push_back(v.clone());
            }
        }
        let len = list.len();
        drop(data);
        self.pushed.notify_all();
        Ok(len)
    }

    fn try_pop(
        data: &mut HashMap<String, Value>,
        keys: &[&str],
        front: bool,
    ) -> Result<Option<(String, Vec<u8>)>> {
        for key in keys {
            let Some(Value::List(list)) = data.get_mut(*key) else {
                if data.contains_key(*key) {
                    return Err(StoreError::WrongType(key.to_string()));
                }
                continue;
            };
            let popped = if front {
                list.pop_front()
            } else {
                list.pop_back()
            };
            if let Some(v) = popped {
                if list.is_empty() {
                    data.remove(*key);
                }
                return Ok(Some((key.to_string(), v)));
            }
        }
        Ok(None)
    }

    fn bpop(
        &self,
        keys: &[&str],
        timeout: Duration,
        front: bool,
    ) -> Result<Option<(String, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        let mut data = self.lock()?;
        loop {
            if let Some(popped) = Self::try_pop(&mut data, keys, front)? {
                return Ok(Some(popped));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .pushed
                .wait_timeout(data, deadline - now)
                .map_err(|_| StoreError::Poisoned)?;
            data = guard;
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.lock()?.get(key) {
            None => Ok(None),
            Some(Value::String(v)) => Ok(Some(v.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock()?
            .insert(key.to_string(), Value::String(value.to_vec()));
        Ok(())
    }

    fn del(&self, keys: &[&str]) -> Result<usize> {
        let mut data = self.lock()?;
        Ok(keys.iter().filter(|k| data.remove(**k).is_some()).count())
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<usize> {
        let mut data = self.lock()?;
        let hash = Self::hash(&mut data, key)?;
        Ok(match hash.insert(field.to_string(), value.to_vec()) {
            Some(_) => 0,
            None => 1,
        })
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let data = self.lock()?;
        Ok(Self::read_hash(&data, key)?.and_then(|h| h.get(field).cloned()))
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize> {
        let mut data = self.lock()?;
        if Self::read_hash(&data, key)?.is_none() {
            return Ok(0);
        }
        let hash = Self::hash(&mut data, key)?;
        let removed = fields.iter().filter(|f| hash.remove(**f).is_some()).count();
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(removed)
    }

    fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let data = self.lock()?;
        Ok(Self::read_hash(&data, key)?.is_some_and(|h| h.contains_key(field)))
    }

    fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.lock()?;
        Ok(Self::read_hash(&data, key)?
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let data = self.lock()?;
        Ok(Self::read_hash(&data, key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        self.push(key, values, true)
    }

    fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        self.push(key, values, false)
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let data = self.lock()?;
        let Some(list) = Self::read_list(&data, key)? else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((a, b)) => list.range(a..=b).cloned().collect(),
            None => Vec::new(),
        })
    }

    fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>> {
        let data = self.lock()?;
        Ok(Self::read_list(&data, key)?
            .and_then(|l| resolve_index(l.len(), index).and_then(|i| l.get(i).cloned())))
    }

    fn blpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>> {
        self.bpop(keys, timeout, true)
    }

    fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, Vec<u8>)>> {
        self.bpop(keys, timeout, false)
    }
}

fn execute<S: Store + ?Sized>(store: &S, call: Call) -> Result<ReplyValue> {
    fn refs(v: &[String]) -> Vec<&str> {
        v.iter().map(String::as_str).collect()
    }

    Ok(match call {
        Call::Get { key } => ReplyValue::Value(store.get(&key)?),
        Call::Set { key, value } => {
            store.set(&key, &value)?;
            ReplyValue::Unit
        }
        Call::Del { keys } => ReplyValue::Count(store.del(&refs(&keys))?),
        Call::Hset { key, field, value } => ReplyValue::Count(store.hset(&key, &field, &value)?),
        Call::Hget { key, field } => ReplyValue::Value(store.hget(&key, &field)?),
        Call::Hdel { key, fields } => ReplyValue::Count(store.hdel(&key, &refs(&fields))?),
        Call::Hexists { key, field } => ReplyValue::Bool(store.hexists(&key, &field)?),
        Call::Hgetall { key } => ReplyValue::Pairs(store.hgetall(&key)?),
        Call::Hkeys { key } => ReplyValue::Keys(store.hkeys(&key)?),
        Call::Lpush { key, values } => ReplyValue::Count(store.lpush(&key, &values)?),
        Call::Rpush { key, values } => ReplyValue::Count(store.rpush(&key, &values)?),
        Call::Lrange { key, start, stop } => ReplyValue::List(store.lrange(&key, start, stop)?),
        Call::Lindex { key, index } => ReplyValue::Value(store.lindex(&key, index)?),
        Call::Blpop { keys, timeout_ms } => {
            ReplyValue::Popped(store.blpop(&refs(&keys), Duration::from_millis(timeout_ms))?)
        }
        Call::Brpop { keys, timeout_ms } => {
            ReplyValue::Popped(store.brpop(&refs(&keys), Duration::from_millis(timeout_ms))?)
        }
    })
}

/// Answer requests on one connection until the peer closes it.
pub fn serve_connection<S: Store + ?Sized>(
    store: &S,
    service: &str,
    stream: UnixStream,
) -> io::Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response: Response = match serde_json::from_str::<Request>(&line) {
            Ok(req) if req.service == service => {
                execute(store, req.call).map_err(|e| e.to_string())
            }
            Ok(req) => Err(format!("unknown service {:?}", req.service)),
            Err(e) => Err(format!("bad request: {e}")),
        };
        let mut out = serde_json::to_vec(&response).map_err(io::Error::other)?;
        out.push(b'\n');
        writer.write_all(&out)?;
    }
    Ok(())
}

/// Serve `store` on `listener`, one thread per connection.
pub fn serve<S: Store + 'static>(listener: UnixListener, service: String, store: Arc<S>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Store listener failed");
                return;
            }
        };
        let store = Arc::clone(&store);
        let service = service.clone();
        thread::spawn(move || {
            if let Err(e) = serve_connection(&*store, &service, stream) {
                debug!(error = %e, "Store connection ended with error");
            }
        });
    }
}
