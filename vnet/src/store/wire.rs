//! Wire format of the store RPC.
//!
//! Each request is one JSON line carrying a [`Request`]; the reply is one
//! JSON line carrying a [`Response`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Call {
    Get { key: String },
    Set { key: String, value: Vec<u8> },
    Del { keys: Vec<String> },
    Hset { key: String, field: String, value: Vec<u8> },
    Hget { key: String, field: String },
    Hdel { key: String, fields: Vec<String> },
    Hexists { key: String, field: String },
    Hgetall { key: String },
    Hkeys { key: String },
    Lpush { key: String, values: Vec<Vec<u8>> },
    Rpush { key: String, values: Vec<Vec<u8>> },
    Lrange { key: String, start: i64, stop: i64 },
    Lindex { key: String, index: i64 },
    Blpop { keys: Vec<String>, timeout_ms: u64 },
    Brpop { keys: Vec<String>, timeout_ms: u64 },
}

/// A call addressed to a named store service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub service: String,
    pub call: Call,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyValue {
    Unit,
    Value(Option<Vec<u8>>),
    Count(usize),
    Bool(bool),
    Pairs(Vec<(String, Vec<u8>)>),
    Keys(Vec<String>),
    List(Vec<Vec<u8>>),
    Popped(Option<(String, Vec<u8>)>),
}

/// Server errors travel as their display text.
pub type Response = std::result::Result<ReplyValue, String>;
