//! Wire protocol for the per-peer request channel.
//!
//! One bidirectional stream per connection carries length-prefixed JSON
//! frames in both directions. Requests are correlated to responses by id;
//! pushes are fire-and-forget. Log replication rides the same channel:
//! `LOG_SUBSCRIBE` primes the remote side to push `LOG_ENTRIES` frames for
//! every append to its index log.
//!
//! ```text
//! A                                   B
//! |--- req LOCAL_INDEX_KEY_REQUEST -->|
//! |<-- res {status, data: key} -------|
//! |--- req LOG_SUBSCRIBE {key,from} ->|
//! |<-- res {status, data: version} ---|
//! |<-- push LOG_ENTRIES {entries} ----|   (and on every append)
//! |                                   |
//! |--- req FILE_REQUEST {path} ------>|
//! |<-- res {type,key,id} -------------|
//! |       ... blob transfer ...       |
//! |--- req FILE_RELEASE {path} ------>|
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::journal::LogEntry;

/// ALPN for the request/replication channel.
pub const SYNC_ALPN: &[u8] = b"/peerdrive/sync/1";

/// Hard cap on a single frame.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

// Protocol method identifiers
pub const LOCAL_INDEX_KEY_REQUEST: &str = "LOCAL_INDEX_KEY_REQUEST";
pub const FILE_REQUEST: &str = "FILE_REQUEST";
pub const FILE_RELEASE: &str = "FILE_RELEASE";
pub const MESSAGE: &str = "MESSAGE";
pub const LOG_SUBSCRIBE: &str = "LOG_SUBSCRIBE";

// Push kinds
pub const LOG_ENTRIES: &str = "LOG_ENTRIES";

/// Status of a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    UnknownMessageType,
}

/// The `{status, data}` envelope every response carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn success(data: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: Value::String(message.into()),
        }
    }

    pub fn unknown_message_type() -> Self {
        Self {
            status: ResponseStatus::UnknownMessageType,
            data: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// One frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        payload: Value,
    },
    Response {
        id: u64,
        status: ResponseStatus,
        data: Value,
    },
    Push {
        kind: String,
        payload: Value,
    },
}

/// Payload of FILE_REQUEST and FILE_RELEASE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    pub path: String,
}

/// Payload of MESSAGE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Payload of LOG_SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSubscribePayload {
    /// Hex log key being subscribed
    pub key: String,
    /// First sequence number the subscriber is missing
    pub from: u64,
}

/// Payload of a LOG_ENTRIES push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntriesPayload {
    pub key: String,
    /// Sequence number of the first entry
    pub from: u64,
    pub entries: Vec<LogEntry>,
}
