//! Request/reply messaging with running agents.
//!
//! Every agent reads requests from its inbox stream and appends replies to
//! its reply stream. The bridge appends one request and then polls the
//! reply stream with short blocking reads until a reply newer than the
//! request shows up or the caller's deadline passes.
//!
//! The reply stream is shared by all callers of an agent, so concurrent
//! requests to the same agent cannot be told apart: the first reply that
//! arrives after a request was sent wins. Callers needing strict pairing
//! must serialize their requests per agent.

mod memory;
mod redis_store;

pub use memory::MemoryStreamStore;
pub use redis_store::RedisStreamStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::naming;

/// Id that sorts before every real stream entry.
pub const STREAM_START: &str = "0-0";

pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_SENDER: &str = "sender";

/// One stream entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Stream store errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stream store returned malformed data: {0}")]
    Malformed(String),

    #[error("stream store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only per-key streams.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append an entry and return its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError>;

    /// Id of the newest entry, if any.
    async fn last_id(&self, stream: &str) -> Result<Option<String>, StreamError>;

    /// Wait up to `block` for the first entry with an id greater than
    /// `after`.
    async fn read_after(
        &self,
        stream: &str,
        after: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StreamError>;

    /// Up to `limit` newest entries, newest first. Nothing is consumed.
    async fn recent(&self, stream: &str, limit: usize) -> Result<Vec<StreamEntry>, StreamError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StreamError>;
}

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StreamError),
}

/// Horizon used when the caller's timeout is too large to be added to the
/// clock.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Reply polling parameters.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Longest single blocking read.
    pub block: Duration,

    /// Pause between empty reads.
    pub pause: Duration,

    /// Deadline used when the caller doesn't give one.
    pub default_timeout: Duration,

    /// Entries returned by [`MessageBridge::recent_replies`] when the
    /// caller's limit is missing or not positive.
    pub default_limit: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            block: Duration::from_secs(1),
            pause: Duration::from_millis(500),
            default_timeout: Duration::from_secs(30),
            default_limit: 10,
        }
    }
}

/// Sends requests to agents and collects their replies.
#[derive(Clone)]
pub struct MessageBridge {
    store: Arc<dyn StreamStore>,
    poll: PollConfig,
}

impl MessageBridge {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self {
            store,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// Append `payload` to the agent's inbox and wait for the next reply.
    ///
    /// Only replies appended after the request are considered. The deadline
    /// is checked between reads, so the call can overrun `timeout` by at
    /// most one blocking read plus one pause.
    pub async fn send_and_wait(
        &self,
        agent: &str,
        payload: &str,
        sender: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<StreamEntry, BridgeError> {
        let timeout = timeout.unwrap_or(self.poll.default_timeout);
        let inbox = naming::inbox_stream(agent);
        let reply_stream = naming::reply_stream(agent);

        let cursor = self
            .store
            .last_id(&reply_stream)
            .await?
            .unwrap_or_else(|| STREAM_START.to_string());

        let mut fields = vec![(FIELD_PAYLOAD.to_string(), payload.to_string())];
        if let Some(sender) = sender.filter(|s| !s.is_empty()) {
            fields.push((FIELD_SENDER.to_string(), sender.to_string()));
        }
        let request_id = self.store.append(&inbox, &fields).await?;
        info!(agent = %agent, message_id = %request_id, "Message sent to agent");

        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + MAX_WAIT);
        loop {
            if Instant::now() >= deadline {
                debug!(agent = %agent, message_id = %request_id, "Timed out waiting for reply");
                return Err(BridgeError::Timeout(timeout));
            }

            let block = self.poll.block.min(deadline.saturating_duration_since(Instant::now()));
            if let Some(reply) = self.store.read_after(&reply_stream, &cursor, block).await? {
                debug!(agent = %agent, reply_id = %reply.id, "Received reply");
                return Ok(reply);
            }

            tokio::time::sleep(self.poll.pause).await;
        }
    }

    /// Newest replies from the agent, newest first.
    pub async fn recent_replies(
        &self,
        agent: &str,
        limit: Option<i64>,
    ) -> Result<Vec<StreamEntry>, BridgeError> {
        let limit = limit
            .filter(|l| *l > 0)
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(self.poll.default_limit);
        Ok(self.store.recent(&naming::reply_stream(agent), limit).await?)
    }
}

/// Split a stream id into its time and sequence parts.
pub fn parse_entry_id(id: &str) -> Option<(u64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}
