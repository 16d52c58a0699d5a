//! In-process stream store for tests and local development.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{parse_entry_id, StreamEntry, StreamError, StreamStore};

#[derive(Default)]
struct Streams {
    entries: BTreeMap<String, Vec<StreamEntry>>,
    next_seq: u64,
}

/// Streams held in memory. Ids are `<n>-0` with `n` increasing across all
/// streams.
#[derive(Default)]
pub struct MemoryStreamStore {
    streams: Mutex<Streams>,
    appended: Notify,
    unavailable: Mutex<bool>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping` fail, as if the store had gone away.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    fn first_after(&self, stream: &str, after: (u64, u64)) -> Option<StreamEntry> {
        let streams = self.streams.lock();
        streams
            .entries
            .get(stream)?
            .iter()
            .find(|e| parse_entry_id(&e.id).is_some_and(|id| id > after))
            .cloned()
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let id = {
            let mut streams = self.streams.lock();
            streams.next_seq += 1;
            let id = format!("{}-0", streams.next_seq);
            streams
                .entries
                .entry(stream.to_string())
                .or_default()
                .push(StreamEntry {
                    id: id.clone(),
                    fields: fields.iter().cloned().collect(),
                });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn last_id(&self, stream: &str) -> Result<Option<String>, StreamError> {
        let streams = self.streams.lock();
        Ok(streams
            .entries
            .get(stream)
            .and_then(|entries| entries.last())
            .map(|e| e.id.clone()))
    }

    async fn read_after(
        &self,
        stream: &str,
        after: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StreamError> {
        let after = parse_entry_id(after)
            .ok_or_else(|| StreamError::Malformed(format!("invalid stream id '{after}'")))?;
        let deadline = Instant::now() + block;

        loop {
            // Register before checking so an append in between isn't missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.first_after(stream, after) {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn recent(&self, stream: &str, limit: usize) -> Result<Vec<StreamEntry>, StreamError> {
        let streams = self.streams.lock();
        Ok(streams
            .entries
            .get(stream)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StreamError> {
        if *self.unavailable.lock() {
            return Err(StreamError::Unavailable("[MOCK] configured to fail".to_string()));
        }
        Ok(())
    }
}
