//! Stream store backed by Valkey/Redis streams.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, ConnectionInfo, Value};
use tokio::sync::OnceCell;
use tracing::info;

use super::{StreamEntry, StreamError, StreamStore};

/// Idle connections kept for blocking reads.
const MAX_IDLE_READERS: usize = 8;

/// Streams on a Valkey/Redis server.
///
/// Non-blocking commands share one reconnecting connection. Blocking reads
/// each take a dedicated connection, since a blocked `XREAD` holds up
/// everything queued behind it on the same connection. Nothing connects
/// until the first command, so an outage at startup only fails requests
/// until the server comes back.
pub struct RedisStreamStore {
    client: redis::Client,
    shared: OnceCell<ConnectionManager>,
    readers: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStreamStore {
    /// Create a store for the given server. Fails only on invalid settings.
    pub fn new(info: ConnectionInfo) -> Result<Self, StreamError> {
        let client = redis::Client::open(info)?;
        Ok(Self {
            client,
            shared: OnceCell::new(),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// The shared connection, opened on first use. A failed attempt is
    /// retried by the next command.
    async fn shared(&self) -> Result<ConnectionManager, StreamError> {
        let conn = self
            .shared
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!(addr = ?self.client.get_connection_info().addr, "Connected to stream store");
                Ok::<_, redis::RedisError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn take_reader(&self) -> Result<MultiplexedConnection, StreamError> {
        let idle = self.readers.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn return_reader(&self, conn: MultiplexedConnection) {
        let mut readers = self.readers.lock();
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
    }
}

fn to_entry(id: StreamId) -> Result<StreamEntry, StreamError> {
    let fields = decode_fields(id.map)?;
    Ok(StreamEntry { id: id.id, fields })
}

fn decode_fields(
    map: HashMap<String, Value>,
) -> Result<std::collections::BTreeMap<String, String>, StreamError> {
    map.into_iter()
        .map(|(k, v)| {
            let value: String = redis::from_redis_value(&v)
                .map_err(|e| StreamError::Malformed(format!("field '{k}': {e}")))?;
            Ok((k, value))
        })
        .collect()
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let mut conn = self.shared().await?;
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn last_id(&self, stream: &str) -> Result<Option<String>, StreamError> {
        let mut conn = self.shared().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", 1).await?;
        Ok(reply.ids.into_iter().next().map(|id| id.id))
    }

    async fn read_after(
        &self,
        stream: &str,
        after: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StreamError> {
        let mut options = StreamReadOptions::default().count(1);
        // BLOCK 0 means "forever"; a zero budget is a plain read.
        let block_ms = block.as_millis();
        if block_ms > 0 {
            options = options.block(usize::try_from(block_ms).unwrap_or(usize::MAX));
        }

        let mut conn = self.take_reader().await?;
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[after], &options).await?;
        self.return_reader(conn);

        let Some(reply) = reply else {
            return Ok(None);
        };
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .next()
            .map(to_entry)
            .transpose()
    }

    async fn recent(&self, stream: &str, limit: usize) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.shared().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", limit).await?;
        reply.ids.into_iter().map(to_entry).collect()
    }

    async fn ping(&self) -> Result<(), StreamError> {
        let mut conn = self.shared().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_fields() {
        let map = HashMap::from([
            ("result".to_string(), Value::BulkString(b"ok".to_vec())),
            ("payload".to_string(), Value::BulkString(br#"{"a":1}"#.to_vec())),
        ]);
        let fields = decode_fields(map).unwrap();
        assert_eq!(fields["result"], "ok");
        assert_eq!(fields["payload"], r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let info: ConnectionInfo = "redis://127.0.0.1:1/".parse().unwrap();
        let store = RedisStreamStore::new(info).unwrap();
        assert!(store.shared.get().is_none());
        assert!(store.readers.lock().is_empty());
    }
}
