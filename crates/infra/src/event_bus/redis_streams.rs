//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! - **Stream key**: one stream per queue (e.g. `dmq:jobs:events`)
//! - **Consumer groups**: one per subscriber; the group remembers the last
//!   delivered entry so a restarted subscriber resumes where it left off.
//!   Named subscribers (`subscribe_as`) get the group `<stream>:<name>`;
//!   anonymous ones (`subscribe`) get a throwaway group that is destroyed
//!   when the subscription is dropped
//! - **Pending entries**: a delivery stays pending until the subscriber acks
//!   it, and is handed out again when the consumer restarts
//! - **Dead letters**: entries whose payload cannot be decoded are copied to
//!   `<stream>:dlq` and acknowledged

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use redis::streams::{StreamId, StreamReadReply};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument, warn};

use dmq_events::{Delivery, EventBus, ResumeFrom, Subscription};

use crate::config::DmqConfig;

const DEFAULT_STREAM_KEY: &str = "dmq:events";

/// Entries fetched per XREADGROUP call.
const READ_COUNT: usize = 64;

/// How long XREADGROUP blocks waiting for new entries.
const DEFAULT_BLOCK: Duration = Duration::from_millis(250);

/// Pause before reconnecting after a transport error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub struct RedisStreamsEventBus<M> {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    block: Duration,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for RedisStreamsEventBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            stream_key: self.stream_key.clone(),
            dlq_key: self.dlq_key.clone(),
            block: self.block,
            _message: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for RedisStreamsEventBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("stream_key", &self.stream_key)
            .field("dlq_key", &self.dlq_key)
            .finish()
    }
}

impl<M> RedisStreamsEventBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a new Redis Streams event bus.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - Redis stream key (default: "dmq:events")
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let stream_key = stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string());

        Ok(Self {
            client: Arc::new(client),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            block: DEFAULT_BLOCK,
            _message: PhantomData,
        })
    }

    /// Bus on the configured Redis, with one stream per queue.
    pub fn from_config(config: &DmqConfig) -> Result<Self, RedisStreamsError> {
        let redis_url = config.redis_url.as_deref().ok_or_else(|| {
            RedisStreamsError::Connection(format!("{} is not set", crate::config::ENV_REDIS_URL))
        })?;
        Self::new(redis_url, Some(queue_stream_key(&config.queue_name)))
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// A new group starts at the beginning of the stream for
    /// [`ResumeFrom::Earliest`] and at its current end for
    /// [`ResumeFrom::LastSeen`]. An existing group keeps its position.
    pub fn ensure_consumer_group(
        &self,
        group_name: &str,
        resume_from: ResumeFrom,
    ) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg(group_start_id(resume_from))
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Subscribe through a named consumer group.
    ///
    /// Use a stable `group_name` for subscribers that must survive restarts;
    /// entries the consumer received but never acked are delivered again
    /// before anything new.
    pub fn subscribe_with_group(
        &self,
        group_name: &str,
        consumer_name: &str,
        resume_from: ResumeFrom,
    ) -> Subscription<M> {
        self.spawn_reader(group_name, consumer_name, resume_from, false)
    }

    fn spawn_reader(
        &self,
        group_name: &str,
        consumer_name: &str,
        resume_from: ResumeFrom,
        ephemeral: bool,
    ) -> Subscription<M> {
        if let Err(e) = self.ensure_consumer_group(group_name, resume_from) {
            error!(group = group_name, error = %e, "failed to create consumer group");
        }

        let (tx, rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        let reader = StreamReader {
            bus: self.clone(),
            group: group_name.to_string(),
            consumer: consumer_name.to_string(),
            ephemeral,
        };

        thread::Builder::new()
            .name(format!("redis-stream-{group_name}"))
            .spawn(move || reader.run(tx, ack_rx))
            .expect("failed to spawn redis stream reader thread");

        Subscription::with_acks(rx, ack_tx)
    }

    #[instrument(skip(self, message), fields(stream_key = %self.stream_key), err)]
    fn publish_sync(&self, message: &M) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }
}

impl<M> EventBus<M> for RedisStreamsEventBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisStreamsError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.publish_sync(&message)
    }

    /// Each call creates its own consumer group, so every subscription sees
    /// every entry. The group is destroyed once the subscription is dropped.
    fn subscribe(&self, resume_from: ResumeFrom) -> Subscription<M> {
        let group = format!("{}:anon-{}", self.stream_key, uuid::Uuid::now_v7());
        self.spawn_reader(&group, "consumer-1", resume_from, true)
    }

    fn subscribe_as(&self, subscriber: &str, resume_from: ResumeFrom) -> Subscription<M> {
        let group = durable_group_name(&self.stream_key, subscriber);
        self.subscribe_with_group(&group, subscriber, resume_from)
    }
}

/// Stream that carries the lifecycle events of `queue_name`.
pub fn queue_stream_key(queue_name: &str) -> String {
    format!("dmq:{queue_name}:events")
}

/// Consumer group of a named subscriber. Same name, same group.
pub fn durable_group_name(stream_key: &str, subscriber: &str) -> String {
    format!("{stream_key}:{subscriber}")
}

fn group_start_id(resume_from: ResumeFrom) -> &'static str {
    match resume_from {
        ResumeFrom::Earliest => "0",
        ResumeFrom::LastSeen => "$",
    }
}

fn decode_entry<M: DeserializeOwned>(entry: &StreamId) -> Result<M, RedisStreamsError> {
    let payload: String = entry
        .get("payload")
        .ok_or_else(|| RedisStreamsError::Deserialization("Missing payload field".to_string()))?;
    serde_json::from_str(&payload).map_err(|e| RedisStreamsError::Deserialization(e.to_string()))
}

/// Background reader feeding one subscription.
struct StreamReader<M> {
    bus: RedisStreamsEventBus<M>,
    group: String,
    consumer: String,
    /// Destroy the group when the subscription goes away.
    ephemeral: bool,
}

enum Flow {
    Continue,
    Closed,
}

impl<M> StreamReader<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    fn run(self, tx: Sender<Delivery<M>>, acks: Receiver<String>) {
        loop {
            match self.session(&tx, &acks) {
                Ok(()) => {
                    if self.ephemeral {
                        self.destroy_group();
                    }
                    return;
                }
                Err(e) => {
                    error!(group = %self.group, error = %e, "stream reader failed; reconnecting");
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }

    /// One connected session: replay this consumer's pending entries, then
    /// follow new ones. Returns `Ok` once the subscription is dropped.
    fn session(
        &self,
        tx: &Sender<Delivery<M>>,
        acks: &Receiver<String>,
    ) -> Result<(), RedisStreamsError> {
        let mut conn = self.bus.connection()?;

        let mut cursor = "0".to_string();
        loop {
            let entries = self.read(&mut conn, &cursor, None)?;
            let Some(last) = entries.last() else {
                break;
            };
            cursor = last.id.clone();
            if let Flow::Closed = self.forward(&mut conn, entries, tx)? {
                return Ok(());
            }
        }

        loop {
            if let Flow::Closed = self.flush_acks(&mut conn, acks)? {
                return Ok(());
            }
            let entries = self.read(&mut conn, ">", Some(self.bus.block))?;
            if let Flow::Closed = self.forward(&mut conn, entries, tx)? {
                return Ok(());
            }
        }
    }

    fn destroy_group(&self) {
        let destroyed: Result<u64, RedisStreamsError> = self.bus.connection().and_then(|mut conn| {
            redis::cmd("XGROUP")
                .arg("DESTROY")
                .arg(&self.bus.stream_key)
                .arg(&self.group)
                .query(&mut conn)
                .map_err(|e| RedisStreamsError::Command(format!("XGROUP DESTROY failed: {e}")))
        });
        match destroyed {
            Ok(_) => debug!(group = %self.group, "consumer group destroyed"),
            Err(e) => warn!(group = %self.group, error = %e, "consumer group left behind"),
        }
    }

    fn read(
        &self,
        conn: &mut redis::Connection,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamId>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.bus.stream_key).arg(id);

        let reply: Option<StreamReadReply> = cmd
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    fn forward(
        &self,
        conn: &mut redis::Connection,
        entries: Vec<StreamId>,
        tx: &Sender<Delivery<M>>,
    ) -> Result<Flow, RedisStreamsError> {
        for entry in entries {
            match decode_entry::<M>(&entry) {
                Ok(message) => {
                    let delivery = Delivery {
                        id: entry.id,
                        message,
                    };
                    if tx.send(delivery).is_err() {
                        return Ok(Flow::Closed);
                    }
                }
                Err(e) => {
                    warn!(group = %self.group, entry_id = %entry.id, error = %e, "undecodable stream entry");
                    self.dead_letter(conn, &entry)?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn flush_acks(
        &self,
        conn: &mut redis::Connection,
        acks: &Receiver<String>,
    ) -> Result<Flow, RedisStreamsError> {
        let mut ids = Vec::new();
        let flow = loop {
            match acks.try_recv() {
                Ok(id) => ids.push(id),
                Err(TryRecvError::Empty) => break Flow::Continue,
                Err(TryRecvError::Disconnected) => break Flow::Closed,
            }
        };
        self.acknowledge(conn, &ids)?;
        Ok(flow)
    }

    fn acknowledge(
        &self,
        conn: &mut redis::Connection,
        ids: &[String],
    ) -> Result<(), RedisStreamsError> {
        if ids.is_empty() {
            return Ok(());
        }

        let acked: u64 = redis::cmd("XACK")
            .arg(&self.bus.stream_key)
            .arg(&self.group)
            .arg(ids)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        debug!(group = %self.group, acked, "acknowledged stream entries");

        Ok(())
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        entry: &StreamId,
    ) -> Result<(), RedisStreamsError> {
        let payload: Option<String> = entry.get("payload");

        let _: String = redis::cmd("XADD")
            .arg(&self.bus.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(&entry.id)
            .arg("group")
            .arg(&self.group)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload.unwrap_or_default())
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {e}")))?;

        self.acknowledge(conn, std::slice::from_ref(&entry.id))
    }
}
