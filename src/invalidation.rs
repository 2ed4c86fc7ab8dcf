//! Cross-instance invalidation
//!
//! Every remote write or delete publishes an [`InvalidationMessage`]. Each
//! instance's [`InvalidationListener`] evicts its local copy and records the
//! time of the invalidation in the [`InvalidationTracker`]. The coordinator
//! consults the tracker before backfilling a remote value into the local
//! store, so a slow read that started before another instance's update
//! cannot repopulate the local store with the old value.
//!
//! Delivery is at-most-once and unordered: a lost message only widens the
//! staleness window up to the local TTL, which never exceeds the remote TTL.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use moka::{future::Cache, ops::compute::Op};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::runtime::Builder;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::{error::Result, local::LocalStore};

/// Handler invoked for every invalidation received from the bus
pub type InvalidationHandler =
    Arc<dyn Fn(InvalidationMessage) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

/// Last known invalidation of a `(region, key)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRecord {
    pub region: String,
    pub key: String,
    pub invalidated_at: DateTime<Utc>,
}

/// Lifecycle of a `(region, key)` pair as seen by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Active,
    /// Invalidated and not yet re-armed by a successful backfill
    Invalidated,
}

/// Records when each `(region, key)` was last invalidated.
///
/// Records expire on their own after the configured TTL; they only need to
/// outlive the slowest in-flight remote read.
#[derive(Clone)]
pub struct InvalidationTracker {
    records: Cache<(String, String), DateTime<Utc>>,
}

impl InvalidationTracker {
    pub fn new(record_ttl: Duration) -> Self {
        Self {
            records: Cache::builder().time_to_live(record_ttl).build(),
        }
    }

    /// Record an invalidation. An older timestamp never replaces a newer one.
    pub async fn record(&self, region: &str, key: &str, at: DateTime<Utc>) {
        self.records
            .entry((region.to_owned(), key.to_owned()))
            .and_upsert_with(|existing| {
                let newest = match existing {
                    Some(entry) if *entry.value() > at => *entry.value(),
                    _ => at,
                };
                std::future::ready(newest)
            })
            .await;
    }

    pub async fn get(&self, region: &str, key: &str) -> Option<InvalidationRecord> {
        self.records
            .get(&(region.to_owned(), key.to_owned()))
            .await
            .map(|invalidated_at| InvalidationRecord {
                region: region.to_owned(),
                key: key.to_owned(),
                invalidated_at,
            })
    }

    /// Whether data read at `read_at` may predate an invalidation.
    ///
    /// An invalidation in the same instant as the read counts as newer.
    pub async fn is_stale(&self, region: &str, key: &str, read_at: DateTime<Utc>) -> bool {
        self.get(region, key)
            .await
            .is_some_and(|record| record.invalidated_at >= read_at)
    }

    pub async fn clear(&self, region: &str, key: &str) {
        self.records
            .invalidate(&(region.to_owned(), key.to_owned()))
            .await;
    }

    /// Drop the record only if it predates `read_at`, so an invalidation
    /// that raced with a backfill is kept.
    pub async fn clear_if_older(&self, region: &str, key: &str, read_at: DateTime<Utc>) {
        self.records
            .entry((region.to_owned(), key.to_owned()))
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) if *entry.value() < read_at => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
    }

    pub async fn state(&self, region: &str, key: &str) -> EntryState {
        if self.get(region, key).await.is_some() {
            EntryState::Invalidated
        } else {
            EntryState::Active
        }
    }
}

/// Payload broadcast to every instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub region: String,
    pub key: String,
    /// Id of the publishing instance
    pub origin: String,
    pub published_at: DateTime<Utc>,
}

impl InvalidationMessage {
    pub fn new(region: &str, key: &str, origin: &str) -> Self {
        Self {
            region: region.to_owned(),
            key: key.to_owned(),
            origin: origin.to_owned(),
            published_at: Utc::now(),
        }
    }
}

/// Fire-and-forget message bus for invalidations
#[async_trait]
pub trait InvalidationBus: Send + Sync + 'static {
    /// Publish to every subscriber. Failures are logged, never returned.
    async fn publish(&self, message: &InvalidationMessage);

    /// Register a handler for every subsequent message
    fn subscribe(&self, handler: InvalidationHandler);
}

async fn dispatch(handler: &InvalidationHandler, message: InvalidationMessage) {
    let region = message.region.clone();
    let key = message.key.clone();
    if AssertUnwindSafe(handler(message))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(
            "Invalidation handler panicked for region '{}' key '{}'",
            region, key
        );
    }
}

/// In-process bus over a broadcast channel.
///
/// Connects several cache instances living in the same process. A slow
/// subscriber that falls more than `capacity` messages behind loses them.
#[derive(Clone)]
pub struct LocalInvalidationBus {
    tx: broadcast::Sender<InvalidationMessage>,
}

impl LocalInvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalInvalidationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl InvalidationBus for LocalInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) {
        // No receivers is not an error: nobody holds a local copy
        let _ = self.tx.send(message.clone());
    }

    fn subscribe(&self, handler: InvalidationHandler) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("LocalInvalidationBus: subscribe called outside a tokio runtime; ignoring");
            return;
        };
        let mut rx = self.tx.subscribe();
        runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => dispatch(&handler, message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "LocalInvalidationBus: subscriber lagged, {} invalidations dropped",
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Background Redis pub/sub subscriber running on its own thread and runtime.
///
/// Handlers are registered through a control queue and invoked in order for
/// each message. The connection is health-checked periodically and
/// re-established (and re-subscribed) when it goes away.
struct PubSubHub {
    tx: mpsc::UnboundedSender<InvalidationHandler>,
    shutdown_flag: Arc<AtomicBool>,
    _handle: thread::JoinHandle<()>,
}

impl PubSubHub {
    fn start(
        redis_client: redis::Client,
        health_conn: redis::aio::ConnectionManager,
        channel: String,
    ) -> PubSubHub {
        let (tx, mut rx) = mpsc::unbounded_channel::<InvalidationHandler>();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let shutdown_flag_thread = Arc::clone(&shutdown_flag);

        let handle = thread::spawn(move || {
            let rt = match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("PubSubHub: failed to build dedicated runtime: {}", e);
                    return;
                }
            };
            rt.block_on(async move {
                let mut pubsub = match redis_client.get_async_pubsub().await {
                    Ok(p) => p,
                    Err(e) => {
                        error!("PubSubHub: failed to create Redis pubsub connection: {}", e);
                        return;
                    }
                };

                let mut handlers: Vec<InvalidationHandler> = Vec::new();
                let mut subscribed = subscribe_with_backoff(&mut pubsub, &channel).await;

                let mut last_health_check = Instant::now();
                let health_interval = Duration::from_secs(30);

                while !shutdown_flag_thread.load(Ordering::SeqCst) {
                    while let Ok(handler) = rx.try_recv() {
                        handlers.push(handler);
                    }

                    if last_health_check.elapsed() >= health_interval || !subscribed {
                        last_health_check = Instant::now();

                        let mut conn = health_conn.clone();
                        if let Err(e) = redis::cmd("PING").query_async::<String>(&mut conn).await {
                            warn!("PubSubHub: PING failed ({}); attempting reconnection", e);
                            match redis_client.get_async_pubsub().await {
                                Ok(new_pubsub) => {
                                    pubsub = new_pubsub;
                                    // A fresh connection starts with no subscriptions
                                    subscribed = false;
                                }
                                Err(e) => error!("PubSubHub: reconnection failed: {}", e),
                            }
                        }

                        if !subscribed {
                            match pubsub.subscribe(channel.as_str()).await {
                                Ok(()) => {
                                    debug!("PubSubHub: subscribed to channel {}", channel);
                                    subscribed = true;
                                }
                                Err(e) => warn!(
                                    "PubSubHub: health check failed to subscribe to {}: {}",
                                    channel, e
                                ),
                            }
                        }
                    }

                    let next = {
                        let mut messages = pubsub.on_message();
                        tokio::time::timeout(Duration::from_millis(250), messages.next()).await
                    };

                    match next {
                        Ok(Some(msg)) => {
                            let payload = match msg.get_payload::<String>() {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!("PubSubHub: failed to decode pub/sub payload: {}", e);
                                    continue;
                                }
                            };
                            match serde_json::from_str::<InvalidationMessage>(&payload) {
                                Ok(message) => {
                                    for handler in &handlers {
                                        dispatch(handler, message.clone()).await;
                                    }
                                }
                                Err(e) => warn!(
                                    "PubSubHub: unparseable invalidation payload {}: {}",
                                    payload, e
                                ),
                            }
                        }
                        // Stream ended: the connection dropped
                        Ok(None) => {
                            subscribed = false;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Err(_) => {}
                    }
                }
                debug!("PubSubHub: shut down");
            });
        });

        PubSubHub {
            tx,
            shutdown_flag,
            _handle: handle,
        }
    }

    fn register(&self, handler: InvalidationHandler) {
        if self.tx.send(handler).is_err() {
            warn!("PubSubHub: background thread has exited; handler not registered");
        }
    }

    fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }
}

async fn subscribe_with_backoff(pubsub: &mut redis::aio::PubSub, channel: &str) -> bool {
    let max_attempts = 5u32;
    let mut delay_ms = 100u64;
    for attempt in 1..=max_attempts {
        match pubsub.subscribe(channel).await {
            Ok(()) => {
                debug!("PubSubHub: subscribed to channel {}", channel);
                return true;
            }
            Err(e) => {
                warn!(
                    "PubSubHub: subscribe attempt {} failed for {}: {}",
                    attempt, channel, e
                );
                if attempt < max_attempts {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms.saturating_mul(2).min(2000);
                }
            }
        }
    }
    warn!(
        "PubSubHub: initial subscribe failed for channel {} after {} attempts, will retry during health check",
        channel, max_attempts
    );
    false
}

/// Bus over a Redis pub/sub channel shared by all instances
pub struct RedisInvalidationBus {
    conn: redis::aio::ConnectionManager,
    channel: String,
    hub: PubSubHub,
}

impl RedisInvalidationBus {
    pub async fn connect(redis_client: redis::Client, channel: impl Into<String>) -> Result<Self> {
        let channel = channel.into();
        let conn = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
        let hub = PubSubHub::start(redis_client, conn.clone(), channel.clone());
        Ok(Self { conn, channel, hub })
    }

    /// Stop the background subscriber
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}

impl Drop for RedisInvalidationBus {
    fn drop(&mut self) {
        self.hub.shutdown();
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode invalidation for key {}: {}", message.key, e);
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, ()>(&self.channel, &payload).await {
            warn!(
                "Redis PUBLISH error on channel {} for key {}: {}. Continuing.",
                self.channel, message.key, e
            );
        } else {
            debug!(
                "Cache invalidation published on channel '{}': {}",
                self.channel, payload
            );
        }
    }

    fn subscribe(&self, handler: InvalidationHandler) {
        self.hub.register(handler);
    }
}

/// Applies received invalidations to this instance's local store and tracker
pub struct InvalidationListener {
    instance_id: String,
    tracker: InvalidationTracker,
    local: Option<Arc<dyn LocalStore>>,
}

impl InvalidationListener {
    pub fn new(
        instance_id: impl Into<String>,
        tracker: InvalidationTracker,
        local: Option<Arc<dyn LocalStore>>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            tracker,
            local,
        }
    }

    pub async fn handle(&self, message: InvalidationMessage) {
        if message.origin == self.instance_id {
            return;
        }
        // Record before evicting so a backfill racing with the eviction sees it
        self.tracker
            .record(&message.region, &message.key, Utc::now())
            .await;
        if let Some(local) = &self.local {
            let evicted = local.remove(&message.region, &message.key).await;
            debug!(
                "Invalidation from {} for region '{}' key '{}' (evicted: {})",
                message.origin, message.region, message.key, evicted
            );
        }
    }

    pub fn into_handler(self: Arc<Self>) -> InvalidationHandler {
        Arc::new(move |message: InvalidationMessage| {
            let listener = Arc::clone(&self);
            async move { listener.handle(message).await }.boxed()
        })
    }
}
