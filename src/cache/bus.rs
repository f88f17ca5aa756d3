//! Cluster-coherent invalidation.
//!
//! Every worker process holds an independent cache store, so a write on one
//! worker must drop the affected keys on all of them before its HTTP
//! response is sent. The bus contract is synchronous from the caller's
//! viewpoint: `broadcast_invalidate` does not resolve until every live
//! worker has acknowledged applying the whole batch, or the budget elapses.
//! Fire-and-forget delivery is not an acceptable implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cache::planner::InvalidationPlan;
use crate::cache::store::CacheStore;

/// Outcome of one broadcast. `unacked > 0` means some live worker did not
/// confirm within the budget and may be serving stale entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusAck {
    pub acked: u32,
    pub unacked: u32,
}

impl BusAck {
    pub fn is_coherent(&self) -> bool {
        self.unacked == 0
    }
}

#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Delivers the plan to every live worker and awaits acknowledgement.
    async fn broadcast_invalidate(&self, plan: InvalidationPlan) -> Result<BusAck>;

    /// Cluster-wide cache clear.
    async fn broadcast_clear(&self) -> Result<BusAck>;

    /// Barrier: resolves once every live worker has drained all previously
    /// published batches, or errors at the deadline.
    async fn wait_for_sync(&self, deadline: Duration) -> Result<()>;

    /// Number of broadcasts that timed out with unacknowledged workers.
    fn incidents(&self) -> u64;
}

/// Bus for a single-process pool: the local store is the whole cluster, so
/// application is immediate and trivially acknowledged.
pub struct LocalBus {
    cache: Arc<CacheStore>,
    incidents: AtomicU64,
}

impl LocalBus {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            incidents: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ClusterBus for LocalBus {
    async fn broadcast_invalidate(&self, plan: InvalidationPlan) -> Result<BusAck> {
        plan.apply(&self.cache);
        Ok(BusAck { acked: 1, unacked: 0 })
    }

    async fn broadcast_clear(&self) -> Result<BusAck> {
        self.broadcast_invalidate(InvalidationPlan::clear_all()).await
    }

    async fn wait_for_sync(&self, _deadline: Duration) -> Result<()> {
        Ok(())
    }

    fn incidents(&self) -> u64 {
        self.incidents.load(Ordering::Relaxed)
    }
}

const CHANNEL: &str = "rerum:cache:sync";

fn ack_key(message_id: &str) -> String {
    format!("rerum:cache:ack:{message_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct BusMessage {
    id: String,
    plan: InvalidationPlan,
}

/// Pub/sub bus with per-message acknowledgement counters.
///
/// Each worker subscribes to a shared channel. `PUBLISH` reports how many
/// subscribers received the message; that count is the required ack quorum.
/// Every subscriber (the sender included) applies the whole batch to its own
/// store and then increments the message's ack counter. The sender polls the
/// counter until quorum or the budget elapses. Because a subscriber sees
/// messages in publish order, acknowledging a later message implies all
/// earlier batches were applied, which is what `wait_for_sync` relies on.
pub struct RedisBus {
    cache: Arc<CacheStore>,
    conn: MultiplexedConnection,
    budget: Duration,
    worker_id: String,
    incidents: AtomicU64,
}

impl RedisBus {
    pub async fn connect(url: &str, cache: Arc<CacheStore>, budget: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("redis connection failed")?;
        let worker_id = Uuid::new_v4().simple().to_string();

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("redis pubsub connection failed")?;
        pubsub.subscribe(CHANNEL).await?;

        let subscriber_cache = Arc::clone(&cache);
        let ack_conn = conn.clone();
        let subscriber_id = worker_id.clone();
        tokio::spawn(async move {
            let mut pubsub = pubsub;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(worker = %subscriber_id, "Unreadable bus payload: {err}");
                        continue;
                    }
                };
                let message: BusMessage = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(worker = %subscriber_id, "Malformed bus message: {err}");
                        continue;
                    }
                };
                // Apply the whole batch before acknowledging.
                message.plan.apply(&subscriber_cache);
                let mut conn = ack_conn.clone();
                let key = ack_key(&message.id);
                match conn.incr::<_, _, i64>(&key, 1).await {
                    Ok(_) => {
                        let _ = conn.expire::<_, ()>(&key, 30).await;
                    }
                    Err(err) => {
                        tracing::warn!(worker = %subscriber_id, "Failed to acknowledge {key}: {err}");
                    }
                }
            }
            tracing::warn!(worker = %subscriber_id, "Cluster bus subscription ended");
        });

        tracing::info!(worker = %worker_id, "Cluster bus connected on channel {CHANNEL}");
        Ok(Self {
            cache,
            conn,
            budget,
            worker_id,
            incidents: AtomicU64::new(0),
        })
    }

    async fn broadcast_with_budget(
        &self,
        plan: InvalidationPlan,
        budget: Duration,
    ) -> Result<BusAck> {
        let id = Uuid::new_v4().simple().to_string();
        let payload = serde_json::to_string(&BusMessage {
            id: id.clone(),
            plan: plan.clone(),
        })?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(CHANNEL, payload).await?;
        if receivers <= 0 {
            // No live subscriber yet (startup race). Nothing is required of
            // the cluster; keep the local store coherent and move on.
            plan.apply(&self.cache);
            return Ok(BusAck { acked: 0, unacked: 0 });
        }

        let key = ack_key(&id);
        let deadline = Instant::now() + budget;
        loop {
            let acked: i64 = conn.get::<_, Option<i64>>(&key).await?.unwrap_or(0);
            if acked >= receivers {
                let _: i64 = conn.del(&key).await.unwrap_or(0);
                return Ok(BusAck {
                    acked: u32::try_from(receivers).unwrap_or(u32::MAX),
                    unacked: 0,
                });
            }
            if Instant::now() >= deadline {
                self.incidents.fetch_add(1, Ordering::Relaxed);
                let unacked = receivers - acked;
                tracing::warn!(
                    worker = %self.worker_id,
                    "Invalidation {id} timed out: {acked}/{receivers} acked within {}ms",
                    budget.as_millis()
                );
                return Ok(BusAck {
                    acked: u32::try_from(acked).unwrap_or(0),
                    unacked: u32::try_from(unacked).unwrap_or(u32::MAX),
                });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ClusterBus for RedisBus {
    async fn broadcast_invalidate(&self, plan: InvalidationPlan) -> Result<BusAck> {
        self.broadcast_with_budget(plan, self.budget).await
    }

    async fn broadcast_clear(&self) -> Result<BusAck> {
        self.broadcast_with_budget(InvalidationPlan::clear_all(), self.budget)
            .await
    }

    async fn wait_for_sync(&self, deadline: Duration) -> Result<()> {
        let ack = self
            .broadcast_with_budget(InvalidationPlan::noop(), deadline)
            .await?;
        if ack.is_coherent() {
            Ok(())
        } else {
            anyhow::bail!(
                "cluster sync barrier timed out: {} of {} workers unacknowledged",
                ack.unacked,
                ack.acked + ack.unacked
            )
        }
    }

    fn incidents(&self) -> u64 {
        self.incidents.load(Ordering::Relaxed)
    }
}
