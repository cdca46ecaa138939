//! Event-driven on-chain claim scheduler.
//!
//! The payment processor notifies the scheduler after every accepted RAV with
//! the sub-channel's unclaimed delta. The scheduler batches settlement:
//! deltas below the policy threshold are ignored, one claim at most is in
//! flight per sub-channel, and failures are retried with exponential backoff
//! until the attempt budget runs out.
//!
//! The queue lives in memory. Queued-but-unsubmitted claims are lost on
//! crash and re-derived from the store's unclaimed cursor the next time a
//! RAV for the sub-channel is accepted.

use alloy_primitives::U256;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::chain::ChainClient;
use crate::rav::{ChannelId, SubChannelKey, VmIdFragment};
use crate::store::{ChannelStateCache, RavStore, SubChannelStateUpdate};
use crate::timestamp::TimestampMs;

/// Settlement policy. All limits are process-wide.
#[derive(Debug, Clone)]
pub struct ClaimPolicy {
    /// Deltas below this never trigger a claim.
    pub min_claim_amount: U256,
    /// Upper bound on `active + queued` claim tasks.
    pub max_concurrent_claims: usize,
    /// Attempts per task before it is dropped as a permanent failure.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_delay_ms: u64,
    /// Check the payer's hub balance before submitting.
    pub require_hub_balance: bool,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        ClaimPolicy {
            min_claim_amount: U256::from(1_000_000u64),
            max_concurrent_claims: 16,
            max_retries: 3,
            retry_delay_ms: 1_000,
            require_hub_balance: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ClaimTask {
    delta: U256,
    attempts: u32,
    next_retry_at: Instant,
    #[allow(dead_code)]
    created_at: TimestampMs,
}

/// Counter snapshot for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMetricsSnapshot {
    pub active: usize,
    pub queued: usize,
    pub success_count: u64,
    pub failed_count: u64,
    pub backoff_count: u64,
    pub avg_processing_time_ms: u64,
}

#[derive(Debug, Default)]
struct ClaimCounters {
    success: AtomicU64,
    failed: AtomicU64,
    backoff: AtomicU64,
    processing_total_ms: AtomicU64,
    processing_samples: AtomicU64,
}

/// Capability through which the payment processor reports unclaimed deltas.
///
/// Passing this narrow interface instead of the scheduler itself keeps the
/// processor/scheduler dependency one-way.
pub trait ClaimNotifier: Send + Sync {
    fn notify(&self, channel_id: &ChannelId, vm_id_fragment: &VmIdFragment, delta: U256);
}

struct SchedulerInner {
    policy: ClaimPolicy,
    rav_store: Arc<dyn RavStore>,
    chain: Arc<dyn ChainClient>,
    channels: Arc<ChannelStateCache>,
    queue: Mutex<HashMap<SubChannelKey, ClaimTask>>,
    active: Mutex<HashSet<SubChannelKey>>,
    counters: ClaimCounters,
    tracker: TaskTracker,
}

/// Bounded-concurrency claim queue with a one-second scanner.
#[derive(Clone)]
pub struct ClaimScheduler {
    inner: Arc<SchedulerInner>,
}

impl ClaimScheduler {
    pub fn new(
        policy: ClaimPolicy,
        rav_store: Arc<dyn RavStore>,
        chain: Arc<dyn ChainClient>,
        channels: Arc<ChannelStateCache>,
    ) -> Self {
        ClaimScheduler {
            inner: Arc::new(SchedulerInner {
                policy,
                rav_store,
                chain,
                channels,
                queue: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                counters: ClaimCounters::default(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queues a claim for the sub-channel if policy allows.
    ///
    /// Dropped when the delta is below threshold or a claim for the key is
    /// already active; merged (keeping the larger delta) when one is already
    /// queued; rejected when the scheduler is at capacity.
    pub fn maybe_queue(&self, channel_id: &ChannelId, vm_id_fragment: &VmIdFragment, delta: U256) {
        let inner = &self.inner;
        if delta < inner.policy.min_claim_amount {
            tracing::debug!(%channel_id, %vm_id_fragment, %delta, "delta below claim threshold");
            return;
        }
        let key = SubChannelKey::new(channel_id.clone(), vm_id_fragment.clone());
        let active = inner.active.lock().expect("claim active set poisoned");
        if active.contains(&key) {
            return;
        }
        let mut queue = inner.queue.lock().expect("claim queue poisoned");
        if let Some(task) = queue.get_mut(&key) {
            // Never shrink: the latest observed delta supersedes older ones.
            if delta > task.delta {
                task.delta = delta;
            }
            return;
        }
        if active.len() + queue.len() >= inner.policy.max_concurrent_claims {
            tracing::warn!(%key, "claim queue at capacity, rejecting");
            return;
        }
        queue.insert(
            key,
            ClaimTask {
                delta,
                attempts: 0,
                next_retry_at: Instant::now(),
                created_at: TimestampMs::now(),
            },
        );
    }

    /// Runs the queue scanner until cancellation, then waits for in-flight
    /// claims to finish.
    #[instrument(skip_all)]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.promote_ready();
                }
                _ = cancellation_token.cancelled() => {
                    break;
                }
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("claim scheduler drained");
    }

    /// Promotes due tasks up to the concurrency budget and spawns a claim
    /// worker for each.
    fn promote_ready(&self) {
        let inner = &self.inner;
        let now = Instant::now();
        let mut promoted = Vec::new();
        {
            // Lock order is active then queue, everywhere.
            let mut active = inner.active.lock().expect("claim active set poisoned");
            let mut queue = inner.queue.lock().expect("claim queue poisoned");
            let budget = inner
                .policy
                .max_concurrent_claims
                .saturating_sub(active.len());
            let ready: Vec<SubChannelKey> = queue
                .iter()
                .filter(|(key, task)| task.next_retry_at <= now && !active.contains(key))
                .map(|(key, _)| key.clone())
                .take(budget)
                .collect();
            for key in ready {
                if let Some(task) = queue.remove(&key) {
                    active.insert(key.clone());
                    promoted.push((key, task));
                }
            }
        }
        for (key, task) in promoted {
            let scheduler = self.clone();
            inner.tracker.spawn(async move {
                scheduler.execute(key, task).await;
            });
        }
    }

    async fn execute(&self, key: SubChannelKey, task: ClaimTask) {
        let started = Instant::now();
        let result = self.submit_claim(&key).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let inner = &self.inner;
        inner
            .counters
            .processing_total_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        inner
            .counters
            .processing_samples
            .fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(()) => {
                inner.counters.success.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                let attempts = task.attempts + 1;
                if attempts < inner.policy.max_retries {
                    let delay_ms = inner
                        .policy
                        .retry_delay_ms
                        .saturating_mul(1u64 << (attempts - 1));
                    tracing::warn!(%key, attempts, delay_ms, %error, "claim failed, backing off");
                    inner.counters.backoff.fetch_add(1, Ordering::Relaxed);
                    // The key is still in the active set here, so no fresh
                    // notify can have raced a task into the queue.
                    let mut queue = inner.queue.lock().expect("claim queue poisoned");
                    queue.insert(
                        key.clone(),
                        ClaimTask {
                            delta: task.delta,
                            attempts,
                            next_retry_at: Instant::now() + Duration::from_millis(delay_ms),
                            created_at: task.created_at,
                        },
                    );
                } else {
                    tracing::error!(%key, attempts, %error, "claim failed permanently");
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        inner
            .active
            .lock()
            .expect("claim active set poisoned")
            .remove(&key);
    }

    /// One settlement attempt: fetch the latest RAV, optionally check the
    /// hub balance, submit, then advance the cursors.
    async fn submit_claim(&self, key: &SubChannelKey) -> Result<(), crate::chain::ChainError> {
        let inner = &self.inner;
        let latest = inner
            .rav_store
            .latest(&key.channel_id, &key.vm_id_fragment)
            .await
            .map_err(|e| crate::chain::ChainError::Transport(e.to_string()))?;
        let Some(latest) = latest else {
            tracing::warn!(%key, "claim scheduled but no RAV stored, dropping");
            return Ok(());
        };

        if inner.policy.require_hub_balance {
            let channel = inner.chain.get_channel(&key.channel_id).await?;
            let state = inner.channels.sub_channel_state(key);
            let needed = latest
                .accumulated_amount()
                .saturating_sub(state.last_claimed_amount);
            match channel {
                Some(channel) if channel.hub_balance >= needed => {}
                Some(_) => {
                    return Err(crate::chain::ChainError::Rejected(
                        "hub balance below unclaimed delta".to_string(),
                    ));
                }
                None => {
                    return Err(crate::chain::ChainError::Rejected(
                        "channel not found on-chain".to_string(),
                    ));
                }
            }
        }

        let receipt = inner.chain.claim(&latest).await?;
        tracing::info!(%key, nonce = latest.nonce(), tx_hash = %receipt.tx_hash, "claim settled");

        inner.channels.update_sub_channel_state(
            key,
            SubChannelStateUpdate {
                last_claimed_amount: Some(latest.accumulated_amount()),
                last_confirmed_nonce: Some(latest.nonce()),
                ..Default::default()
            },
        );
        inner
            .rav_store
            .mark_claimed(&key.channel_id, &key.vm_id_fragment, latest.nonce())
            .await
            .map_err(|e| crate::chain::ChainError::Transport(e.to_string()))?;
        Ok(())
    }

    pub fn metrics(&self) -> ClaimMetricsSnapshot {
        let inner = &self.inner;
        let samples = inner.counters.processing_samples.load(Ordering::Relaxed);
        let avg = if samples == 0 {
            0
        } else {
            inner.counters.processing_total_ms.load(Ordering::Relaxed) / samples
        };
        ClaimMetricsSnapshot {
            active: inner.active.lock().expect("claim active set poisoned").len(),
            queued: inner.queue.lock().expect("claim queue poisoned").len(),
            success_count: inner.counters.success.load(Ordering::Relaxed),
            failed_count: inner.counters.failed.load(Ordering::Relaxed),
            backoff_count: inner.counters.backoff.load(Ordering::Relaxed),
            avg_processing_time_ms: avg,
        }
    }
}

impl ClaimNotifier for ClaimScheduler {
    fn notify(&self, channel_id: &ChannelId, vm_id_fragment: &VmIdFragment, delta: U256) {
        self.maybe_queue(channel_id, vm_id_fragment, delta);
    }
}
