//! Async write queue with scope-grouped batching.
//!
//! All index mutation funnels through one consumer task per queue — that
//! single-flight discipline is the only mutual exclusion the index layer
//! needs. Producers enqueue concurrently; batches are applied strictly one
//! at a time, grouped by scope so each scope group hits exactly one index.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;

use crate::error::{MagpieError, Result};
use crate::types::{
    resolve_scope, ApplyOutcome, ContentCategory, EmbeddedRecord, Scope, WriteQueueStatsSnapshot,
};

const CHANNEL_CAPACITY: usize = 1000;
const ROLLING_SAMPLES: usize = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Injected batch-apply step, invoked once per scope group.
pub type BatchApplyFn =
    Arc<dyn Fn(Scope, Vec<EmbeddedRecord>) -> BoxFuture<Result<ApplyOutcome>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct WriteQueueOptions {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl WriteQueueOptions {
    pub fn from_config(cfg: &crate::config::VectorStoreConfig) -> Self {
        WriteQueueOptions {
            batch_size: cfg.write_batch_size.max(1),
            batch_timeout: Duration::from_millis(cfg.write_batch_timeout_ms),
            max_retries: cfg.write_max_retries,
            retry_base: Duration::from_millis(cfg.write_retry_base_ms),
        }
    }
}

/// One unit of pending work.
pub struct WriteItem {
    pub id: String,
    pub scope: Scope,
    pub category: ContentCategory,
    pub records: Vec<EmbeddedRecord>,
    pub enqueued_at: chrono::DateTime<Utc>,
    pub retry_count: u32,
}

enum QueueMsg {
    Write(WriteItem),
    Flush(oneshot::Sender<()>),
    Clear(oneshot::Sender<usize>),
}

#[derive(Default)]
struct QueueCounters {
    queue_depth: AtomicUsize,
    batches_processed: AtomicU64,
    documents_processed: AtomicU64,
    failed_writes: AtomicU64,
    batch_times_ms: Mutex<VecDeque<f64>>,
    last_processed_ms: AtomicU64,
}

impl QueueCounters {
    fn record_batch(&self, elapsed: Duration) {
        self.batches_processed.fetch_add(1, Ordering::SeqCst);
        self.last_processed_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::SeqCst);
        let mut times = self.batch_times_ms.lock().expect("stats lock poisoned");
        if times.len() == ROLLING_SAMPLES {
            times.pop_front();
        }
        times.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    fn snapshot(&self) -> WriteQueueStatsSnapshot {
        let times = self.batch_times_ms.lock().expect("stats lock poisoned");
        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };
        let last_ms = self.last_processed_ms.load(Ordering::SeqCst);
        WriteQueueStatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            batches_processed: self.batches_processed.load(Ordering::SeqCst),
            documents_processed: self.documents_processed.load(Ordering::SeqCst),
            failed_writes: self.failed_writes.load(Ordering::SeqCst),
            avg_batch_ms: avg,
            last_processed_at: if last_ms == 0 {
                None
            } else {
                chrono::DateTime::from_timestamp_millis(last_ms as i64)
            },
        }
    }
}

/// Producer-side handle. Cheap to clone; enqueue is fire-and-forget after the
/// synchronous scope validation.
#[derive(Clone)]
pub struct WriteQueueHandle {
    tx: mpsc::Sender<QueueMsg>,
    counters: Arc<QueueCounters>,
}

impl WriteQueueHandle {
    /// Validate the category/scope pairing and queue the records.
    ///
    /// The only synchronous failure paths are the pairing invariant and a
    /// full/closed queue — apply failures later surface in [`Self::stats`].
    pub fn enqueue(
        &self,
        records: Vec<EmbeddedRecord>,
        category: ContentCategory,
        tenant_id: Option<&str>,
    ) -> Result<Scope> {
        let scope = resolve_scope(category, tenant_id)?;
        if records.is_empty() {
            return Ok(scope);
        }
        let doc_count = records.len();
        let item = WriteItem {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.clone(),
            category,
            records,
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        // Count before sending: the consumer may commit (and decrement)
        // immediately after the send lands.
        self.counters.queue_depth.fetch_add(doc_count, Ordering::SeqCst);
        match self.tx.try_send(QueueMsg::Write(item)) {
            Ok(()) => Ok(scope),
            Err(e) => {
                self.counters.queue_depth.fetch_sub(doc_count, Ordering::SeqCst);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(MagpieError::QueueFull {
                        pending: CHANNEL_CAPACITY,
                    }),
                    mpsc::error::TrySendError::Closed(_) => Err(MagpieError::QueueClosed),
                }
            }
        }
    }

    /// Drain everything currently queued. Used at shutdown.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueueMsg::Flush(ack_tx))
            .await
            .map_err(|_| MagpieError::QueueClosed)?;
        ack_rx.await.map_err(|_| MagpieError::QueueClosed)
    }

    /// Discard all queued work. Operator action; returns the dropped count.
    pub async fn clear(&self) -> Result<usize> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueueMsg::Clear(ack_tx))
            .await
            .map_err(|_| MagpieError::QueueClosed)?;
        ack_rx.await.map_err(|_| MagpieError::QueueClosed)
    }

    pub fn stats(&self) -> WriteQueueStatsSnapshot {
        self.counters.snapshot()
    }
}

/// Spawn the queue's consumer task.
pub fn create_write_queue(
    opts: WriteQueueOptions,
    apply: BatchApplyFn,
) -> (WriteQueueHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let counters = Arc::new(QueueCounters::default());

    let handle = tokio::spawn(process_writes(
        rx,
        tx.clone(),
        opts,
        apply,
        Arc::clone(&counters),
    ));

    (WriteQueueHandle { tx, counters }, handle)
}

fn pending_docs(pending: &VecDeque<WriteItem>) -> usize {
    pending.iter().map(|i| i.records.len()).sum()
}

/// Pull up to `batch_size` documents' worth of items off the front.
/// Always takes at least one item so oversized items still make progress.
fn take_batch(pending: &mut VecDeque<WriteItem>, batch_size: usize) -> Vec<WriteItem> {
    let mut batch = Vec::new();
    let mut docs = 0;
    while let Some(front) = pending.front() {
        let n = front.records.len();
        if !batch.is_empty() && docs + n > batch_size {
            break;
        }
        docs += n;
        batch.push(pending.pop_front().expect("front checked"));
        if docs >= batch_size {
            break;
        }
    }
    batch
}

async fn process_writes(
    mut rx: mpsc::Receiver<QueueMsg>,
    retry_tx: mpsc::Sender<QueueMsg>,
    opts: WriteQueueOptions,
    apply: BatchApplyFn,
    counters: Arc<QueueCounters>,
) {
    let mut pending: VecDeque<WriteItem> = VecDeque::new();
    let mut deadline = Instant::now() + opts.batch_timeout;

    loop {
        match timeout_at(deadline.into(), rx.recv()).await {
            Ok(Some(QueueMsg::Write(item))) => {
                pending.push_back(item);
                if pending_docs(&pending) >= opts.batch_size {
                    while !pending.is_empty() {
                        commit_batch(&mut pending, &opts, &apply, &counters, &retry_tx).await;
                    }
                    deadline = Instant::now() + opts.batch_timeout;
                }
            }
            Ok(Some(QueueMsg::Flush(ack))) => {
                // Pull in everything already queued before committing.
                let mut acks = vec![ack];
                loop {
                    match rx.try_recv() {
                        Ok(QueueMsg::Write(item)) => pending.push_back(item),
                        Ok(QueueMsg::Flush(a)) => acks.push(a),
                        Ok(QueueMsg::Clear(a)) => {
                            let _ = a.send(0);
                        }
                        Err(_) => break,
                    }
                }
                while !pending.is_empty() {
                    commit_batch(&mut pending, &opts, &apply, &counters, &retry_tx).await;
                }
                for a in acks {
                    let _ = a.send(());
                }
                deadline = Instant::now() + opts.batch_timeout;
            }
            Ok(Some(QueueMsg::Clear(ack))) => {
                while let Ok(QueueMsg::Write(item)) = rx.try_recv() {
                    pending.push_back(item);
                }
                let discarded = pending_docs(&pending);
                pending.clear();
                counters.queue_depth.fetch_sub(discarded, Ordering::SeqCst);
                tracing::warn!("[WQ] cleared {} pending documents without applying", discarded);
                let _ = ack.send(discarded);
                deadline = Instant::now() + opts.batch_timeout;
            }
            Ok(None) => {
                tracing::info!(
                    "[WQ] channel closed, flushing {} pending documents",
                    pending_docs(&pending)
                );
                while !pending.is_empty() {
                    commit_batch(&mut pending, &opts, &apply, &counters, &retry_tx).await;
                }
                break;
            }
            Err(_timeout) => {
                if !pending.is_empty() {
                    tracing::debug!(
                        "[WQ] batch timeout, committing {} pending documents",
                        pending_docs(&pending)
                    );
                    while !pending.is_empty() {
                        commit_batch(&mut pending, &opts, &apply, &counters, &retry_tx).await;
                    }
                }
                deadline = Instant::now() + opts.batch_timeout;
            }
        }
    }
}

fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry_count)).min(MAX_BACKOFF)
}

async fn commit_batch(
    pending: &mut VecDeque<WriteItem>,
    opts: &WriteQueueOptions,
    apply: &BatchApplyFn,
    counters: &Arc<QueueCounters>,
    retry_tx: &mpsc::Sender<QueueMsg>,
) {
    let batch = take_batch(pending, opts.batch_size);
    if batch.is_empty() {
        return;
    }
    let batch_docs: usize = batch.iter().map(|i| i.records.len()).sum();
    counters.queue_depth.fetch_sub(batch_docs, Ordering::SeqCst);
    let started = Instant::now();

    // Group by scope, preserving arrival order within each group. One apply
    // call per scope group is what gives index-level write isolation.
    let mut groups: Vec<(Scope, Vec<WriteItem>)> = Vec::new();
    for item in batch {
        match groups.iter_mut().find(|(s, _)| *s == item.scope) {
            Some((_, items)) => items.push(item),
            None => groups.push((item.scope.clone(), vec![item])),
        }
    }

    for (scope, items) in groups {
        let records: Vec<EmbeddedRecord> =
            items.iter().flat_map(|i| i.records.iter().cloned()).collect();
        let count = records.len();
        match apply(scope.clone(), records).await {
            Ok(outcome) => {
                counters
                    .documents_processed
                    .fetch_add(outcome.applied() as u64, Ordering::SeqCst);
                if outcome.failed() > 0 {
                    counters
                        .failed_writes
                        .fetch_add(outcome.failed() as u64, Ordering::SeqCst);
                    tracing::warn!(
                        "[WQ {}] partial apply: {} of {} documents failed",
                        scope,
                        outcome.failed(),
                        count
                    );
                }
            }
            Err(e) => {
                tracing::warn!("[WQ {}] batch apply failed: {}", scope, e);
                for mut item in items {
                    item.retry_count += 1;
                    if item.retry_count > opts.max_retries {
                        let dropped = item.records.len();
                        counters
                            .failed_writes
                            .fetch_add(dropped as u64, Ordering::SeqCst);
                        tracing::error!(
                            "[WQ {}] {}",
                            scope,
                            MagpieError::RetriesExhausted {
                                scope: scope.key(),
                                retries: item.retry_count,
                            }
                        );
                        continue;
                    }
                    let delay = backoff_delay(opts.retry_base, item.retry_count);
                    tracing::debug!(
                        "[WQ {}] retrying item {} in {:?} (attempt {})",
                        scope,
                        item.id,
                        delay,
                        item.retry_count
                    );
                    let tx = retry_tx.clone();
                    let retry_counters = Arc::clone(counters);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let n = item.records.len();
                        retry_counters.queue_depth.fetch_add(n, Ordering::SeqCst);
                        if tx.send(QueueMsg::Write(item)).await.is_err() {
                            retry_counters.queue_depth.fetch_sub(n, Ordering::SeqCst);
                            retry_counters.failed_writes.fetch_add(n as u64, Ordering::SeqCst);
                            tracing::warn!("[WQ] retry dropped, queue closed");
                        }
                    });
                }
            }
        }
    }

    counters.record_batch(started.elapsed());
}
