//! Write batching towards the address persistence service.
//!
//! Discoveries arrive in bursts. The batcher buffers them in a bounded
//! channel, dedups by hash (last write wins within a window), and flushes
//! whenever the buffer reaches `batch_size` or the oldest buffered item is
//! `flush_interval` old. Flushes that keep failing after retry are logged
//! and dropped: persistence is at-most-once, and a dropped address is simply
//! rediscovered on a later pass.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use perimeter_model::{Address, AddressHash, UserContext};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tracing::{debug, error, warn};

use crate::{
    config::{BatcherConfig, RetryConfig},
    error::{Result, ScanError},
    retry::retry_with_backoff,
    services::AddressService,
};

enum BatchCommand {
    Add(Address),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatcherStats {
    /// Successful persistence calls.
    pub flushes: u64,
    pub persisted: u64,
    /// Addresses discarded after retry exhaustion.
    pub dropped: u64,
    pub retries: u64,
}

pub struct Batcher {
    tx: mpsc::Sender<BatchCommand>,
    counters: Arc<Counters>,
    task: Mutex<Option<JoinHandle<()>>>,
    config: BatcherConfig,
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("config", &self.config)
            .field("capacity", &self.tx.capacity())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Batcher {
    /// Start the drain loop. Every flush is issued under `ctx`.
    pub fn spawn(
        ctx: UserContext,
        service: Arc<dyn AddressService>,
        config: BatcherConfig,
        retry: RetryConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(drain_loop(
            ctx,
            service,
            rx,
            config.clone(),
            retry,
            Arc::clone(&counters),
        ));
        Self {
            tx,
            counters,
            task: Mutex::new(Some(task)),
            config,
        }
    }

    /// Non-blocking enqueue. `BatcherFull` tells the caller to apply
    /// backpressure upstream.
    pub fn try_add(&self, address: Address) -> Result<()> {
        self.tx.try_send(BatchCommand::Add(address)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ScanError::BatcherFull,
            mpsc::error::TrySendError::Closed(_) => ScanError::BatcherClosed,
        })
    }

    /// Enqueue, waiting for buffer space.
    pub async fn add(&self, address: Address) -> Result<()> {
        self.tx
            .send(BatchCommand::Add(address))
            .await
            .map_err(|_| ScanError::BatcherClosed)
    }

    /// Flush everything buffered so far and wait for the write to finish.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(BatchCommand::Flush(ack))
            .await
            .map_err(|_| ScanError::BatcherClosed)?;
        done.await.map_err(|_| ScanError::BatcherClosed)
    }

    /// Flush remaining items and stop the drain loop. Must be called before
    /// the last reference goes away. Safe to call more than once.
    pub async fn done(&self) -> Result<()> {
        let (ack, finished) = oneshot::channel();
        if self.tx.send(BatchCommand::Shutdown(ack)).await.is_ok() {
            let _ = finished.await;
        }
        if let Some(task) = self.task.lock().await.take()
            && let Err(err) = task.await
        {
            return Err(ScanError::Internal(format!(
                "batcher drain loop ended abnormally: {err}"
            )));
        }
        Ok(())
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            flushes: self.counters.flushes.load(Ordering::SeqCst),
            persisted: self.counters.persisted.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            retries: self.counters.retries.load(Ordering::SeqCst),
        }
    }
}

async fn drain_loop(
    ctx: UserContext,
    service: Arc<dyn AddressService>,
    mut rx: mpsc::Receiver<BatchCommand>,
    config: BatcherConfig,
    retry: RetryConfig,
    counters: Arc<Counters>,
) {
    let batch_size = config.batch_size.max(1);
    let mut pending: HashMap<AddressHash, Address> = HashMap::new();
    let mut deadline = Instant::now();

    loop {
        let msg = if pending.is_empty() {
            rx.recv().await
        } else {
            match timeout_at(deadline, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    flush_pending(&ctx, &service, &mut pending, &retry, &counters)
                        .await;
                    continue;
                }
            }
        };

        let Some(msg) = msg else {
            flush_pending(&ctx, &service, &mut pending, &retry, &counters).await;
            break;
        };

        match msg {
            BatchCommand::Add(address) => {
                if pending.is_empty() {
                    deadline = Instant::now() + config.flush_interval();
                }
                pending.insert(address.address_hash.clone(), address);
                if pending.len() >= batch_size {
                    flush_pending(&ctx, &service, &mut pending, &retry, &counters)
                        .await;
                }
            }
            BatchCommand::Flush(ack) => {
                flush_pending(&ctx, &service, &mut pending, &retry, &counters)
                    .await;
                let _ = ack.send(());
            }
            BatchCommand::Shutdown(ack) => {
                flush_pending(&ctx, &service, &mut pending, &retry, &counters)
                    .await;
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!(target: "scan::batcher", "drain loop stopped");
}

async fn flush_pending(
    ctx: &UserContext,
    service: &Arc<dyn AddressService>,
    pending: &mut HashMap<AddressHash, Address>,
    retry: &RetryConfig,
    counters: &Counters,
) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let size = batch.len();
    let mut attempts: u64 = 0;
    let result = retry_with_backoff(retry, "batcher.flush", || {
        attempts += 1;
        service.update(ctx, batch.clone())
    })
    .await;
    counters
        .retries
        .fetch_add(attempts.saturating_sub(1), Ordering::SeqCst);

    match result {
        Ok(written) => {
            counters.flushes.fetch_add(1, Ordering::SeqCst);
            counters.persisted.fetch_add(size as u64, Ordering::SeqCst);
            if written != size {
                warn!(
                    target: "scan::batcher",
                    size,
                    written,
                    "persistence wrote a different number of records"
                );
            }
            debug!(target: "scan::batcher", size, attempts, "flushed");
        }
        Err(err) => {
            counters.dropped.fetch_add(size as u64, Ordering::SeqCst);
            error!(
                target: "scan::batcher",
                size,
                attempts,
                error = %err,
                "flush failed after retries; batch dropped"
            );
        }
    }
}
