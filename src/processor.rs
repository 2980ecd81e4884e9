//! Background dispatch of outbox items to their handlers.
//!
//! A [`Processor`] runs one or more workers, each repeatedly claiming an
//! item from the [`Outbox`], invoking every handler still pending on it, and
//! releasing it. Failed handlers stay pending and the item is retried after
//! a capped exponential backoff, without limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::HandlerError;
use crate::outbox::{ClaimedItem, Outbox};

/// Tuning for the outbox processor.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ledgerfold::ProcessorConfig;
///
/// let config = ProcessorConfig {
///     workers: 4,
///     ..ProcessorConfig::default()
/// };
/// assert_eq!(config.poll_interval, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of concurrent workers.
    ///
    /// Default: 1.
    pub workers: usize,

    /// How long an idle worker sleeps before looking for work again when no
    /// commit wakes it earlier.
    ///
    /// Default: 100 milliseconds.
    pub poll_interval: Duration,

    /// How long a claimed item stays reserved for its worker. A worker that
    /// dies holding an item delays its delivery by at most this long.
    ///
    /// Default: 30 seconds.
    pub lease: Duration,

    /// Delay before the first retry of an item with a failed handler. Each
    /// further retry doubles it, up to
    /// [`retry_max_delay`](ProcessorConfig::retry_max_delay).
    ///
    /// Default: 100 milliseconds.
    pub retry_base_delay: Duration,

    /// Maximum delay between retries of one item.
    ///
    /// Default: 30 seconds.
    pub retry_max_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

impl ProcessorConfig {
    /// Backoff before retry number `attempt` (1-based) of an item.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

/// Dispatches outbox items to their handlers on background tasks.
#[derive(Debug, Clone)]
pub struct Processor {
    outbox: Outbox,
    config: ProcessorConfig,
}

impl Processor {
    /// Create a processor for `outbox` with default settings.
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            config: ProcessorConfig::default(),
        }
    }

    /// Replace the processor settings.
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the workers on the current tokio runtime.
    ///
    /// At least one worker is started even if the configuration asks for
    /// zero.
    ///
    /// # Returns
    ///
    /// A [`ProcessorHandle`] used to stop the workers.
    pub fn start(self) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.config.workers.max(1);

        let tasks = (0..workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    self.outbox.clone(),
                    self.config.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(workers, "outbox processor started");
        ProcessorHandle {
            shutdown_tx,
            outbox: self.outbox,
            tasks: Arc::new(tokio::sync::Mutex::new(tasks)),
        }
    }
}

/// Handle for stopping a running [`Processor`].
///
/// `Clone` is cheap. Dropping every handle without calling
/// [`shutdown`](ProcessorHandle::shutdown) also stops the workers, but
/// nothing waits for them.
#[derive(Clone)]
pub struct ProcessorHandle {
    shutdown_tx: watch::Sender<bool>,
    outbox: Outbox,
    tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl ProcessorHandle {
    /// Stop claiming items and wait for the workers to exit.
    ///
    /// Handler calls already in flight run to completion. Calling
    /// `shutdown` more than once is safe; later calls return immediately.
    pub async fn shutdown(&self) {
        // Receivers live in the worker tasks; a send error only means they
        // have all exited.
        let _ = self.shutdown_tx.send(true);
        self.outbox.notify_all();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "outbox worker panicked");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    outbox: Outbox,
    config: ProcessorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::debug!(worker, "outbox worker running");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match outbox.claim(worker, config.lease).await {
            Some(claimed) => dispatch(worker, &outbox, &config, claimed).await,
            None => {
                tokio::select! {
                    _ = outbox.notified() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!(worker, "outbox worker stopped");
}

/// Invoke every pending handler for one claimed item, then release it.
async fn dispatch(worker: usize, outbox: &Outbox, config: &ProcessorConfig, claimed: ClaimedItem) {
    let ClaimedItem { item, handlers } = claimed;
    let mut failed = 0usize;

    for handler in &handlers {
        match handler.handle(&item).await {
            Ok(()) => outbox.ack(worker, item.event_id, handler.name()).await,
            Err(source) => {
                failed += 1;
                let err = HandlerError {
                    handler: handler.name().to_owned(),
                    event_id: item.event_id,
                    source,
                };
                tracing::warn!(
                    worker,
                    stream = %item.stream_id,
                    version = item.version,
                    attempts = item.attempts,
                    error = %err,
                    "outbox handler failed; will retry"
                );
            }
        }
    }

    let retry_after = if failed == 0 {
        Duration::ZERO
    } else {
        config.retry_delay(item.attempts + 1)
    };
    if outbox.release(worker, item.event_id, retry_after).await {
        tracing::debug!(
            worker,
            event_id = %item.event_id,
            event_type = %item.event_type,
            "outbox item delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::event::{StoredEvent, StreamId};
    use crate::outbox::{OutboxHandler, OutboxItem};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Records every event id it sees; fails the first `failures` calls.
    struct Recording {
        name: &'static str,
        failures: AtomicUsize,
        seen: Mutex<HashMap<Uuid, usize>>,
    }

    impl Recording {
        fn new(name: &'static str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures: AtomicUsize::new(failures),
                seen: Mutex::new(HashMap::new()),
            })
        }

        fn calls(&self, event_id: Uuid) -> usize {
            self.seen
                .lock()
                .unwrap()
                .get(&event_id)
                .copied()
                .unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.seen.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl OutboxHandler for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, item: &OutboxItem) -> Result<(), BoxError> {
            *self.seen.lock().unwrap().entry(item.event_id).or_default() += 1;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(format!("{} unavailable", self.name).into());
            }
            Ok(())
        }
    }

    fn fast_config(workers: usize) -> ProcessorConfig {
        ProcessorConfig {
            workers,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
        }
    }

    async fn commit(outbox: &Outbox, event_type: &str, count: usize) -> Vec<Uuid> {
        let mut tx = outbox.begin().await;
        let mut ids = Vec::with_capacity(count);
        for version in 1..=count as u64 {
            let id = Uuid::new_v4();
            tx.stage(&StoredEvent {
                event_id: id,
                stream_id: StreamId::new("counter", Uuid::nil()),
                version,
                event_type: event_type.to_owned(),
                payload: serde_json::Value::Null,
                recorded_at: chrono::Utc::now(),
            });
            ids.push(id);
        }
        tx.commit();
        ids
    }

    async fn drained(outbox: &Outbox) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !outbox.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox drained in time");
    }

    #[test]
    fn config_default_values() {
        let config = ProcessorConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
        assert_eq!(config.retry_max_delay, Duration::from_secs(30));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = ProcessorConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(4), Duration::from_millis(800));
        assert_eq!(config.retry_delay(20), Duration::from_secs(30));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn delivers_to_every_handler_and_retires() {
        let audit = Recording::new("audit", 0);
        let mailer = Recording::new("mailer", 0);
        let outbox = Outbox::builder()
            .register_handler("Added", audit.clone())
            .register_handler("Added", mailer.clone())
            .build();

        let handle = Processor::new(outbox.clone())
            .with_config(fast_config(1))
            .start();
        let ids = commit(&outbox, "Added", 3).await;
        drained(&outbox).await;
        handle.shutdown().await;

        for id in ids {
            assert_eq!(audit.calls(id), 1);
            assert_eq!(mailer.calls(id), 1);
        }
    }

    #[tokio::test]
    async fn failing_handler_is_retried_without_repeating_the_other() {
        let audit = Recording::new("audit", 0);
        let flaky = Recording::new("flaky", 1);
        let outbox = Outbox::builder()
            .register_handler("Added", audit.clone())
            .register_handler("Added", flaky.clone())
            .build();

        let handle = Processor::new(outbox.clone())
            .with_config(fast_config(1))
            .start();
        let ids = commit(&outbox, "Added", 1).await;
        drained(&outbox).await;
        handle.shutdown().await;

        assert_eq!(flaky.calls(ids[0]), 2);
        assert_eq!(audit.calls(ids[0]), 1);
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_an_item() {
        let audit = Recording::new("audit", 0);
        let outbox = Outbox::builder()
            .register_handler("Added", audit.clone())
            .build();

        let handle = Processor::new(outbox.clone())
            .with_config(fast_config(4))
            .start();
        let ids = commit(&outbox, "Added", 50).await;
        drained(&outbox).await;
        handle.shutdown().await;

        assert_eq!(audit.total(), 50);
        assert!(ids.iter().all(|id| audit.calls(*id) == 1));
    }

    struct Slow {
        started: Arc<tokio::sync::Notify>,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl OutboxHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _item: &OutboxItem) -> Result<(), BoxError> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_handler_finish() {
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let outbox = Outbox::builder()
            .register_handler(
                "Added",
                Arc::new(Slow {
                    started: started.clone(),
                    finished: finished.clone(),
                }),
            )
            .build();

        let handle = Processor::new(outbox.clone())
            .with_config(fast_config(1))
            .start();
        commit(&outbox, "Added", 1).await;
        started.notified().await;
        handle.shutdown().await;

        assert!(finished.load(Ordering::SeqCst));
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_twice_is_safe() {
        let outbox = Outbox::builder().build();
        let handle = Processor::new(outbox).start();
        handle.shutdown().await;
        handle.shutdown().await;
    }
}
