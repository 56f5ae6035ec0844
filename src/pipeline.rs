use crate::cache::CancellationCache;
use crate::config::Config;
use crate::darwin_subscriber::Backoff;
use crate::decoder;
use crate::enricher::{Enricher, EnrichmentStats};
use crate::subscriber::Subscriber;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const QUEUE_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded frame queue between the subscriber and the enrichment task.
/// On overflow the oldest queued frame is dropped so the freshest signal
/// survives back-pressure.
pub struct FrameQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> FrameQueue {
        FrameQueue {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns true when an older frame had to be dropped to make room.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = false;
        while frames.len() >= self.capacity {
            frames.pop_front();
            dropped = true;
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
        dropped
    }

    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode one frame and run every cancellation it carries through
/// enrichment into the cache.
pub async fn process_frame(
    body: &[u8],
    enricher: &Enricher,
    cache: &CancellationCache,
    stats: &EnrichmentStats,
) {
    match decoder::decode(body).await {
        Ok(summary) => {
            stats.decoded_total.fetch_add(1, Ordering::Relaxed);
            for event in summary.events {
                let cancellation = enricher.enrich(event);
                cache.insert(cancellation);
            }
        }
        Err(e) => {
            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "pipeline", error = %e, "dropping undecodable frame");
        }
    }
}

/// The two long-running ingestion tasks plus their shutdown plumbing.
pub struct Pipeline {
    queue: Arc<FrameQueue>,
    shutdown: watch::Sender<bool>,
    subscriber_task: JoinHandle<()>,
    enricher_task: JoinHandle<()>,
}

impl Pipeline {
    pub fn spawn<S: Subscriber + 'static>(
        config: &Config,
        mut subscriber: S,
        enricher: Enricher,
        cache: Arc<CancellationCache>,
        stats: Arc<EnrichmentStats>,
    ) -> Pipeline {
        let queue = Arc::new(FrameQueue::new(QUEUE_CAPACITY));
        let (shutdown, mut subscriber_shutdown) = watch::channel(false);
        let mut enricher_shutdown = shutdown.subscribe();

        let backoff_cap = config.broker.backoff_max_ms;
        let subscriber_queue = queue.clone();
        let subscriber_stats = stats.clone();
        let subscriber_task = tokio::spawn(async move {
            let mut backoff = Backoff::new(backoff_cap);
            let mut last_drop_warn: Option<Instant> = None;
            'outer: loop {
                if *subscriber_shutdown.borrow() {
                    break;
                }
                let connected = tokio::select! {
                    _ = subscriber_shutdown.changed() => break 'outer,
                    connected = subscriber.subscribe() => connected,
                };
                let delay = match connected {
                    Ok(()) => {
                        loop {
                            let received = tokio::select! {
                                _ = subscriber_shutdown.changed() => break 'outer,
                                received = subscriber.receive() => received,
                            };
                            match received {
                                Ok(frame) => {
                                    backoff.reset();
                                    if subscriber_queue.push(frame) {
                                        subscriber_stats
                                            .failures_store_error
                                            .fetch_add(1, Ordering::Relaxed);
                                        let warn_due = last_drop_warn
                                            .map(|at| at.elapsed() >= DROP_WARN_INTERVAL)
                                            .unwrap_or(true);
                                        if warn_due {
                                            last_drop_warn = Some(Instant::now());
                                            tracing::warn!(
                                                target: "pipeline",
                                                "frame queue full, dropping oldest events"
                                            );
                                        }
                                    }
                                }
                                Err(e) => {
                                    subscriber.mark_reconnecting();
                                    let delay = if e.is_authentication() {
                                        backoff.next_delay_after_auth_failure()
                                    } else {
                                        backoff.next_delay()
                                    };
                                    tracing::warn!(
                                        target: "subscriber",
                                        error = %e,
                                        delay_ms = delay.as_millis() as u64,
                                        "read failed, reconnecting"
                                    );
                                    break delay;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        subscriber.mark_reconnecting();
                        let delay = if e.is_authentication() {
                            backoff.next_delay_after_auth_failure()
                        } else {
                            backoff.next_delay()
                        };
                        tracing::warn!(
                            target: "subscriber",
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "connect failed, backing off"
                        );
                        delay
                    }
                };
                tokio::select! {
                    _ = subscriber_shutdown.changed() => break 'outer,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            subscriber.shutdown(SHUTDOWN_GRACE).await;
        });

        let enricher_queue = queue.clone();
        let enricher_cache = cache;
        let enricher_stats = stats;
        let enricher_task = tokio::spawn(async move {
            let mut purge = tokio::time::interval(PURGE_INTERVAL);
            purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = enricher_shutdown.changed() => break,
                    _ = purge.tick() => {
                        let removed = enricher_cache.purge_expired();
                        if removed > 0 {
                            tracing::info!(target: "pipeline", removed, "purged expired cancellations");
                        }
                    }
                    frame = enricher_queue.pop() => {
                        let Some(frame) = frame else { break };
                        process_frame(&frame, &enricher, &enricher_cache, &enricher_stats).await;
                    }
                }
            }
        });

        Pipeline {
            queue,
            shutdown,
            subscriber_task,
            enricher_task,
        }
    }

    pub fn queue(&self) -> Arc<FrameQueue> {
        self.queue.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.queue.close();
        let _ = self.subscriber_task.await;
        let _ = self.enricher_task.await;
    }
}
