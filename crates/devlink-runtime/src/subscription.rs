//! Telemetry subscribers.
//!
//! Every subscription owns a bounded queue and a worker task that feeds
//! queued events to its handler one at a time. Handlers never run on the
//! dispatch path, so a slow or failing handler only affects its own queue.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use devlink_core::{PluginId, TelemetryEvent, TopicPattern};

/// Receives telemetry events for one subscription.
#[async_trait]
pub trait TelemetryHandler: Send + Sync + 'static {
    async fn handle(&self, event: TelemetryEvent);
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`TelemetryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TelemetryEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TelemetryHandler for FnHandler<F>
where
    F: Fn(TelemetryEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: TelemetryEvent) {
        (self.0)(event).await
    }
}

/// Forwards events into a channel, for consumers that prefer a stream.
pub struct ChannelHandler {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TelemetryHandler for ChannelHandler {
    async fn handle(&self, event: TelemetryEvent) {
        // Receiver gone means the consumer lost interest.
        let _ = self.tx.send(event).await;
    }
}

/// Counters shared by the bus and subscriber workers.
#[derive(Debug, Default)]
pub(crate) struct BusStats {
    pub delivered: AtomicU64,
    pub duplicates: AtomicU64,
    pub stale_epoch: AtomicU64,
    pub dropped: AtomicU64,
    pub rejected_commands: AtomicU64,
    pub handler_panics: AtomicU64,
}

/// One registered subscription.
pub(crate) struct Subscriber {
    pub id: u64,
    pub pattern: TopicPattern,
    pub owner: Option<PluginId>,
    /// Maximum queued events per topic.
    per_topic: usize,
    queue: Mutex<VecDeque<TelemetryEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(id: u64, pattern: TopicPattern, owner: Option<PluginId>, per_topic: usize) -> Self {
        Self {
            id,
            pattern,
            owner,
            per_topic: per_topic.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an event. Returns `true` when the oldest queued event on the
    /// same topic had to be dropped to make room.
    pub fn push(&self, event: TelemetryEvent) -> bool {
        let mut queue = self.lock();
        let mut dropped = false;

        let queued = queue.iter().filter(|e| e.topic == event.topic).count();
        if queued >= self.per_topic {
            if let Some(oldest) = queue.iter().position(|e| e.topic == event.topic) {
                queue.remove(oldest);
                dropped = true;
            }
        }
        queue.push_back(event);
        drop(queue);

        self.notify.notify_one();
        dropped
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn next(&self) -> Option<TelemetryEvent> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(event) = self.lock().pop_front() {
                return Some(event);
            }
            self.notify.notified().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TelemetryEvent>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run `handler` over everything queued for `subscriber` until it is closed.
pub(crate) fn spawn_worker(
    subscriber: Arc<Subscriber>,
    handler: Arc<dyn TelemetryHandler>,
    stats: Arc<BusStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscriber.next().await {
            let topic = event.topic.clone();
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            if outcome.is_err() {
                stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                match &subscriber.owner {
                    Some(owner) => error!(
                        "Handler of plugin '{}' panicked on '{}'",
                        owner, topic
                    ),
                    None => error!("Subscriber {} panicked on '{}'", subscriber.id, topic),
                }
            }
        }
        debug!("Subscriber {} ({}) stopped", subscriber.id, subscriber.pattern);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(topic: &str, seq: u64) -> TelemetryEvent {
        TelemetryEvent::new(topic, seq, json!(seq))
    }

    fn subscriber(per_topic: usize) -> Subscriber {
        Subscriber::new(1, TopicPattern::new("*").unwrap(), None, per_topic)
    }

    #[test]
    fn test_push_drops_oldest_of_same_topic() {
        let sub = subscriber(2);
        assert!(!sub.push(event("wifi/rssi", 1)));
        assert!(!sub.push(event("mqtt/state", 1)));
        assert!(!sub.push(event("wifi/rssi", 2)));
        assert!(sub.push(event("wifi/rssi", 3)));

        let queued: Vec<(String, u64)> = sub
            .lock()
            .iter()
            .map(|e| (e.topic.clone(), e.seq))
            .collect();
        assert_eq!(
            queued,
            vec![
                ("mqtt/state".to_string(), 1),
                ("wifi/rssi".to_string(), 2),
                ("wifi/rssi".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_clear() {
        let sub = subscriber(4);
        sub.push(event("wifi/rssi", 1));
        sub.clear();
        assert!(sub.lock().is_empty());
    }

    #[tokio::test]
    async fn test_worker_runs_handler_in_order() {
        let sub = Arc::new(subscriber(8));
        let stats = Arc::new(BusStats::default());
        let (handler, mut rx) = ChannelHandler::new(8);
        let worker = spawn_worker(sub.clone(), Arc::new(handler), stats);

        for seq in 1..=3 {
            sub.push(event("wifi/rssi", seq));
        }
        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().seq, expected);
        }

        sub.close();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_handler() {
        let sub = Arc::new(subscriber(8));
        let stats = Arc::new(BusStats::default());
        let (tx, mut rx) = mpsc::channel(8);
        let handler = handler_fn(move |event: TelemetryEvent| {
            let tx = tx.clone();
            async move {
                if event.seq == 1 {
                    panic!("handler failure");
                }
                let _ = tx.send(event.seq).await;
            }
        });
        let worker = spawn_worker(sub.clone(), Arc::new(handler), stats.clone());

        sub.push(event("wifi/rssi", 1));
        sub.push(event("wifi/rssi", 2));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(stats.handler_panics.load(Ordering::Relaxed), 1);

        sub.close();
        worker.await.unwrap();
    }
}
