//! Bounded FIFO that decouples an external message source from the agent
//! loop's serialized per-conversation processing. See spec §4.6 and §5.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use spirit_memory::types::ExternalEvent;
use tracing::error;

/// Implemented by whatever drains the dispatcher — in practice the agent
/// loop's `process_event`. Kept as a trait here so this crate never depends
/// on `spirit-agent`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn process_event(&self, event: ExternalEvent) -> Result<String, String>;
}

/// Drop-oldest bounded queue of [`ExternalEvent`]s awaiting dispatch.
///
/// `push` never blocks and never fails: once `capacity` is reached the
/// oldest queued event is discarded to make room. The producer is an
/// unreliable external stream and the consumer is bounded by model latency,
/// so blocking or rejecting on overflow would just move the problem
/// upstream (see spec §9).
pub struct EventDispatcher {
    capacity: usize,
    queue: Mutex<VecDeque<ExternalEvent>>,
    draining: AtomicBool,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            draining: AtomicBool::new(false),
        }
    }

    /// Enqueues `event`, dropping the oldest queued event if already at
    /// capacity.
    pub fn push(&self, event: ExternalEvent) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the queue through `sink` one event at a time. Single-flighted:
    /// a call that finds a drain already in progress returns immediately,
    /// trusting the in-progress drain to pick up anything pushed meanwhile.
    /// A failing event is logged and does not stop the drain.
    pub async fn drain(&self, sink: &dyn EventSink) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            loop {
                let event = { self.queue.lock().unwrap().pop_front() };
                let Some(event) = event else { break };
                if let Err(e) = sink.process_event(event).await {
                    error!(error = %e, "event dispatcher: failed to process event, continuing drain");
                }
            }
            self.draining.store(false, Ordering::Release);
            // Close the race where an event was pushed after the inner loop's
            // last empty check but before the flag cleared.
            let more_work = !self.is_empty();
            if more_work && !self.draining.swap(true, Ordering::AcqRel) {
                continue;
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn event(content: &str) -> ExternalEvent {
        ExternalEvent {
            source: "test".to_string(),
            content: content.to_string(),
            metadata: serde_json::Map::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    struct CountingSink {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn process_event(&self, event: ExternalEvent) -> Result<String, String> {
            self.seen.lock().unwrap().push(event.content);
            Ok("ok".to_string())
        }
    }

    #[test]
    fn push_drops_oldest_when_over_capacity() {
        let dispatcher = EventDispatcher::new(2);
        dispatcher.push(event("a"));
        dispatcher.push(event("b"));
        dispatcher.push(event("c"));
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn drain_processes_every_queued_event_in_order() {
        let dispatcher = EventDispatcher::new(10);
        dispatcher.push(event("first"));
        dispatcher.push(event("second"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = CountingSink { seen: seen.clone() };
        dispatcher.drain(&sink).await;
        assert_eq!(&*seen.lock().unwrap(), &["first".to_string(), "second".to_string()]);
        assert!(dispatcher.is_empty());
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for FailingSink {
        async fn process_event(&self, _event: ExternalEvent) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("poisoned".to_string())
        }
    }

    #[tokio::test]
    async fn a_failing_event_does_not_stop_the_drain() {
        let dispatcher = EventDispatcher::new(10);
        dispatcher.push(event("a"));
        dispatcher.push(event("b"));
        let sink = FailingSink { calls: AtomicUsize::new(0) };
        dispatcher.drain(&sink).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.is_empty());
    }
}
