//! Typed event bus between the engine and the shell.
//!
//! The engine never calls back into the shell; all progress flows through
//! [`EventBus::publish`] to every live [`Subscriber`]. Each subscriber owns
//! a bounded queue so a stalled consumer can never block the engine: when a
//! queue is full, the oldest *progress-class* event is dropped to make room.
//! Terminal events (completion, cancellation) are never dropped — the queue
//! is allowed to exceed its bound for those.
//!
//! Within one job, `page-processed` events arrive in ascending page order;
//! the engine's dispatcher guarantees this before publishing.

use crate::error::PageFailure;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default per-subscriber queue bound.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Batch status as carried on progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
    Cancelling,
}

/// One system dependency as reported by the platform probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub installed: bool,
    pub version: Option<String>,
    pub required: bool,
    pub description: String,
    pub error: Option<String>,
}

/// Result of `check_system_dependencies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyReport {
    pub os: String,
    pub arch: String,
    pub dependencies: Vec<DependencyStatus>,
}

/// Every event the engine publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum Event {
    DocumentLoaded {
        path: String,
        title: String,
        page_count: u32,
    },
    ProcessingProgress {
        total: usize,
        processed: usize,
        current_page: u32,
        status: JobStatus,
    },
    ProcessingPaused,
    ProcessingResumed,
    ProcessingCancelled,
    ProcessingComplete {
        total: usize,
        processed: usize,
    },
    ProcessingError {
        error: PageFailure,
    },
    PageProcessed {
        page_number: u32,
        from_cache: bool,
    },
    AiPageProcessed {
        page_number: u32,
        from_cache: bool,
    },
    AiProcessingComplete {
        total: usize,
        processed: usize,
    },
    AiProcessingError {
        error: PageFailure,
    },
    PageTextUpdated {
        page_number: u32,
        kind: crate::document::TextKind,
    },
    DependencyCheck {
        report: DependencyReport,
    },
    HistoryRecordDeleted {
        record_id: i64,
    },
}

impl Event {
    /// Terminal events mark the end of a batch and must never be dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ProcessingComplete { .. }
                | Event::ProcessingCancelled
                | Event::AiProcessingComplete { .. }
        )
    }

    /// Progress-class events are safe to shed under backpressure.
    pub fn is_progress_class(&self) -> bool {
        matches!(
            self,
            Event::ProcessingProgress { .. }
                | Event::PageProcessed { .. }
                | Event::AiPageProcessed { .. }
        )
    }

    /// Kebab-case topic name, matching the serialized `topic` tag.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::DocumentLoaded { .. } => "document-loaded",
            Event::ProcessingProgress { .. } => "processing-progress",
            Event::ProcessingPaused => "processing-paused",
            Event::ProcessingResumed => "processing-resumed",
            Event::ProcessingCancelled => "processing-cancelled",
            Event::ProcessingComplete { .. } => "processing-complete",
            Event::ProcessingError { .. } => "processing-error",
            Event::PageProcessed { .. } => "page-processed",
            Event::AiPageProcessed { .. } => "ai-page-processed",
            Event::AiProcessingComplete { .. } => "ai-processing-complete",
            Event::AiProcessingError { .. } => "ai-processing-error",
            Event::PageTextUpdated { .. } => "page-text-updated",
            Event::DependencyCheck { .. } => "dependency-check",
            Event::HistoryRecordDeleted { .. } => "history-record-deleted",
        }
    }
}

struct SubscriberQueue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    detached: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: Event) {
        let mut queue = self.events.lock().expect("event queue poisoned");
        if queue.len() >= self.capacity {
            if event.is_progress_class() {
                // Shed the oldest progress event; if the queue somehow holds
                // only non-progress events, shed the incoming one instead.
                if let Some(pos) = queue.iter().position(|e| e.is_progress_class()) {
                    queue.remove(pos);
                } else {
                    return;
                }
            }
            // Terminal and other control events exceed the bound rather
            // than get lost.
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Receiving half handed to the shell.
///
/// Dropping the subscriber detaches it; the bus prunes detached queues on
/// the next publish.
pub struct Subscriber {
    queue: Arc<SubscriberQueue>,
}

impl Subscriber {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue
            .events
            .lock()
            .expect("event queue poisoned")
            .pop_front()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::Release);
    }
}

/// Process-wide event publisher.
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber; it receives events published after this
    /// call, in publish order.
    pub fn subscribe(&self) -> Subscriber {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            detached: AtomicBool::new(false),
        });
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(queue.clone());
        Subscriber { queue }
    }

    /// Publish to every live subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        tracing::debug!(topic = event.topic(), "event");
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|q| !q.detached.load(Ordering::Acquire));
        for queue in subscribers.iter() {
            queue.push(event.clone());
        }
    }

    /// Number of live subscribers (for diagnostics).
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|q| !q.detached.load(Ordering::Acquire));
        subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn progress(n: usize) -> Event {
        Event::ProcessingProgress {
            total: 10,
            processed: n,
            current_page: n as u32,
            status: JobStatus::Running,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(progress(1));
        bus.publish(Event::PageProcessed {
            page_number: 1,
            from_cache: false,
        });

        assert!(matches!(sub.recv().await, Event::ProcessingProgress { processed: 1, .. }));
        assert!(matches!(sub.recv().await, Event::PageProcessed { page_number: 1, .. }));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_progress_event() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        bus.publish(progress(1));
        bus.publish(progress(2));
        bus.publish(progress(3));

        assert!(matches!(sub.recv().await, Event::ProcessingProgress { processed: 2, .. }));
        assert!(matches!(sub.recv().await, Event::ProcessingProgress { processed: 3, .. }));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn terminal_events_survive_overflow() {
        let bus = EventBus::with_capacity(1);
        let mut sub = bus.subscribe();
        bus.publish(progress(1));
        bus.publish(Event::ProcessingComplete {
            total: 1,
            processed: 1,
        });

        // The progress event is still first; the terminal event exceeded the
        // bound rather than being dropped.
        assert!(matches!(sub.recv().await, Event::ProcessingProgress { .. }));
        assert!(matches!(sub.recv().await, Event::ProcessingComplete { .. }));
    }

    #[tokio::test]
    async fn error_events_are_not_shed_for_progress() {
        let bus = EventBus::with_capacity(1);
        let mut sub = bus.subscribe();
        bus.publish(Event::ProcessingError {
            error: PageFailure::new(1, ErrorKind::Network, "boom"),
        });
        // Queue is full of a non-progress event; the incoming progress event
        // is the one shed.
        bus.publish(progress(1));

        assert!(matches!(sub.recv().await, Event::ProcessingError { .. }));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(Event::ProcessingPaused);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn topic_names_match_serialized_tag() {
        let event = Event::PageProcessed {
            page_number: 2,
            from_cache: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""topic":"page-processed""#));
        assert_eq!(event.topic(), "page-processed");
    }
}
