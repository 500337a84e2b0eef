//! Topic-addressed event bus with last-state replay
//!
//! Topics are typed `state` or `event`. State topics cache the last message
//! and replay it to new subscribers before anything else; event topics are
//! fire-and-forget. High-volume progress topics go through a small
//! timer-coalescing debouncer that always lets terminal values through
//! immediately.
//!
//! Adapters are expected to verify a subscriber's credentials once, before
//! calling [`EventBus::subscribe`]; the bus itself delivers to anyone holding
//! a subscription.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::types::{HistoryItem, JobId, QueueItem};

/// Channel capacity per topic; a subscriber lagging further than this drops
/// the oldest messages (broadcast semantics)
const CHANNEL_CAPACITY: usize = 256;

/// Coalescing window for debounced progress topics
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Progress value reserved for "finalizing" (aggregation committing);
/// treated as terminal alongside 100
pub const PROGRESS_FINALIZING: u16 = 200;

/// Topic kind: replayed state vs fire-and-forget event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    /// Last message cached and replayed on subscribe
    State,
    /// Fire-and-forget
    Event,
}

/// Event topics (names are the wire short codes)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `cxs` — connection activity (state)
    ConnectionActivity,
    /// `qp` — queue progress (state)
    QueueProgress,
    /// `qs` — queue status text (state)
    QueueStatus,
    /// `qa` — queue item added (event)
    QueueAdded,
    /// `qr` — queue item removed (event)
    QueueRemoved,
    /// `ha` — history item added (event)
    HistoryAdded,
    /// `hp` — health-sweep progress (state)
    HealthProgress,
    /// `hs` — health-sweep status (state)
    HealthStatus,
}

impl Topic {
    /// Every topic, in wire order
    pub const ALL: [Topic; 8] = [
        Topic::ConnectionActivity,
        Topic::QueueProgress,
        Topic::QueueStatus,
        Topic::QueueAdded,
        Topic::QueueRemoved,
        Topic::HistoryAdded,
        Topic::HealthProgress,
        Topic::HealthStatus,
    ];

    /// Wire short code
    pub fn code(self) -> &'static str {
        match self {
            Topic::ConnectionActivity => "cxs",
            Topic::QueueProgress => "qp",
            Topic::QueueStatus => "qs",
            Topic::QueueAdded => "qa",
            Topic::QueueRemoved => "qr",
            Topic::HistoryAdded => "ha",
            Topic::HealthProgress => "hp",
            Topic::HealthStatus => "hs",
        }
    }

    /// State topics replay their last message on subscribe
    pub fn kind(self) -> TopicKind {
        match self {
            Topic::QueueAdded | Topic::QueueRemoved | Topic::HistoryAdded => TopicKind::Event,
            _ => TopicKind::State,
        }
    }
}

/// Aggregate connection activity across all server pools
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionActivity {
    /// At least one connection lent out
    Live,
    /// Every pool is saturated
    Max,
    /// Nothing lent out
    Idle,
}

/// A message published on the bus
#[derive(Clone, Debug)]
pub enum Event {
    /// Connection activity changed
    ConnectionActivity {
        /// New aggregate state
        activity: ConnectionActivity,
    },
    /// Job progress (0–100; [`PROGRESS_FINALIZING`] while committing)
    QueueProgress {
        /// Job being processed
        id: JobId,
        /// Percent complete
        percent: u16,
    },
    /// Job status text changed
    QueueStatus {
        /// Job being processed
        id: JobId,
        /// Human-readable status
        status: String,
    },
    /// A job entered the queue
    QueueAdded {
        /// The queued job
        item: Box<QueueItem>,
    },
    /// A job left the queue
    QueueRemoved {
        /// The removed job's id
        id: JobId,
    },
    /// A history row was written
    HistoryAdded {
        /// The new history record
        item: Box<HistoryItem>,
    },
    /// Health-sweep progress for a job
    HealthProgress {
        /// Job being swept
        id: JobId,
        /// Fraction complete, 0.0–1.0
        fraction: f64,
    },
    /// Health-sweep status text
    HealthStatus {
        /// Human-readable status
        status: String,
    },
}

impl Event {
    /// Topic this event is addressed to
    pub fn topic(&self) -> Topic {
        match self {
            Event::ConnectionActivity { .. } => Topic::ConnectionActivity,
            Event::QueueProgress { .. } => Topic::QueueProgress,
            Event::QueueStatus { .. } => Topic::QueueStatus,
            Event::QueueAdded { .. } => Topic::QueueAdded,
            Event::QueueRemoved { .. } => Topic::QueueRemoved,
            Event::HistoryAdded { .. } => Topic::HistoryAdded,
            Event::HealthProgress { .. } => Topic::HealthProgress,
            Event::HealthStatus { .. } => Topic::HealthStatus,
        }
    }

    /// True for values the debouncer must never hold back
    fn is_terminal(&self) -> bool {
        match self {
            Event::QueueProgress { percent, .. } => {
                *percent >= 100 || *percent == PROGRESS_FINALIZING
            }
            Event::HealthProgress { fraction, .. } => *fraction >= 1.0,
            _ => true,
        }
    }
}

#[derive(Default)]
struct DebounceState {
    last_flush: Option<Instant>,
    pending: Option<Event>,
    flusher_scheduled: bool,
}

/// Topic-addressed fan-out with last-state replay
pub struct EventBus {
    channels: HashMap<Topic, broadcast::Sender<Event>>,
    last_state: DashMap<Topic, Event>,
    debounce: Mutex<HashMap<Topic, DebounceState>>,
}

impl EventBus {
    /// Create a bus with one channel per topic
    pub fn new() -> Arc<Self> {
        let channels = Topic::ALL
            .into_iter()
            .map(|t| (t, broadcast::channel(CHANNEL_CAPACITY).0))
            .collect();
        Arc::new(Self {
            channels,
            last_state: DashMap::new(),
            debounce: Mutex::new(HashMap::new()),
        })
    }

    /// Publish an event to its topic
    ///
    /// Absent subscribers are fine; state topics still update their replay
    /// slot.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        if topic.kind() == TopicKind::State {
            self.last_state.insert(topic, event.clone());
        }
        if let Some(sender) = self.channels.get(&topic) {
            sender.send(event).ok();
        }
    }

    /// Publish through the coalescing debouncer
    ///
    /// Non-terminal values within the window replace each other and flush
    /// once the window elapses; terminal values (100, finalizing, errored)
    /// flush immediately and discard anything pending.
    pub fn publish_debounced(self: &Arc<Self>, event: Event) {
        let topic = event.topic();
        let now = Instant::now();

        let mut states = self.lock_debounce();
        let state = states.entry(topic).or_default();

        if event.is_terminal() {
            state.pending = None;
            state.last_flush = Some(now);
            drop(states);
            self.publish(event);
            return;
        }

        let window_open = state
            .last_flush
            .is_none_or(|at| now.duration_since(at) >= DEBOUNCE_WINDOW);
        if window_open {
            state.last_flush = Some(now);
            drop(states);
            self.publish(event);
            return;
        }

        state.pending = Some(event);
        if !state.flusher_scheduled {
            state.flusher_scheduled = true;
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                let pending = {
                    let mut states = bus.lock_debounce();
                    let state = states.entry(topic).or_default();
                    state.flusher_scheduled = false;
                    state.last_flush = Some(Instant::now());
                    state.pending.take()
                };
                if let Some(event) = pending {
                    bus.publish(event);
                }
            });
        }
    }

    /// Subscribe to one topic
    ///
    /// For state topics the last published message (if any) is delivered
    /// first, before any subsequently published message.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = self
            .channels
            .get(&topic)
            .map(|s| s.subscribe())
            .unwrap_or_else(|| unreachable!("every topic has a channel"));
        let initial = if topic.kind() == TopicKind::State {
            self.last_state.get(&topic).map(|e| e.clone())
        } else {
            None
        };
        Subscription { initial, rx }
    }

    fn lock_debounce(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, DebounceState>> {
        self.debounce.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A live subscription to one topic
pub struct Subscription {
    initial: Option<Event>,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receive the next message; the cached state message comes first
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        if let Some(event) = self.initial.take() {
            return Ok(event);
        }
        self.rx.recv().await
    }

    /// Non-blocking receive (tests and polling adapters)
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        if let Some(event) = self.initial.take() {
            return Ok(event);
        }
        self.rx.try_recv()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_topic_replays_last_message_to_new_subscribers() {
        let bus = EventBus::new();
        bus.publish(Event::QueueStatus {
            id: JobId::new(),
            status: "first".into(),
        });
        bus.publish(Event::QueueStatus {
            id: JobId::new(),
            status: "second".into(),
        });

        let mut sub = bus.subscribe(Topic::QueueStatus);
        match sub.recv().await.unwrap() {
            Event::QueueStatus { status, .. } => assert_eq!(status, "second"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replay_precedes_subsequent_messages() {
        let bus = EventBus::new();
        bus.publish(Event::HealthStatus {
            status: "cached".into(),
        });
        let mut sub = bus.subscribe(Topic::HealthStatus);
        bus.publish(Event::HealthStatus {
            status: "after-subscribe".into(),
        });

        match sub.recv().await.unwrap() {
            Event::HealthStatus { status } => assert_eq!(status, "cached"),
            other => panic!("unexpected event: {other:?}"),
        }
        match sub.recv().await.unwrap() {
            Event::HealthStatus { status } => assert_eq!(status, "after-subscribe"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_topics_do_not_replay() {
        let bus = EventBus::new();
        bus.publish(Event::QueueRemoved { id: JobId::new() });
        let mut sub = bus.subscribe(Topic::QueueRemoved);
        assert!(sub.try_recv().is_err(), "event topics have no replay");
    }

    #[tokio::test]
    async fn terminal_progress_bypasses_the_debouncer() {
        let bus = EventBus::new();
        let id = JobId::new();
        let mut sub = bus.subscribe(Topic::QueueProgress);

        bus.publish_debounced(Event::QueueProgress { id, percent: 10 });
        // Inside the window: this one is held back
        bus.publish_debounced(Event::QueueProgress { id, percent: 20 });
        // Terminal: flushes immediately, discarding the pending 20
        bus.publish_debounced(Event::QueueProgress { id, percent: 100 });

        let first = sub.recv().await.unwrap();
        match first {
            Event::QueueProgress { percent, .. } => assert_eq!(percent, 10),
            other => panic!("unexpected event: {other:?}"),
        }
        let second = sub.recv().await.unwrap();
        match second {
            Event::QueueProgress { percent, .. } => {
                assert_eq!(percent, 100, "pending 20 must be discarded")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finalizing_sentinel_is_terminal() {
        let bus = EventBus::new();
        let id = JobId::new();
        let mut sub = bus.subscribe(Topic::QueueProgress);
        bus.publish_debounced(Event::QueueProgress { id, percent: 50 });
        bus.publish_debounced(Event::QueueProgress {
            id,
            percent: PROGRESS_FINALIZING,
        });
        sub.recv().await.unwrap();
        match sub.recv().await.unwrap() {
            Event::QueueProgress { percent, .. } => assert_eq!(percent, PROGRESS_FINALIZING),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn topic_codes_and_kinds() {
        assert_eq!(Topic::ConnectionActivity.code(), "cxs");
        assert_eq!(Topic::QueueProgress.code(), "qp");
        assert_eq!(Topic::HistoryAdded.code(), "ha");
        assert_eq!(Topic::QueueProgress.kind(), TopicKind::State);
        assert_eq!(Topic::QueueAdded.kind(), TopicKind::Event);
        assert_eq!(Topic::HealthStatus.kind(), TopicKind::State);
    }
}
