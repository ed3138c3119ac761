use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::types::Event;

/// Sentinel topic receiving a copy of every pipeline event with
/// `pipeline_id` injected.
pub const ALL_PIPELINES: &str = "all_pipelines";
/// Sentinel topic receiving a copy of every terminal event with
/// `session_id` injected.
pub const ALL_TERMINALS: &str = "all_terminals";

const INBOX_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    dead: bool,
}

/// Identifies one subscription for `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberHandle {
    topic: String,
    id: u64,
}

impl SubscriberHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// In-process publish/subscribe fabric for pipeline and terminal events.
///
/// Topics are pipeline ids, terminal session ids, or one of the two sentinel
/// topics. Each subscriber gets a bounded inbox; a subscriber whose inbox is
/// full or whose receiver is gone is marked dead and swept on the next
/// publish. Publication never blocks and never fails.
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribe to a topic, creating it if unknown.
    pub async fn subscribe(&self, topic: &str) -> (SubscriberHandle, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().await;
        topics.entry(topic.to_string()).or_default().push(Subscriber {
            id,
            tx,
            dead: false,
        });
        (
            SubscriberHandle {
                topic: topic.to_string(),
                id,
            },
            rx,
        )
    }

    /// Publish a pipeline event: delivered to subscribers of `pipeline_id`
    /// and, with `pipeline_id` injected, to subscribers of `all_pipelines`.
    pub async fn publish(&self, pipeline_id: &str, event: Event) {
        let mut tagged = event.clone();
        tagged.pipeline_id = Some(pipeline_id.to_string());
        let mut topics = self.topics.lock().await;
        Self::fanout(&mut topics, pipeline_id, &event);
        Self::fanout(&mut topics, ALL_PIPELINES, &tagged);
    }

    /// Publish a terminal event: delivered to subscribers of `session_id`
    /// and, with `session_id` injected, to subscribers of `all_terminals`.
    pub async fn publish_terminal(&self, session_id: &str, event: Event) {
        let mut tagged = event.clone();
        tagged.session_id = Some(session_id.to_string());
        let mut topics = self.topics.lock().await;
        Self::fanout(&mut topics, session_id, &event);
        Self::fanout(&mut topics, ALL_TERMINALS, &tagged);
    }

    fn fanout(topics: &mut HashMap<String, Vec<Subscriber>>, topic: &str, event: &Event) {
        let Some(subs) = topics.get_mut(topic) else {
            return;
        };
        // Sweep subscribers evicted by a previous publish before delivering.
        subs.retain(|s| !s.dead);
        for sub in subs.iter_mut() {
            if sub.tx.try_send(event.clone()).is_err() {
                debug!(topic, subscriber = sub.id, "evicting slow or dead subscriber");
                sub.dead = true;
            }
        }
    }

    /// Idempotent. Dropping the last subscriber of a non-sentinel topic drops
    /// the topic itself.
    pub async fn disconnect(&self, handle: &SubscriberHandle) {
        let mut topics = self.topics.lock().await;
        if let Some(subs) = topics.get_mut(&handle.topic) {
            subs.retain(|s| s.id != handle.id);
            if subs.is_empty() && handle.topic != ALL_PIPELINES && handle.topic != ALL_TERMINALS {
                topics.remove(&handle.topic);
            }
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.dead).count())
            .unwrap_or(0)
    }

    /// Live subscriber count per topic, for the ingress status endpoint.
    pub async fn stats(&self) -> HashMap<String, usize> {
        let topics = self.topics.lock().await;
        topics
            .iter()
            .map(|(topic, subs)| {
                (
                    topic.clone(),
                    subs.iter().filter(|s| !s.dead).count(),
                )
            })
            .collect()
    }
}
