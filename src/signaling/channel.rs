use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::{topic_for, SignalingMessage};
use crate::error::{ProctorError, Result};

/// Publish/subscribe bus keyed by quiz. Every subscriber of a quiz sees every
/// message published to it, its own included; receivers filter on `receiver`.
///
/// Messages from one publisher reach each subscriber in publish order. No
/// ordering holds across publishers and nothing is retried.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn publish(&self, quiz_id: &str, message: SignalingMessage) -> Result<()>;

    async fn subscribe(&self, quiz_id: &str) -> Result<Subscription>;
}

/// Live registration on a quiz topic. Dropping it unsubscribes.
pub struct Subscription {
    quiz_id: String,
    receiver: mpsc::UnboundedReceiver<SignalingMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        quiz_id: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<SignalingMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            quiz_id: quiz_id.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn quiz_id(&self) -> &str {
        &self.quiz_id
    }

    /// Next message on the topic, or `None` once the channel side is gone.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<SignalingMessage>,
}

type Topics = HashMap<String, Vec<Subscriber>>;

/// In-process fan-out hub. Backs the relay server and in-process tests.
pub struct SignalHub {
    topics: Arc<Mutex<Topics>>,
    next_id: AtomicU64,
}

impl SignalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscriber_count(&self, quiz_id: &str) -> usize {
        lock_topics(&self.topics)
            .get(&topic_for(quiz_id))
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

fn lock_topics(topics: &Mutex<Topics>) -> MutexGuard<'_, Topics> {
    topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SignalingChannel for SignalHub {
    async fn publish(&self, quiz_id: &str, message: SignalingMessage) -> Result<()> {
        if message.quiz_id != quiz_id {
            return Err(ProctorError::InvalidSignalingMessage(format!(
                "message for quiz {} published on quiz {}",
                message.quiz_id, quiz_id
            )));
        }

        let topic = topic_for(quiz_id);
        let mut topics = lock_topics(&self.topics);
        let Some(subscribers) = topics.get_mut(&topic) else {
            tracing::debug!(topic = %topic, "No subscribers, dropping signal");
            return Ok(());
        };

        subscribers.retain(|sub| sub.sender.send(message.clone()).is_ok());

        tracing::trace!(
            topic = %topic,
            kind = ?message.kind,
            sender = %message.sender,
            receiver = %message.receiver,
            subscribers = subscribers.len(),
            "Signal relayed"
        );

        if subscribers.is_empty() {
            topics.remove(&topic);
        }
        Ok(())
    }

    async fn subscribe(&self, quiz_id: &str) -> Result<Subscription> {
        let topic = topic_for(quiz_id);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        lock_topics(&self.topics)
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, sender });

        tracing::debug!(topic = %topic, subscriber = id, "Subscribed to signaling topic");

        let topics = Arc::clone(&self.topics);
        Ok(Subscription::new(quiz_id, receiver, move || {
            let mut topics = lock_topics(&topics);
            if let Some(subscribers) = topics.get_mut(&topic) {
                subscribers.retain(|sub| sub.id != id);
                if subscribers.is_empty() {
                    topics.remove(&topic);
                }
            }
            tracing::debug!(topic = %topic, subscriber = id, "Unsubscribed from signaling topic");
        }))
    }
}
