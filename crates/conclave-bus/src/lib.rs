//! Topic-keyed pub/sub. The Router uses one topic per session to fan a
//! routed message out to every live member connection, plus a fixed
//! `"observer"` topic for the chatlist stream.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use conclave_schema::AgentMessage;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no subscribers on topic {0:?}")]
    NoSubscribers(String),
}

/// The observer socket's event envelope — every teamup and every routed
/// message, tagged with a discriminant, matching `send_to_frontend()`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "frontend_type", rename_all = "snake_case")]
pub enum FrontendEvent {
    Teamup {
        comm_id: Uuid,
        member_names: Vec<String>,
    },
    Message(AgentMessage),
}

/// A topic-keyed broadcast bus. Each topic is an independent
/// `tokio::sync::broadcast` channel created lazily on first
/// `subscribe`/`publish`; publishing to a topic with no subscribers is not
/// an error by default (`publish`), but `publish_required` surfaces it when
/// the caller needs to know delivery actually reached someone.
pub struct Bus<T: Clone + Send + 'static> {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<T> {
        let mut topics = self.topics.lock().expect("bus mutex poisoned");
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<T> {
        self.sender_for(topic).subscribe()
    }

    /// Publishes to `topic`. Returns the number of receivers that were sent
    /// the message (0 if nobody is currently subscribed — not an error,
    /// since a session with no live connections is an ordinary state:
    /// absent members simply miss the message).
    pub fn publish(&self, topic: &str, event: T) -> usize {
        match self.sender_for(topic).send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn publish_required(&self, topic: &str, event: T) -> Result<usize, BusError> {
        match self.publish(topic, event) {
            0 => Err(BusError::NoSubscribers(topic.to_owned())),
            n => Ok(n),
        }
    }

    /// Drops the topic's sender, hanging up every subscriber.
    pub fn close_topic(&self, topic: &str) {
        self.topics.lock().expect("bus mutex poisoned").remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("bus mutex poisoned")
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus: Bus<u32> = Bus::new(16);
        assert_eq!(bus.publish("no-one-home", 1), 0);
    }

    #[tokio::test]
    async fn publish_required_surfaces_no_subscribers() {
        let bus: Bus<u32> = Bus::new(16);
        let err = bus.publish_required("no-one-home", 1).unwrap_err();
        assert!(matches!(err, BusError::NoSubscribers(_)));
    }

    #[tokio::test]
    async fn subscribers_on_same_topic_all_receive() {
        let bus: Bus<u32> = Bus::new(16);
        let mut a = bus.subscribe("session-1");
        let mut b = bus.subscribe("session-1");
        let sent = bus.publish("session-1", 42);
        assert_eq!(sent, 2);
        assert_eq!(a.recv().await.unwrap(), 42);
        assert_eq!(b.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus: Bus<u32> = Bus::new(16);
        let mut a = bus.subscribe("session-1");
        let _b = bus.subscribe("session-2");
        bus.publish("session-2", 7);
        assert_eq!(bus.subscriber_count("session-1"), 1);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_topic_disconnects_subscribers() {
        let bus: Bus<u32> = Bus::new(16);
        let mut rx = bus.subscribe("session-1");
        bus.close_topic("session-1");
        assert_eq!(bus.subscriber_count("session-1"), 0);
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn frontend_event_message_variant_serializes_with_discriminant() {
        use conclave_schema::{CommunicationState, CommunicationType, NextSpeaker};

        let msg = AgentMessage {
            content: "hi".to_string(),
            sender: "alice".to_string(),
            comm_id: Uuid::new_v4(),
            next_speaker: NextSpeaker::single("bob"),
            state: CommunicationState::Discussion,
            message_type: CommunicationType::Default,
            proposal_id: None,
            goal: None,
            team_members: None,
            team_up_depth: None,
            task_id: None,
            task_desc: None,
            task_conclusion: None,
            task_abstract: None,
            triggers: Vec::new(),
            updated_plan: None,
            is_collaborative_planning_enabled: false,
            max_turns: None,
        };
        let event = FrontendEvent::Message(msg);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["frontend_type"], "message");
        assert_eq!(json["sender"], "alice");
    }
}
