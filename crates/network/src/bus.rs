//! Subscription bus.
//!
//! A process-wide registry routing inbound frames to the in-flight session
//! that wants them, keyed by `(message type, session id)`. Subscribers are
//! added when a session starts and removed when it ends; a frame with no
//! subscriber is logged and dropped, never buffered.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::{InboundMessage, MessageType};
use crate::CHANNEL_DEPTH;

type SubscriberMap = HashMap<MessageType, HashMap<String, mpsc::Sender<InboundMessage>>>;

/// Routes inbound frames to session channels.
///
/// The mutex is held only for map mutation, never across I/O or sends that
/// could block (delivery uses `try_send`).
#[derive(Default)]
pub struct SubscriptionBus {
    subscribers: Mutex<SubscriberMap>,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under each of the given message types, all feeding
    /// one bounded channel.
    pub fn subscribe(&self, types: &[MessageType], msg_id: &str) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let mut subs = self.subscribers.lock().expect("bus lock poisoned");
        for t in types {
            subs.entry(*t)
                .or_default()
                .insert(msg_id.to_string(), tx.clone());
        }
        rx
    }

    /// Remove the session's channels. Message types left with no sessions are
    /// garbage-collected so the outer map never holds empty leaves.
    pub fn unsubscribe(&self, types: &[MessageType], msg_id: &str) {
        let mut subs = self.subscribers.lock().expect("bus lock poisoned");
        for t in types {
            if let Some(by_id) = subs.get_mut(t) {
                by_id.remove(msg_id);
                if by_id.is_empty() {
                    subs.remove(t);
                }
            }
        }
    }

    /// Route one inbound frame. Non-blocking: if the session is gone or its
    /// channel is full the frame is dropped with a log entry.
    pub fn deliver(&self, msg: InboundMessage) {
        let sender = {
            let subs = self.subscribers.lock().expect("bus lock poisoned");
            subs.get(&msg.wrapped.message_type)
                .and_then(|by_id| by_id.get(&msg.wrapped.msg_id))
                .cloned()
        };

        match sender {
            Some(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    warn!("dropping frame, subscriber channel unavailable: {}", e);
                }
            }
            None => {
                debug!(
                    "no subscriber for {} msg_id {}, dropping frame",
                    msg.wrapped.message_type, msg.wrapped.msg_id
                );
            }
        }
    }
}
