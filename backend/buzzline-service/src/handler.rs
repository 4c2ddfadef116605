//! Consumer-side message handling.

use async_trait::async_trait;
use event_stream::{HandlerError, Message, MessageHandler, MESSAGE_ID_HEADER};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

const DEFAULT_DEDUP_WINDOW: usize = 10_000;

/// Logs each buzz once, skipping redeliveries whose `message_id` was already seen.
pub struct BuzzHandler {
    seen: Mutex<SeenIds>,
}

struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Returns false when `id` was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

impl BuzzHandler {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_DEDUP_WINDOW)
    }

    /// Remember the last `capacity` message ids.
    pub fn with_window(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(SeenIds {
                capacity: capacity.max(1),
                order: VecDeque::new(),
                ids: HashSet::new(),
            }),
        }
    }

    fn first_delivery(&self, message: &Message) -> Result<bool, HandlerError> {
        let Some(id) = message.header(MESSAGE_ID_HEADER) else {
            return Ok(true);
        };
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| HandlerError::transient("dedup window lock poisoned"))?;
        Ok(seen.insert(id))
    }
}

impl Default for BuzzHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for BuzzHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        debug!(
            partition = message.partition,
            offset = message.offset,
            payload = %message.payload_lossy(),
            "Received message"
        );

        let text = std::str::from_utf8(&message.payload)
            .map_err(|e| HandlerError::rejected(format!("payload is not UTF-8: {}", e)))?;

        if !self.first_delivery(message)? {
            info!(
                partition = message.partition,
                offset = message.offset,
                message_id = message.header(MESSAGE_ID_HEADER).unwrap_or_default(),
                "Skipping duplicate message"
            );
            return Ok(());
        }

        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            message = text,
            "Processing message"
        );
        Ok(())
    }
}
