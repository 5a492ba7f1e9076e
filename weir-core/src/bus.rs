use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::Result;

/// Binding of a consumer queue to an exchange and a routing-key pattern.
///
/// Patterns follow topic-exchange semantics restricted to what the control
/// plane uses: dot-separated segments with an optional trailing `#` that
/// matches any remaining suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// A message taken off the bus. Bodies are UTF-8: JSON for metric payloads,
/// plain strings for bandwidth change records.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub body: String,
}

struct BoundQueue {
    queue: String,
    pattern: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// In-process message bus implementing the `(exchange, queue, routing key)`
/// transport contract the production broker deployment exposes.
#[derive(Clone, Default)]
pub struct MessageBus {
    exchanges: Arc<Mutex<HashMap<String, Vec<BoundQueue>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a queue and returns the receiving half of its channel.
    pub async fn consume(&self, binding: Binding) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut exchanges = self.exchanges.lock().await;
        let queues = exchanges.entry(binding.exchange.clone()).or_default();
        queues.push(BoundQueue {
            queue: binding.queue,
            pattern: binding.routing_key,
            sender: tx,
        });
        rx
    }

    /// Publishes a message to every queue whose pattern matches the routing
    /// key. Returns the number of queues the message was delivered to.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<String>,
    ) -> Result<usize> {
        let body = body.into();
        let mut exchanges = self.exchanges.lock().await;
        let queues = match exchanges.get_mut(exchange) {
            Some(queues) => queues,
            None => {
                debug!(exchange, routing_key, "publish to exchange without bindings");
                return Ok(0);
            }
        };

        let mut delivered = 0;
        queues.retain(|bound| {
            if !keys_match(&bound.pattern, routing_key) {
                return true;
            }
            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                body: body.clone(),
            };
            match bound.sender.send(delivery) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    warn!(queue = %bound.queue, "dropping binding for closed consumer");
                    false
                }
            }
        });

        Ok(delivered)
    }

}

/// Matches a binding pattern against a routing key. A `#` segment on either
/// side matches any remaining suffix.
fn keys_match(pattern: &str, key: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut key_segments = key.split('.');

    loop {
        match (pattern_segments.next(), key_segments.next()) {
            (Some("#"), _) | (_, Some("#")) => return true,
            (Some(p), Some(k)) if p == k => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Derives the node-scoped routing key a bandwidth change record is routed
/// on: colon and dot characters become hyphens, wildcard-suffixed so every
/// queue bound for the node receives it.
pub fn node_routing_key(node: &str) -> String {
    let sanitized: String = node
        .chars()
        .map(|c| if c == ':' || c == '.' { '-' } else { c })
        .collect();
    format!("{}.#", sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_suffix_matches_node_keys() {
        assert!(keys_match("192-168-1-5-6000.#", "192-168-1-5-6000.bw"));
        assert!(keys_match("192-168-1-5-6000.#", "192-168-1-5-6000.#"));
        assert!(!keys_match("192-168-1-5-6000.#", "192-168-1-6-6000.bw"));
        assert!(keys_match("metrics.get_ops", "metrics.get_ops"));
        assert!(!keys_match("metrics.get_ops", "metrics.put_ops"));
    }

    #[test]
    fn node_key_is_hyphenated_and_wildcarded() {
        assert_eq!(node_routing_key("192.168.1.5:6000"), "192-168-1-5-6000.#");
    }

    #[tokio::test]
    async fn publishes_to_matching_queues_only() {
        let bus = MessageBus::new();
        let mut rx_a = bus
            .consume(Binding::new("metrics", "hub-a", "metrics.get_ops"))
            .await;
        let mut rx_b = bus
            .consume(Binding::new("metrics", "hub-b", "metrics.put_ops"))
            .await;

        let delivered = bus
            .publish("metrics", "metrics.get_ops", "{\"t1\": 3}")
            .await
            .expect("publish");
        assert_eq!(delivered, 1);

        let delivery = rx_a.recv().await.expect("delivery");
        assert_eq!(delivery.body, "{\"t1\": 3}");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_consumers_are_unbound() {
        let bus = MessageBus::new();
        let rx = bus
            .consume(Binding::new("metrics", "hub", "metrics.#"))
            .await;
        drop(rx);

        let delivered = bus.publish("metrics", "metrics.get_ops", "{}").await.unwrap();
        assert_eq!(delivered, 0);

        // The stale binding is gone; a fresh consumer is the only recipient.
        let mut fresh = bus
            .consume(Binding::new("metrics", "hub2", "metrics.#"))
            .await;
        let delivered = bus.publish("metrics", "metrics.get_ops", "{}").await.unwrap();
        assert_eq!(delivered, 1);
        assert!(fresh.recv().await.is_some());
    }
}
