//! Billing event broadcasting.
//!
//! The engine publishes an event after each recorded request so external
//! billing and monitoring consumers can follow along without polling.
//! Publishing is fire and forget: a full or subscriber-less channel never
//! affects the recording path.
//!
//! # Example
//!
//! ```ignore
//! // Publishing an event
//! event_bus.publish(BillingEvent::UsageRecorded { ... });
//!
//! // Subscribing to events
//! let mut rx = event_bus.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     // Handle event
//! }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::AccountKind;
use crate::pricing::CostBreakdown;

/// Default channel capacity for the event bus.
/// This determines how many events can be buffered before slow receivers
/// start missing events (lagging).
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Events broadcast to billing and monitoring subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BillingEvent {
    /// Usage was recorded for a request served under a key.
    UsageRecorded {
        key_id: Uuid,
        timestamp: DateTime<Utc>,
        model: String,
        account_id: Option<String>,
        account_kind: Option<AccountKind>,
        input_tokens: i64,
        output_tokens: i64,
        cache_create_tokens: i64,
        cache_read_tokens: i64,
        cost: CostBreakdown,
    },

    /// A dormant key was activated by its first validated use.
    KeyActivated {
        key_id: Uuid,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

impl BillingEvent {
    /// Get the event type name as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::UsageRecorded { .. } => "usage_recorded",
            BillingEvent::KeyActivated { .. } => "key_activated",
        }
    }
}

/// Central event bus for broadcasting billing events.
///
/// Uses a tokio broadcast channel to allow multiple subscribers to receive
/// the same events. Events are cloned for each subscriber. Clones share
/// the channel and the counters.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BillingEvent>,
    /// Counter for total events published (for metrics)
    events_published: Arc<AtomicU64>,
    /// Counter for events dropped due to no subscribers
    events_dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: Arc::new(AtomicU64::new(0)),
            events_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, the event is dropped and 0 is returned.
    pub fn publish(&self, event: BillingEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);

        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                // No active subscribers, event is dropped
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Subscribe to events from this bus.
    ///
    /// Returns a receiver that can be used to receive events.
    /// If the receiver falls behind, it will receive `RecvError::Lagged`
    /// indicating how many events were missed.
    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.sender.subscribe()
    }

    /// Get the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the total number of events published.
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Get the number of events dropped (no subscribers).
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
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

    fn usage_event() -> BillingEvent {
        BillingEvent::UsageRecorded {
            key_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            model: "claude-sonnet-4".to_string(),
            account_id: Some("acct-1".to_string()),
            account_kind: Some(AccountKind::Claude),
            input_tokens: 100,
            output_tokens: 50,
            cache_create_tokens: 0,
            cache_read_tokens: 0,
            cost: CostBreakdown {
                input_microcents: 300,
                output_microcents: 750,
                cache_create_microcents: 0,
                cache_read_microcents: 0,
                total_microcents: 1_050,
            },
        }
    }

    #[test]
    fn test_event_bus_new() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.events_published(), 0);
        assert_eq!(bus.events_dropped(), 0);
    }

    #[test]
    fn test_event_bus_publish_no_subscribers() {
        let bus = EventBus::new();

        let count = bus.publish(usage_event());
        assert_eq!(count, 0);
        assert_eq!(bus.events_published(), 1);
        assert_eq!(bus.events_dropped(), 1);
    }

    #[tokio::test]
    async fn test_event_bus_subscribe_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 1);

        let count = bus.publish(usage_event());
        assert_eq!(count, 1);
        assert_eq!(bus.events_published(), 1);
        assert_eq!(bus.events_dropped(), 0);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "usage_recorded");
    }

    #[tokio::test]
    async fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let mut rx3 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 3);

        let event = BillingEvent::KeyActivated {
            key_id: Uuid::new_v4(),
            activated_at: Utc::now(),
            expires_at: Utc::now(),
        };

        let count = bus.publish(event);
        assert_eq!(count, 3);

        // All subscribers should receive the event
        let r1 = rx1.recv().await.unwrap();
        let r2 = rx2.recv().await.unwrap();
        let r3 = rx3.recv().await.unwrap();

        assert_eq!(r1.event_type(), "key_activated");
        assert_eq!(r2.event_type(), "key_activated");
        assert_eq!(r3.event_type(), "key_activated");
    }

    #[tokio::test]
    async fn test_event_bus_subscriber_drop() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx2);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_bus_clone() {
        let bus1 = EventBus::new();
        let _rx = bus1.subscribe();

        let bus2 = bus1.clone();

        // Both should see the same subscriber count (shared channel)
        assert_eq!(bus1.subscriber_count(), 1);
        assert_eq!(bus2.subscriber_count(), 1);

        // Publishing on either should reach all subscribers
        let count = bus2.publish(usage_event());
        assert_eq!(count, 1);

        // Counters are shared too, not per-clone snapshots
        assert_eq!(bus1.events_published(), 1);
        assert_eq!(bus2.events_published(), 1);
        drop(_rx);
        bus1.publish(usage_event());
        assert_eq!(bus2.events_published(), 2);
        assert_eq!(bus2.events_dropped(), 1);
    }

    #[test]
    fn test_billing_event_serialization() {
        let event = usage_event();

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"usage_recorded\""));
        assert!(json.contains("\"account_kind\":\"claude\""));

        let parsed: BillingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "usage_recorded");
    }

    #[tokio::test]
    async fn test_event_bus_lagged_subscriber() {
        // Create a small capacity bus to force lagging
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        // Publish more events than capacity
        for _ in 0..5 {
            bus.publish(usage_event());
        }

        // First receive should report lagged
        let result = rx.recv().await;
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        // Should still be able to receive remaining events
        let result = rx.recv().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_event_bus_publish_increments_counter() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();

        for _ in 0..5 {
            bus.publish(usage_event());
        }

        assert_eq!(bus.events_published(), 5);
        assert_eq!(bus.events_dropped(), 0);
    }
}
