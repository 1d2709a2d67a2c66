//! The client side of the realtime pub/sub bus.
//!
//! Delivery is at-most-once. Events on one topic arrive in publish order per
//! publisher, with no ordering across topics or publishers. A subscriber may
//! receive its own publishes back; callers discard those with
//! [Delivery::is_from].

mod client;

pub use client::*;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{Delivery, EventKind, Id, PresenceRecord, Topic};

pub type SubscriptionId = Id<Subscription>;
pub type DeliverySender = UnboundedSender<Delivery>;
pub type DeliveryReceiver = UnboundedReceiver<Delivery>;

#[derive(Debug, Error)]
pub enum BusError {
    /// The bus is not reachable
    #[error("Bus is disconnected")]
    Disconnected,
    /// The subscription was closed or never existed
    #[error("Subscription {0} does not exist")]
    UnknownSubscription(SubscriptionId),
    /// A payload could not be encoded or decoded
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// Something else went wrong in the underlying transport
    #[error("Bus transport error: {0}")]
    Transport(String),
}

/// An open subscription to a topic.
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    pub receiver: DeliveryReceiver,
}

/// Represents a realtime bus the core can publish to and subscribe on.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Opens a subscription on a topic, delivering only the given kinds.
    /// Presence snapshots are delivered if `kinds` contains [EventKind::PresenceSync].
    async fn subscribe(&self, topic: &Topic, kinds: &[EventKind]) -> Result<Subscription, BusError>;

    /// Publishes an event to every subscriber of a topic, possibly including the publisher.
    async fn publish(&self, topic: &Topic, delivery: Delivery) -> Result<(), BusError>;

    /// Closes a subscription, dropping any presence record tracked through it.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Announces or replaces the presence record bound to a subscription.
    async fn track(&self, id: SubscriptionId, record: PresenceRecord) -> Result<(), BusError>;
}
