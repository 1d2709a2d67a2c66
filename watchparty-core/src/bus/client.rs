use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::{Delivery, EventKind, ParticipantId, PresenceRecord, Topic};

use super::{Bus, BusError, DeliveryReceiver, SubscriptionId};

/// A thin wrapper around a [Bus], encoding payloads and tying subscriptions to handles.
pub struct BusClient<B> {
    bus: Arc<B>,
}

/// A handle to an open subscription, which when dropped unsubscribes from the bus
pub struct SubscriptionHandle<B>
where
    B: Bus,
{
    id: SubscriptionId,
    topic: Topic,
    bus: Arc<B>,
    receiver: DeliveryReceiver,
}

impl<B> BusClient<B>
where
    B: Bus,
{
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }

    /// Subscribes to the given kinds of events on a topic.
    pub async fn subscribe(
        &self,
        topic: Topic,
        kinds: &[EventKind],
    ) -> Result<SubscriptionHandle<B>, BusError> {
        let subscription = self.bus.subscribe(&topic, kinds).await?;

        debug!("Subscribed to {} as {}", topic, subscription.id);

        Ok(SubscriptionHandle {
            id: subscription.id,
            topic,
            bus: self.bus.clone(),
            receiver: subscription.receiver,
        })
    }

    /// Publishes an event on behalf of a participant.
    pub async fn publish<T>(
        &self,
        topic: Topic,
        kind: EventKind,
        origin: ParticipantId,
        payload: &T,
    ) -> Result<(), BusError>
    where
        T: Serialize,
    {
        let delivery = Delivery::new(kind, Some(origin), payload)?;
        self.bus.publish(&topic, delivery).await
    }

    /// Announces a presence record through an open subscription.
    pub async fn track(&self, id: SubscriptionId, record: PresenceRecord) -> Result<(), BusError> {
        self.bus.track(id, record).await
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }
}

impl<B> SubscriptionHandle<B>
where
    B: Bus,
{
    /// Receives the next delivery.
    /// Returns `None` once the bus closed the subscription.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Returns a delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl<B> Drop for SubscriptionHandle<B>
where
    B: Bus,
{
    fn drop(&mut self) {
        debug!("Unsubscribing {} from {}", self.id, self.topic);
        self.bus.unsubscribe(self.id)
    }
}

impl<B> Clone for BusClient<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
        }
    }
}
