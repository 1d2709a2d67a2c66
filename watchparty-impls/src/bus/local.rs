use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use dashmap::{DashMap, DashSet};
use log::{debug, info};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use watchparty_core::{
    Bus, BusError, Config, Delivery, DeliverySender, EventKind, ParticipantId, PeriodicTask,
    PresenceRecord, Subscription, SubscriptionId, Topic,
};

/// An in-process realtime bus.
///
/// Publishes fan out to every subscriber of a topic, the publisher included.
/// Presence records are bound to the subscription that tracked them and
/// expire if they are not re-tracked within the presence timeout.
pub struct LocalBus {
    presence_timeout: Duration,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    presence: DashMap<Topic, HashMap<SubscriptionId, TrackedRecord>>,
    /// Subscriptions whose connection dropped, so their unsubscribes never arrive
    severed: DashSet<SubscriptionId>,
    partitioned: AtomicCell<bool>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

struct Subscriber {
    topic: Topic,
    kinds: Vec<EventKind>,
    sender: DeliverySender,
}

struct TrackedRecord {
    record: PresenceRecord,
    last_seen: Instant,
}

impl LocalBus {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(config: &Config) -> Arc<Self> {
        let bus = Arc::new(Self {
            presence_timeout: config.presence_timeout,
            subscribers: Default::default(),
            presence: Default::default(),
            severed: Default::default(),
            partitioned: AtomicCell::new(false),
            sweeper: Default::default(),
        });

        let weak = Arc::downgrade(&bus);
        let sweeper = PeriodicTask::spawn(Self::SWEEP_INTERVAL, move || sweep(&weak));
        *bus.sweeper.lock() = Some(sweeper);

        bus
    }

    /// Drops the subscriptions that track a participant's presence without
    /// unsubscribing, like a closed tab. Its presence record lingers until it times out.
    ///
    /// Subscriptions are not bound to participants, so subscriptions that never
    /// tracked the participant stay open.
    pub fn sever(&self, participant_id: ParticipantId) {
        let severed: Vec<_> = self
            .presence
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|(_, tracked)| tracked.record.id == participant_id)
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>()
            })
            .collect();

        for id in severed {
            self.subscribers.remove(&id);
            self.severed.insert(id);
        }

        info!("Severed the connection of {}", participant_id);
    }

    /// While partitioned, publishes are accepted but silently dropped.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned);
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers
            .iter()
            .filter(|s| &s.value().topic == topic)
            .count()
    }

    /// The presence snapshot of a topic, one record per participant.
    pub fn snapshot(&self, topic: &Topic) -> Vec<PresenceRecord> {
        let mut latest: HashMap<ParticipantId, PresenceRecord> = HashMap::new();

        if let Some(tracked) = self.presence.get(topic) {
            for t in tracked.values() {
                latest
                    .entry(t.record.id)
                    .and_modify(|r| {
                        if t.record.online_at > r.online_at {
                            *r = t.record.clone();
                        }
                    })
                    .or_insert_with(|| t.record.clone());
            }
        }

        let mut records: Vec<_> = latest.into_values().collect();
        records.sort_by(|a, b| a.online_at.cmp(&b.online_at).then(a.id.cmp(&b.id)));

        records
    }

    fn deliver(&self, topic: &Topic, delivery: &Delivery) {
        for subscriber in self.subscribers.iter() {
            if &subscriber.topic == topic && subscriber.kinds.contains(&delivery.kind) {
                let _ = subscriber.sender.send(delivery.clone());
            }
        }
    }

    fn sync(&self, topic: &Topic) {
        let snapshot = self.snapshot(topic);

        match Delivery::new(EventKind::PresenceSync, None, &snapshot) {
            Ok(delivery) => {
                debug!("Syncing {} participants on {}", snapshot.len(), topic);
                self.deliver(topic, &delivery);
            }
            Err(e) => debug!("Could not encode presence of {}: {}", topic, e),
        }
    }

    fn untrack(&self, id: SubscriptionId) -> Option<Topic> {
        self.presence.iter_mut().find_map(|mut entry| {
            entry
                .value_mut()
                .remove(&id)
                .map(|_| *entry.key())
        })
    }

    fn expire(&self) {
        let now = Instant::now();
        let mut expired = vec![];

        for mut entry in self.presence.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|id, tracked| {
                let alive = now.duration_since(tracked.last_seen) < self.presence_timeout;

                if !alive {
                    self.severed.remove(id);
                }

                alive
            });

            if entry.value().len() != before {
                expired.push(*entry.key());
            }
        }

        for topic in expired {
            info!("Presence records on {} timed out", topic);
            self.sync(&topic);
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &Topic, kinds: &[EventKind]) -> Result<Subscription, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();

        self.subscribers.insert(
            id,
            Subscriber {
                topic: *topic,
                kinds: kinds.to_vec(),
                sender: sender.clone(),
            },
        );

        if kinds.contains(&EventKind::PresenceSync) {
            let snapshot = self.snapshot(topic);
            let _ = sender.send(Delivery::new(EventKind::PresenceSync, None, &snapshot)?);
        }

        Ok(Subscription {
            id,
            topic: *topic,
            receiver,
        })
    }

    async fn publish(&self, topic: &Topic, delivery: Delivery) -> Result<(), BusError> {
        if self.partitioned.load() {
            debug!("Dropping {} on {} while partitioned", delivery.kind.as_str(), topic);
            return Ok(());
        }

        self.deliver(topic, &delivery);
        Ok(())
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if self.severed.contains(&id) {
            return;
        }

        self.subscribers.remove(&id);

        if let Some(topic) = self.untrack(id) {
            self.sync(&topic);
        }
    }

    async fn track(&self, id: SubscriptionId, record: PresenceRecord) -> Result<(), BusError> {
        let topic = self
            .subscribers
            .get(&id)
            .map(|s| s.topic)
            .ok_or(BusError::UnknownSubscription(id))?;

        let changed = {
            let mut tracked = self.presence.entry(topic).or_default();
            let previous = tracked.insert(
                id,
                TrackedRecord {
                    record: record.clone(),
                    last_seen: Instant::now(),
                },
            );

            previous.map_or(true, |p| p.record.name != record.name)
        };

        // Heartbeats only refresh the record
        if changed {
            self.sync(&topic);
        }

        Ok(())
    }
}

fn sweep(bus: &Weak<LocalBus>) {
    if let Some(bus) = bus.upgrade() {
        bus.expire();
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use watchparty_core::BusClient;

    use super::*;

    #[tokio::test]
    async fn test_publishes_reach_every_subscriber_including_self() {
        let bus = LocalBus::new(&Config::default());
        let client = BusClient::new(bus.clone());
        let topic = Topic::messages(Uuid::new_v4());
        let me = Uuid::new_v4();

        let mut mine = client.subscribe(topic, &[EventKind::NewMessage]).await.unwrap();
        let mut theirs = client.subscribe(topic, &[EventKind::NewMessage]).await.unwrap();
        let mut other_kind = client.subscribe(topic, &[EventKind::RoomDeleted]).await.unwrap();

        client
            .publish(topic, EventKind::NewMessage, me, &"hello")
            .await
            .unwrap();

        assert!(mine.recv().await.unwrap().is_from(me));
        assert_eq!(theirs.recv().await.unwrap().decode::<String>().unwrap(), "hello");
        assert!(other_kind.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_handle_unsubscribes() {
        let bus = LocalBus::new(&Config::default());
        let client = BusClient::new(bus.clone());
        let topic = Topic::updates(Uuid::new_v4());

        let handle = client.subscribe(topic, &[EventKind::RoomUpdates]).await.unwrap();
        assert_eq!(bus.subscriber_count(&topic), 1);

        drop(handle);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_partition_drops_publishes_silently() {
        let bus = LocalBus::new(&Config::default());
        let client = BusClient::new(bus.clone());
        let topic = Topic::updates(Uuid::new_v4());

        let mut handle = client.subscribe(topic, &[EventKind::RoomUpdates]).await.unwrap();

        bus.set_partitioned(true);
        let result = client
            .publish(topic, EventKind::RoomUpdates, Uuid::new_v4(), &1)
            .await;

        assert!(result.is_ok());
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_tracking_requires_an_open_subscription() {
        let bus = LocalBus::new(&Config::default());
        let record = PresenceRecord::new(Uuid::new_v4(), "Ada");

        let result = bus.track(SubscriptionId::new(), record).await;

        assert!(matches!(result, Err(BusError::UnknownSubscription(_))));
    }
}
