use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    Bus, BusClient, BusError, Config, EventKind, ParticipantId, SubscriptionHandle,
    SubscriptionId, Ticker, Topic,
};

/// An ephemeral record of a participant currently viewing a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: ParticipantId,
    pub name: String,
    pub online_at: DateTime<Utc>,
}

/// Tracks who is currently viewing a room.
///
/// Every sync replaces the visible set entirely, the tracker never diffs.
pub struct PresenceTracker<B> {
    bus: BusClient<B>,
    config: Config,
    joined: Mutex<Option<Joined>>,
    online: watch::Sender<Vec<PresenceRecord>>,
}

struct Joined {
    subscription_id: SubscriptionId,
    record: Arc<Mutex<PresenceRecord>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PresenceRecord {
    pub fn new(id: ParticipantId, name: &str) -> Self {
        Self {
            id,
            name: display_name(name),
            online_at: Utc::now(),
        }
    }
}

impl<B> PresenceTracker<B>
where
    B: Bus,
{
    pub fn new(bus: BusClient<B>, config: Config) -> Self {
        let (online, _) = watch::channel(vec![]);

        Self {
            bus,
            config,
            joined: Default::default(),
            online,
        }
    }

    /// Subscribes to the presence topic and announces the participant.
    /// Joining again replaces the previous membership.
    pub async fn join(
        &self,
        topic: Topic,
        participant_id: ParticipantId,
        name: &str,
    ) -> Result<(), BusError> {
        self.leave().await;

        let handle = self.bus.subscribe(topic, &[EventKind::PresenceSync]).await?;
        let subscription_id = handle.id();

        let record = PresenceRecord::new(participant_id, name);
        self.bus.track(subscription_id, record.clone()).await?;

        let record = Arc::new(Mutex::new(record));
        let token = CancellationToken::new();

        let task = spawn_presence_task(
            handle,
            self.bus.clone(),
            record.clone(),
            self.online.clone(),
            Ticker::delayed(self.config.presence_heartbeat_interval, token.clone()),
        );

        info!("Joined presence of {} as {}", topic, participant_id);

        *self.joined.lock() = Some(Joined {
            subscription_id,
            record,
            token,
            task,
        });

        Ok(())
    }

    /// Returns a receiver of the full set of participants, updated on every sync.
    pub fn on_sync(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.online.subscribe()
    }

    /// The last synced set of participants.
    pub fn online(&self) -> Vec<PresenceRecord> {
        self.online.borrow().clone()
    }

    /// Updates the announced display name in place.
    pub async fn rename(&self, name: &str) -> Result<(), BusError> {
        let target = {
            let joined = self.joined.lock();

            joined.as_ref().map(|j| {
                let mut record = j.record.lock();
                record.name = display_name(name);

                (j.subscription_id, record.clone())
            })
        };

        match target {
            Some((id, record)) => self.bus.track(id, record).await,
            None => Ok(()),
        }
    }

    /// Stops announcing the participant and closes the presence subscription.
    /// Idempotent.
    pub async fn leave(&self) {
        let joined = self.joined.lock().take();

        if let Some(joined) = joined {
            joined.token.cancel();

            if let Err(e) = joined.task.await {
                warn!("Presence task ended abnormally: {}", e);
            }

            self.online.send_replace(vec![]);
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined.lock().is_some()
    }
}

fn spawn_presence_task<B>(
    mut handle: SubscriptionHandle<B>,
    bus: BusClient<B>,
    record: Arc<Mutex<PresenceRecord>>,
    online: watch::Sender<Vec<PresenceRecord>>,
    mut heartbeat: Ticker,
) -> JoinHandle<()>
where
    B: Bus,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                tick = heartbeat.tick() => {
                    if tick.is_none() {
                        break;
                    }

                    let record = {
                        let mut record = record.lock();
                        record.online_at = Utc::now();
                        record.clone()
                    };

                    if let Err(e) = bus.track(handle.id(), record).await {
                        warn!("Presence heartbeat failed: {}", e);
                    }
                }
                delivery = handle.recv() => {
                    let Some(delivery) = delivery else {
                        break;
                    };

                    if delivery.kind != EventKind::PresenceSync {
                        continue;
                    }

                    match delivery.decode::<Vec<PresenceRecord>>() {
                        Ok(records) => {
                            online.send_replace(records);
                        }
                        Err(e) => warn!("Ignoring malformed presence sync: {}", e),
                    }
                }
            }
        }

        // Dropping the handle here closes the subscription
    })
}

fn display_name(name: &str) -> String {
    let name = name.trim();

    if name.is_empty() {
        "Anonymous".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unnamed_participants_are_anonymous() {
        let record = PresenceRecord::new(ParticipantId::nil(), "  ");

        assert_eq!(record.name, "Anonymous");
        assert_eq!(PresenceRecord::new(ParticipantId::nil(), "ana").name, "ana");
    }
}
