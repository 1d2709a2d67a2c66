use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use uuid::Uuid;
use watchparty_core::{BusClient, Config, PresenceTracker, Topic};
use watchparty_impls::LocalBus;

fn tracker(bus: &Arc<LocalBus>) -> PresenceTracker<LocalBus> {
    PresenceTracker::new(BusClient::new(bus.clone()), Config::default())
}

fn names(tracker: &PresenceTracker<LocalBus>) -> Vec<String> {
    let mut names: Vec<_> = tracker.online().into_iter().map(|r| r.name).collect();
    names.sort();
    names
}

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn every_member_sees_the_full_set() {
    let bus = LocalBus::new(&Config::default());
    let topic = Topic::presence(Uuid::new_v4());

    let ada = tracker(&bus);
    let bob = tracker(&bus);

    ada.join(topic, Uuid::new_v4(), "Ada").await.unwrap();
    bob.join(topic, Uuid::new_v4(), "").await.unwrap();
    settle().await;

    assert_eq!(names(&ada), vec!["Ada", "Anonymous"]);
    assert_eq!(names(&bob), vec!["Ada", "Anonymous"]);

    bob.leave().await;
    settle().await;

    assert_eq!(names(&ada), vec!["Ada"]);
    assert!(bob.online().is_empty());
    assert!(!bob.is_joined());
}

#[tokio::test(start_paused = true)]
async fn renames_converge_within_one_sync() {
    let bus = LocalBus::new(&Config::default());
    let topic = Topic::presence(Uuid::new_v4());

    let ada = tracker(&bus);
    let bob = tracker(&bus);

    ada.join(topic, Uuid::new_v4(), "Ada").await.unwrap();
    bob.join(topic, Uuid::new_v4(), "").await.unwrap();
    settle().await;

    let mut sync = ada.on_sync();
    sync.borrow_and_update();

    bob.rename("Bob").await.unwrap();
    sync.changed().await.unwrap();

    assert_eq!(names(&ada), vec!["Ada", "Bob"]);
}

#[tokio::test(start_paused = true)]
async fn dropped_connections_linger_until_the_presence_timeout() {
    let config = Config::default();
    let bus = LocalBus::new(&config);
    let topic = Topic::presence(Uuid::new_v4());

    let ada = tracker(&bus);
    let bob = tracker(&bus);
    let bob_id = Uuid::new_v4();

    ada.join(topic, Uuid::new_v4(), "Ada").await.unwrap();
    bob.join(topic, bob_id, "Bob").await.unwrap();
    settle().await;

    bus.sever(bob_id);
    assert_eq!(bus.subscriber_count(&topic), 1, "only the tracking subscription is dropped");

    sleep(config.presence_timeout / 2).await;
    assert_eq!(names(&ada), vec!["Ada", "Bob"], "departure is not instant");

    sleep(config.presence_timeout).await;
    assert_eq!(names(&ada), vec!["Ada"], "heartbeats keep Ada online");
}
