use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{sleep, timeout},
};
use url::Url;
use watchparty_collab::{
    Collab, CollabError, Database, Media, MemoryDatabase, RoomData, RoomSession,
};
use watchparty_core::{
    BusClient, Config, EventKind, GuestState, LocalFile, MediaEnvironment, Role, StreamState,
    Topic,
};
use watchparty_impls::{LocalBus, LoopbackCapture, LoopbackLink, LoopbackRelay, Swarm};

type Client = Collab<MemoryDatabase, LocalBus>;
type Session = Arc<RoomSession<MemoryDatabase, LocalBus>>;

/// Everything participants of a test share: the store, the bus, the swarm and the relay
struct Party {
    config: Config,
    bus: Arc<LocalBus>,
    database: Arc<MemoryDatabase>,
    swarm: Arc<Swarm>,
    relay: Arc<LoopbackRelay>,
}

impl Party {
    fn new() -> Self {
        let config = Config {
            metadata_timeout: Duration::from_secs(2),
            ..Default::default()
        };

        Self {
            bus: LocalBus::new(&config),
            database: Arc::new(MemoryDatabase::new()),
            swarm: Swarm::new(1024, Duration::from_millis(100)),
            relay: LoopbackRelay::new(3),
            config,
        }
    }

    fn client(&self) -> (Client, Arc<LoopbackCapture>) {
        let capture = LoopbackCapture::new();
        let proxy = Url::parse("http://localhost/webtorrent/").unwrap();

        let client = Collab::new(
            self.config.clone(),
            self.database.clone(),
            self.bus.clone(),
            Arc::new(self.swarm.transport(proxy)),
            MediaEnvironment {
                relay: self.relay.clone(),
                capture: capture.clone(),
                link: LoopbackLink::new(self.relay.clone()),
            },
        );

        (client, capture)
    }

    /// Creates a room hosted by "alice" and joins it as alice and bob.
    async fn room(&self) -> (RoomData, Session, Session) {
        let (alice, _) = self.client();
        let (bob, _) = self.client();

        let (room, _) = alice
            .rooms
            .create_room("alice", "Alice", None)
            .await
            .unwrap();

        let alice = alice.rooms.join(room.id, "alice").await.unwrap();
        let bob = bob.rooms.join(room.id, "bob").await.unwrap();
        settle().await;

        (room, alice, bob)
    }

    async fn stored_room(&self, room: &RoomData) -> RoomData {
        self.database.room_by_id(room.id).await.unwrap()
    }
}

fn video(name: &str) -> LocalFile {
    LocalFile {
        name: name.to_string(),
        mime: "video/mp4".to_string(),
        data: Arc::from(vec![3u8; 8 * 1024].into_boxed_slice()),
    }
}

async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

async fn until<T>(receiver: &mut watch::Receiver<T>, condition: impl FnMut(&T) -> bool) -> T
where
    T: Clone,
{
    let value = timeout(Duration::from_secs(20), receiver.wait_for(condition))
        .await
        .expect("condition was never met")
        .expect("sender was dropped");

    (*value).clone()
}

#[tokio::test(start_paused = true)]
async fn own_messages_show_exactly_once() {
    let party = Party::new();
    let (_, alice, bob) = party.room().await;

    alice.send_message("hello", None).await.unwrap();
    alice.send_message("anyone here?", None).await.unwrap();

    let mut messages = bob.messages();
    until(&mut messages, |m| m.len() == 2).await;
    settle().await;

    for session in [&alice, &bob] {
        let contents: Vec<_> = session
            .messages()
            .borrow()
            .iter()
            .map(|m| m.content.clone())
            .collect();

        assert_eq!(contents, vec!["hello", "anyone here?"]);
    }
}

#[tokio::test(start_paused = true)]
async fn first_message_needs_a_free_name() {
    let party = Party::new();
    let (room, alice, bob) = party.room().await;

    assert_eq!(bob.send_message("hi", None).await, Err(CollabError::NameRequired));
    assert_eq!(
        bob.errors().borrow().message.as_ref().map(|e| e.content.as_str()),
        Some("hi")
    );

    let conflict = bob.send_message("hi", Some("Alice")).await;
    assert_eq!(conflict, Err(CollabError::NameConflict("Alice".into())));
    assert!(!bob.participant().has_name());
    assert!(party.database.list_messages(room.id).await.unwrap().is_empty());

    let sent = bob.send_message("hi", Some("Bob")).await.unwrap();
    assert_eq!(sent.sender.name, "Bob");
    assert!(bob.errors().borrow().message.is_none());

    let mut online = alice.online_participants();
    until(&mut online, |records| records.iter().any(|r| r.name == "Bob")).await;

    let mut messages = alice.messages();
    let messages = until(&mut messages, |m| !m.is_empty()).await;
    assert_eq!(messages[0].sender.name, "Bob");
}

#[tokio::test(start_paused = true)]
async fn renames_reach_presence_of_others() {
    let party = Party::new();
    let (_, alice, bob) = party.room().await;

    let mut online = alice.online_participants();
    until(&mut online, |records| records.len() == 2).await;

    bob.rename_participant("Bobby").await.unwrap();
    until(&mut online, |records| records.iter().any(|r| r.name == "Bobby")).await;

    assert_eq!(
        alice.rename_participant("Bobby").await,
        Err(CollabError::NameConflict("Bobby".into()))
    );
    assert!(alice.errors().borrow().display_name.is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrent_sources_converge_on_the_store() {
    let party = Party::new();
    let (room, alice, bob) = party.room().await;

    let (a, b) = tokio::join!(
        alice.set_video_source("https://example.com/a.mp4"),
        bob.set_video_source("https://example.com/b.mp4"),
    );
    a.unwrap();
    b.unwrap();

    settle().await;

    let stored = party.stored_room(&room).await;

    for session in [&alice, &bob] {
        assert_eq!(session.room_state().borrow().video_source, stored.video_source);
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_sources_are_rejected_locally() {
    let party = Party::new();
    let (room, alice, _) = party.room().await;

    let result = alice.set_video_source("ftp://example.com/movie.mp4").await;

    assert!(matches!(result, Err(CollabError::InvalidSource(_))));
    assert!(alice.errors().borrow().video_source.is_some());
    assert_eq!(
        party.stored_room(&room).await.video_source,
        Config::default().default_video_source
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_keeps_the_failed_message() {
    let party = Party::new();
    let (room, alice, _) = party.room().await;

    party.database.set_unreachable(true);

    let result = alice.send_message("are you there?", None).await;
    assert!(matches!(result, Err(CollabError::TransientNetwork(_))));

    let error = alice.errors().borrow().message.clone().unwrap();
    assert_eq!(error.content, "are you there?");
    assert_eq!(alice.messages().borrow().len(), 1, "the message stays visible");

    let source = alice.set_video_source("https://example.com/new.mp4").await;
    assert!(matches!(source, Err(CollabError::TransientNetwork(_))));
    assert!(alice.errors().borrow().video_source.is_some());
    assert_eq!(
        alice.room_state().borrow().video_source,
        "https://example.com/new.mp4",
        "the failed source stays visible"
    );
    assert!(!alice.is_terminated());

    party.database.set_unreachable(false);

    let resent = alice.resend_message(error.message_id.unwrap()).await.unwrap();
    assert!(resent.is_some());
    assert!(alice.errors().borrow().message.is_none());
    assert_eq!(party.database.list_messages(room.id).await.unwrap().len(), 1);
    assert_eq!(alice.messages().borrow().len(), 1);

    alice.resubmit_room_changes().await.unwrap();
    assert!(alice.errors().borrow().video_source.is_none());
    assert_eq!(
        party.stored_room(&room).await.video_source,
        "https://example.com/new.mp4"
    );
}

#[tokio::test(start_paused = true)]
async fn failed_room_changes_can_be_discarded_or_overridden() {
    let party = Party::new();
    let (room, alice, bob) = party.room().await;

    party.database.set_unreachable(true);
    alice
        .set_video_source("https://example.com/first.mp4")
        .await
        .unwrap_err();
    party.database.set_unreachable(false);

    assert_eq!(
        alice.room_state().borrow().video_source,
        "https://example.com/first.mp4"
    );

    alice.discard_room_changes().await;

    assert_eq!(alice.room_state().borrow().video_source, room.video_source);
    assert!(alice.errors().borrow().video_source.is_none());

    party.database.set_unreachable(true);
    alice
        .set_video_source("https://example.com/second.mp4")
        .await
        .unwrap_err();
    party.database.set_unreachable(false);

    alice
        .set_video_source("https://example.com/third.mp4")
        .await
        .unwrap();
    settle().await;

    // The failed write is overridden, so it never shows up again
    alice.refresh().await.unwrap();
    alice.resubmit_room_changes().await.unwrap();
    settle().await;

    assert_eq!(
        alice.room_state().borrow().video_source,
        "https://example.com/third.mp4"
    );
    assert_eq!(
        party.stored_room(&room).await.video_source,
        "https://example.com/third.mp4"
    );

    let mut state = bob.room_state();
    until(&mut state, |s| s.video_source == "https://example.com/third.mp4").await;
}

#[tokio::test(start_paused = true)]
async fn retracted_messages_disappear() {
    let party = Party::new();
    let (_, alice, _) = party.room().await;

    party.database.set_unreachable(true);
    alice.send_message("oops", None).await.unwrap_err();

    let id = alice.errors().borrow().message.as_ref().unwrap().message_id.unwrap();
    alice.retract_message(id);

    assert!(alice.messages().borrow().is_empty());
    assert!(alice.errors().borrow().message.is_none());
}

#[tokio::test(start_paused = true)]
async fn deleted_room_ends_every_session() {
    let party = Party::new();
    let (room, alice, bob) = party.room().await;

    assert_eq!(bob.delete_room().await, Err(CollabError::NotHost));

    alice.delete_room().await.unwrap();

    let mut terminated = bob.terminated();
    let error = until(&mut terminated, Option::is_some).await;

    assert_eq!(error, Some(CollabError::NotFound));
    assert!(alice.is_terminated());
    assert!(party.database.room_by_id(room.id).await.is_err());
    assert_eq!(party.database.row_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_deletion_keeps_the_stream_and_its_endpoint() {
    let party = Party::new();
    let (room, alice, _) = party.room().await;

    alice.start_streaming().await.unwrap();
    let endpoint = party.stored_room(&room).await.stream.endpoint().unwrap();

    party.database.set_unreachable(true);
    let result = alice.delete_room().await;
    party.database.set_unreachable(false);

    assert!(matches!(result, Err(CollabError::TransientNetwork(_))));
    assert!(!alice.is_terminated());
    assert_eq!(alice.stream_state().borrow().state, StreamState::Live);
    assert!(party.relay.endpoint_exists(&endpoint.id));

    let stored = party.stored_room(&room).await;
    assert!(stored.stream.is_streaming);
    assert_eq!(stored.stream.current_streamer_id, Some(alice.participant_id()));

    alice.stop_streaming().await.unwrap();
    alice.start_streaming().await.unwrap();
    assert_eq!(party.relay.created_count(), 1, "the endpoint is reused");

    alice.delete_room().await.unwrap();

    assert!(!party.relay.endpoint_exists(&endpoint.id));
    assert_eq!(alice.stream_state().borrow().state, StreamState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn silently_deleted_room_fails_on_next_read() {
    let party = Party::new();
    let (room, _, bob) = party.room().await;

    party.database.delete_room(room.id).await.unwrap();

    let result = bob.set_video_source("https://example.com/late.mp4").await;

    assert_eq!(result, Err(CollabError::NotFound));
    assert_eq!(*bob.terminated().borrow(), Some(CollabError::NotFound));
    assert!(result.unwrap_err().is_terminal());
}

#[tokio::test(start_paused = true)]
async fn shared_upload_streams_to_other_participants() {
    let party = Party::new();
    let (room, alice, bob) = party.room().await;

    let uri = alice.upload_and_share_file(video("holiday.mp4")).await.unwrap();

    assert!(matches!(&*alice.media().borrow(), Media::LocalFile { file, .. } if file.name == "holiday.mp4"));
    assert_eq!(party.stored_room(&room).await.uploader_id, Some(alice.participant_id()));

    let mut media = bob.media();
    let ready = until(&mut media, |m| matches!(m, Media::Streamable(_))).await;

    let Media::Streamable(handle) = ready else {
        unreachable!()
    };

    assert!(handle.ready);
    assert_eq!(handle.uri, uri);
    assert_eq!(
        bob.torrent_session().borrow().as_ref().map(|s| s.role),
        Some(Role::Downloading)
    );
    assert_eq!(
        alice.torrent_session().borrow().as_ref().map(|s| s.role),
        Some(Role::Seeding)
    );
}

#[tokio::test(start_paused = true)]
async fn content_without_an_uploader_needs_replacement() {
    let party = Party::new();
    let (alice, _) = party.client();
    let (bob, _) = party.client();

    let (room, _) = alice.rooms.create_room("alice", "Alice", None).await.unwrap();
    let alice = alice.rooms.join(room.id, "alice").await.unwrap();

    alice.upload_and_share_file(video("gone.mp4")).await.unwrap();
    alice.close().await;

    let bob = bob.rooms.join(room.id, "bob").await.unwrap();

    let mut media = bob.media();
    let unavailable = until(&mut media, Media::needs_replacement).await;

    assert!(matches!(unavailable, Media::Unavailable { .. }));
    assert!(bob
        .errors()
        .borrow()
        .content
        .as_ref()
        .is_some_and(CollabError::is_content_unavailable));
}

#[tokio::test(start_paused = true)]
async fn unavailable_content_is_only_fetched_again_on_retry() {
    let party = Party::new();
    let (alice, _) = party.client();
    let (bob, _) = party.client();
    let (carol, _) = party.client();

    let (room, _) = alice.rooms.create_room("alice", "Alice", None).await.unwrap();
    let alice = alice.rooms.join(room.id, "alice").await.unwrap();

    alice.upload_and_share_file(video("gone.mp4")).await.unwrap();
    alice.close().await;

    let bob = bob.rooms.join(room.id, "bob").await.unwrap();
    let carol = carol.rooms.join(room.id, "carol").await.unwrap();

    let mut media = bob.media();
    until(&mut media, Media::needs_replacement).await;

    // Unrelated room changes leave the unavailable content alone
    carol.start_streaming().await.unwrap();
    bob.refresh().await.unwrap();
    settle().await;

    assert!(bob.media().borrow().needs_replacement());
    assert!(bob.errors().borrow().content.is_some());

    assert!(bob.retry_content());
    assert!(matches!(&*bob.media().borrow(), Media::Fetching { .. }));
    assert!(bob.errors().borrow().content.is_none());

    until(&mut media, Media::needs_replacement).await;
    assert!(bob.errors().borrow().content.is_some());
}

#[tokio::test(start_paused = true)]
async fn stream_is_shared_once_it_is_live() {
    let party = Party::new();
    let (room, alice, bob) = party.room().await;

    let mut updates = BusClient::new(party.bus.clone())
        .subscribe(Topic::updates(room.id), &[EventKind::RoomUpdates])
        .await
        .unwrap();

    alice.start_streaming().await.unwrap();
    settle().await;

    let mut broadcasts = 0;
    while updates.try_recv().is_some() {
        broadcasts += 1;
    }

    assert_eq!(broadcasts, 1);
    assert_eq!(party.relay.poll_count(), 4);
    assert_eq!(alice.stream_state().borrow().state, StreamState::Live);

    let stored = party.stored_room(&room).await;
    assert!(stored.stream.is_streaming);
    assert_eq!(stored.stream.current_streamer_id, Some(alice.participant_id()));

    let mut status = bob.stream_state();
    until(&mut status, |s| matches!(s.guest, GuestState::Attached { .. })).await;

    alice.close().await;

    let mut state = bob.room_state();
    until(&mut state, |s| !s.stream.is_streaming).await;
    until(&mut status, |s| s.guest == GuestState::Detached).await;

    assert!(!party.stored_room(&room).await.stream.is_streaming);
}

#[tokio::test(start_paused = true)]
async fn ended_track_clears_the_streamer() {
    let party = Party::new();
    let (alice, capture) = party.client();

    let (room, _) = alice.rooms.create_room("alice", "Alice", None).await.unwrap();
    let alice = alice.rooms.join(room.id, "alice").await.unwrap();

    alice.start_streaming().await.unwrap();
    assert!(party.stored_room(&room).await.stream.is_streaming);

    capture.last_track().unwrap().end_externally();

    let mut state = alice.room_state();
    until(&mut state, |s| !s.stream.is_streaming).await;
    settle().await;

    let stored = party.stored_room(&room).await;
    assert!(!stored.stream.is_streaming);
    assert!(stored.stream.endpoint().is_some(), "the endpoint is kept for reuse");
    assert_eq!(alice.stream_state().borrow().state, StreamState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn denied_capture_is_reported_on_the_stream_slice() {
    let party = Party::new();
    let (alice, capture) = party.client();

    let (room, _) = alice.rooms.create_room("alice", "Alice", None).await.unwrap();
    let alice = alice.rooms.join(room.id, "alice").await.unwrap();

    capture.set_deny(true);

    let result = alice.start_streaming().await;

    assert!(matches!(result, Err(CollabError::Stream(_))));
    assert!(alice.errors().borrow().stream.is_some());
    assert!(!party.stored_room(&room).await.stream.is_streaming);
}

#[tokio::test(start_paused = true)]
async fn playback_state_reaches_other_participants() {
    let party = Party::new();
    let (_, alice, bob) = party.room().await;

    alice.set_playing(true, Some(42.5)).await.unwrap();

    let mut playback = bob.playback();
    let state = until(&mut playback, Option::is_some).await.unwrap();

    assert!(state.is_playing);
    assert_eq!(state.position, Some(42.5));
}

#[tokio::test(start_paused = true)]
async fn hosts_get_their_room_back() {
    let party = Party::new();
    let (carol, _) = party.client();

    let first = carol.rooms.open_or_create("carol").await.unwrap();
    let second = carol.rooms.open_or_create("carol").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.video_source, Config::default().default_video_source);

    let session = carol.rooms.join(first.id, "carol").await.unwrap();
    assert!(session.participant().is_host);
    assert!(!session.participant().has_name());

    let again = carol.rooms.join(first.id, "carol").await.unwrap();
    assert!(Arc::ptr_eq(&session, &again));

    session.close().await;
    assert_eq!(carol.rooms.session_count(), 0);
}
