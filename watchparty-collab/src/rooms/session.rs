use std::sync::{Arc, Weak};

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use watchparty_core::{
    Bus, ContentUri, Delivery, EventKind, LiveStreamManager, LocalFile, Optimistic,
    ParticipantId, PlaybackState, PresenceRecord, PresenceTracker, Reducer, RoomId, StreamEvent,
    StreamEvents, StreamFields, StreamHandle, StreamStatus, SubscriptionHandle, Topic,
    TorrentError, TorrentProgress, TorrentSession,
};

use crate::{
    CollabContext, Database, MessageData, MessageLog, NewMessage, ParticipantData, PrimaryKey,
    RoomPatch, RoomReducer, RoomState, SenderData, UpdatedParticipant, VideoSource,
};

use super::{CollabError, Media, MessageError, SessionErrors};

type Result<T> = std::result::Result<T, CollabError>;

/// The slice of [SessionErrors] a room write reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slice {
    VideoSource,
    Stream,
    Content,
}

/// One participant's view of a room.
///
/// Owns the room's optimistic state and a single consumer loop that folds
/// every inbound event into it, and drives the torrent and live stream
/// managers from the resulting state.
pub struct RoomSession<Db, B> {
    context: CollabContext<Db, B>,
    room_id: RoomId,
    participant: Mutex<ParticipantData>,
    room: Mutex<Optimistic<RoomReducer>>,
    messages: Mutex<Optimistic<MessageLog>>,
    /// Room patches that could not be stored, still visible until resubmitted or discarded
    failed_writes: Mutex<Vec<(Slice, RoomPatch)>>,
    /// Serializes store reads and writes of the room
    room_sync: tokio::sync::Mutex<()>,
    presence: PresenceTracker<B>,
    stream: LiveStreamManager,
    /// The file this participant seeds, if it uploaded the room's content
    local_file: Mutex<Option<(ContentUri, LocalFile)>>,
    token: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    observed: Observed,
}

struct Observed {
    room: watch::Sender<RoomState>,
    messages: watch::Sender<Vec<MessageData>>,
    playback: watch::Sender<Option<PlaybackState>>,
    media: watch::Sender<Media>,
    errors: watch::Sender<SessionErrors>,
    terminated: watch::Sender<Option<CollabError>>,
}

enum Inbound {
    Delivery(Delivery),
    Stream(StreamEvent),
}

impl Observed {
    fn new(room: RoomState, messages: Vec<MessageData>) -> Self {
        Self {
            room: watch::channel(room).0,
            messages: watch::channel(messages).0,
            playback: watch::channel(None).0,
            media: watch::channel(Media::None).0,
            errors: watch::channel(SessionErrors::default()).0,
            terminated: watch::channel(None).0,
        }
    }
}

impl<Db, B> RoomSession<Db, B>
where
    Db: Database,
    B: Bus,
{
    /// Subscribes to the room's topics, reads the room and starts the consumer loop.
    pub(crate) async fn open(
        context: &CollabContext<Db, B>,
        participant: ParticipantData,
    ) -> Result<Arc<Self>> {
        let room_id = participant.room_id;
        let participant_id = participant.id;

        let messages = context
            .bus
            .subscribe(Topic::messages(room_id), &[EventKind::NewMessage])
            .await?;
        let updates = context
            .bus
            .subscribe(
                Topic::updates(room_id),
                &[
                    EventKind::RoomUpdates,
                    EventKind::PlaybackState,
                    EventKind::RoomDeleted,
                ],
            )
            .await?;

        // Read after subscribing, so nothing published in between is missed
        let room = context.database.room_by_id(room_id).await?;
        let history = context.database.list_messages(room_id).await?;

        let (stream, stream_events) = LiveStreamManager::new(
            context.config.clone(),
            room_id,
            participant_id,
            context.media.clone(),
        );

        let state = RoomState::from(room);
        let name = participant.name.clone();

        let session = Arc::new(Self {
            context: context.clone(),
            room_id,
            participant: participant.into(),
            room: Optimistic::new(state.clone()).into(),
            messages: Optimistic::new(history.clone()).into(),
            failed_writes: Default::default(),
            room_sync: Default::default(),
            presence: PresenceTracker::new(context.bus.clone(), context.config.clone()),
            stream,
            local_file: Default::default(),
            token: CancellationToken::new(),
            consumer: Default::default(),
            observed: Observed::new(state, history),
        });

        session
            .presence
            .join(Topic::presence(room_id), participant_id, &name)
            .await?;

        let consumer = tokio::spawn(consume(
            Arc::downgrade(&session),
            messages,
            updates,
            stream_events,
            session.token.clone(),
        ));
        *session.consumer.lock() = Some(consumer);

        session.sync_effects().await;

        info!("Participant {} opened room {}", participant_id, room_id);

        Ok(session)
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant.lock().id
    }

    pub fn participant(&self) -> ParticipantData {
        self.participant.lock().clone()
    }

    /// Changes the room's video source for everyone.
    pub async fn set_video_source(self: &Arc<Self>, source: &str) -> Result<()> {
        let source = source.trim();

        if let Err(reason) = VideoSource::parse(source) {
            let error = CollabError::InvalidSource(reason);
            self.set_error(Slice::VideoSource, Some(error.clone()));

            return Err(error);
        }

        info!("Setting video source of room {} to {}", self.room_id, source);

        self.write_room(RoomPatch::source(source, None), Slice::VideoSource)
            .await
    }

    /// Sends a chat message. `name` is required if the participant has not picked one yet.
    ///
    /// The message is shown right away. If it can't be stored, it stays visible
    /// with an error until it is resent or retracted.
    pub async fn send_message(
        self: &Arc<Self>,
        content: &str,
        name: Option<&str>,
    ) -> Result<MessageData> {
        let has_name = self.participant.lock().has_name();

        if !has_name {
            let claimed = match name.map(str::trim).filter(|n| !n.is_empty()) {
                Some(name) => self.claim_name(name).await,
                None => Err(CollabError::NameRequired),
            };

            if let Err(error) = claimed {
                self.set_message_error(Some(MessageError {
                    error: error.clone(),
                    message_id: None,
                    content: content.to_string(),
                }));

                return Err(error);
            }
        }

        let sender = SenderData::from(&*self.participant.lock());
        let message = MessageData {
            id: Uuid::new_v4(),
            room_id: self.room_id,
            sender,
            content: content.to_string(),
            sent_at: Utc::now(),
        };

        self.messages.lock().apply_local(message.clone());
        self.publish_messages();

        self.deliver_message(message).await
    }

    /// Tries to store a message that failed before.
    /// Returns `None` if no such message is pending.
    pub async fn resend_message(&self, message_id: PrimaryKey) -> Result<Option<MessageData>> {
        let pending = self
            .messages
            .lock()
            .pending()
            .iter()
            .find(|m| m.id == message_id)
            .cloned();

        match pending {
            Some(message) => self.deliver_message(message).await.map(Some),
            None => Ok(None),
        }
    }

    /// Removes a message that failed to send.
    pub fn retract_message(&self, message_id: PrimaryKey) {
        if self.messages.lock().reset(&message_id).is_some() {
            self.publish_messages();
        }

        self.observed.errors.send_if_modified(|errors| {
            let retracted = errors
                .message
                .as_ref()
                .is_some_and(|e| e.message_id == Some(message_id));

            if retracted {
                errors.message = None;
            }

            retracted
        });
    }

    /// Changes the participant's display name, which must be unique in the room.
    pub async fn rename_participant(&self, name: &str) -> Result<()> {
        let result = self.claim_name(name.trim()).await;

        self.observed.errors.send_modify(|errors| {
            errors.display_name = result.as_ref().err().cloned();
        });

        result
    }

    /// Starts publishing a live stream, and shares it once the relay confirms it.
    pub async fn start_streaming(self: &Arc<Self>) -> Result<()> {
        let existing = self.room.lock().visible().stream.endpoint();

        let fields = match self.stream.start_publishing(existing).await {
            Ok(fields) => fields,
            Err(e) => {
                let error = CollabError::from(e);
                self.set_error(Slice::Stream, Some(error.clone()));

                return Err(error);
            }
        };

        if let Err(error) = self.write_room(RoomPatch::stream(fields), Slice::Stream).await {
            let unstored = self
                .failed_writes
                .lock()
                .iter()
                .any(|(slice, _)| *slice == Slice::Stream);

            // Only a broadcast failed if the fields were stored, so others still see it on refresh
            if unstored {
                warn!("Could not share stream, stopping it: {}", error);
                self.stream.stop_publishing().await;

                self.discard_writes(|slice| slice == Slice::Stream).await;
                self.set_error(Slice::Stream, Some(error.clone()));
            }

            return Err(error);
        }

        Ok(())
    }

    /// Stops publishing and clears the room's streamer. Idempotent.
    pub async fn stop_streaming(self: &Arc<Self>) -> Result<()> {
        match self.stream.stop_publishing().await {
            Some(fields) => self.write_room(RoomPatch::stream(fields), Slice::Stream).await,
            None => Ok(()),
        }
    }

    /// Seeds a local file and makes it the room's video source.
    pub async fn upload_and_share_file(self: &Arc<Self>, file: LocalFile) -> Result<ContentUri> {
        info!("Sharing {} in room {}", file.name, self.room_id);

        let uri = match self.context.torrent.seed(file.clone()).await {
            Ok(uri) => uri,
            Err(e) => {
                let error = CollabError::from(e);
                self.set_error(Slice::Content, Some(error.clone()));

                return Err(error);
            }
        };

        *self.local_file.lock() = Some((uri.clone(), file));

        let patch = RoomPatch::source(uri.as_str(), Some(self.participant_id()));
        self.write_room(patch, Slice::Content).await?;

        Ok(uri)
    }

    /// Shares play/pause and the playback position with the other participants.
    pub async fn set_playing(&self, is_playing: bool, position: Option<f64>) -> Result<()> {
        let state = PlaybackState {
            is_playing,
            position,
        };

        self.observed.playback.send_replace(Some(state));
        self.publish(Topic::updates(self.room_id), EventKind::PlaybackState, &state)
            .await
    }

    /// Reads the room and its messages from the store again.
    pub async fn refresh(self: &Arc<Self>) -> Result<()> {
        self.refresh_room().await?;

        let history = match self.context.database.list_messages(self.room_id).await {
            Ok(history) => history,
            Err(e) => return Err(self.surface(e.into()).await),
        };

        self.messages.lock().rebase(history);
        self.publish_messages();
        self.sync_effects().await;

        Ok(())
    }

    /// Stores room changes again that failed to be stored before.
    /// Changes that were overridden in the meantime are dropped.
    pub async fn resubmit_room_changes(self: &Arc<Self>) -> Result<()> {
        let failed = std::mem::take(&mut *self.failed_writes.lock());
        let mut result = Ok(());

        for (slice, patch) in failed {
            let pending = self
                .room
                .lock()
                .pending()
                .iter()
                .find(|p| p.id == patch.id)
                .cloned();

            let Some(patch) = pending else {
                self.set_error(slice, None);
                continue;
            };

            if let Err(e) = self.persist_room(patch, slice).await {
                result = Err(e);
            }
        }

        result
    }

    /// Drops room changes that failed to be stored, showing the stored values again.
    pub async fn discard_room_changes(self: &Arc<Self>) {
        self.discard_writes(|_| true).await;
    }

    /// Fetches content that was unavailable once more.
    /// Returns false if the current content is not unavailable.
    pub fn retry_content(self: &Arc<Self>) -> bool {
        let uri = match &*self.observed.media.borrow() {
            Media::Unavailable { uri, .. } => uri.clone(),
            _ => return false,
        };

        info!("Retrying content {} of room {}", uri, self.room_id);

        self.set_error(Slice::Content, None);
        self.set_media(Media::Fetching { uri: uri.clone() });
        self.start_download(uri);

        true
    }

    /// Deletes the room for everyone. Only the host may do this.
    pub async fn delete_room(&self) -> Result<()> {
        if !self.participant.lock().is_host {
            return Err(CollabError::NotHost);
        }

        let endpoint = self.room.lock().confirmed().stream.endpoint();

        // The stream and its endpoint stay untouched unless the room is really gone
        if let Err(e) = self.context.database.delete_room(self.room_id).await {
            return Err(self.surface(e.into()).await);
        }

        self.stream.shutdown().await;
        self.stream.release_endpoint(endpoint).await;

        let room_id = self.room_id;
        if let Err(e) = self
            .publish(Topic::updates(room_id), EventKind::RoomDeleted, &room_id)
            .await
        {
            warn!("Could not announce deletion of room {}: {}", room_id, e);
        }

        info!("Deleted room {}", room_id);
        self.terminate(CollabError::NotFound).await;

        Ok(())
    }

    /// Leaves the room, releasing every resource the session holds.
    /// A stream this participant published is cleared for everyone.
    pub async fn close(self: &Arc<Self>) {
        self.token.cancel();

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                warn!("Consumer of room {} ended abnormally: {}", self.room_id, e);
            }
        }

        let fields = self.release().await;

        if let Some(fields) = fields.filter(|_| !self.is_terminated()) {
            if let Err(e) = self.write_room(RoomPatch::stream(fields), Slice::Stream).await {
                warn!("Could not clear stream of room {}: {}", self.room_id, e);
            }
        }

        self.context.sessions.remove(&self.participant_id());

        info!(
            "Participant {} closed room {}",
            self.participant_id(),
            self.room_id
        );
    }

    pub fn room_state(&self) -> watch::Receiver<RoomState> {
        self.observed.room.subscribe()
    }

    pub fn messages(&self) -> watch::Receiver<Vec<MessageData>> {
        self.observed.messages.subscribe()
    }

    pub fn online_participants(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.presence.on_sync()
    }

    pub fn torrent_session(&self) -> watch::Receiver<Option<TorrentSession>> {
        self.context.torrent.subscribe()
    }

    pub fn torrent_progress(&self) -> Option<TorrentProgress> {
        self.context.torrent.progress()
    }

    pub fn stream_state(&self) -> watch::Receiver<StreamStatus> {
        self.stream.subscribe()
    }

    pub fn playback(&self) -> watch::Receiver<Option<PlaybackState>> {
        self.observed.playback.subscribe()
    }

    pub fn media(&self) -> watch::Receiver<Media> {
        self.observed.media.subscribe()
    }

    pub fn errors(&self) -> watch::Receiver<SessionErrors> {
        self.observed.errors.subscribe()
    }

    /// Yields the error that ended the session, if any
    pub fn terminated(&self) -> watch::Receiver<Option<CollabError>> {
        self.observed.terminated.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.observed.terminated.borrow().is_some()
    }

    async fn handle_delivery(self: &Arc<Self>, delivery: Delivery) {
        let participant_id = self.participant_id();

        match delivery.kind {
            EventKind::NewMessage => match delivery.decode::<MessageData>() {
                Ok(message) => {
                    self.messages.lock().apply_remote(message);
                    self.publish_messages();
                }
                Err(e) => warn!("Ignoring malformed message: {}", e),
            },
            _ if delivery.is_from(participant_id) => {}
            EventKind::RoomUpdates => match delivery.decode::<RoomPatch>() {
                Ok(patch) => {
                    debug!("Room {} was updated by {:?}", self.room_id, delivery.origin);

                    self.room.lock().apply_remote(patch);
                    self.publish_room();

                    // The store decides between concurrent writers
                    if self.refresh_room().await.is_ok() {
                        self.sync_effects().await;
                    }
                }
                Err(e) => warn!("Ignoring malformed room update: {}", e),
            },
            EventKind::PlaybackState => match delivery.decode::<PlaybackState>() {
                Ok(state) => {
                    self.observed.playback.send_replace(Some(state));
                }
                Err(e) => warn!("Ignoring malformed playback state: {}", e),
            },
            EventKind::RoomDeleted => {
                info!("Room {} was deleted by {:?}", self.room_id, delivery.origin);

                if let Err(e) = self.refresh_room().await {
                    debug!("Room {} is gone: {}", self.room_id, e);
                }
            }
            EventKind::PresenceSync => {}
        }
    }

    async fn handle_stream_event(self: &Arc<Self>, event: StreamEvent) {
        match event {
            StreamEvent::TrackEnded { fields } => {
                info!("Stream of room {} ended", self.room_id);

                if let Err(e) = self.write_room(RoomPatch::stream(fields), Slice::Stream).await {
                    warn!("Could not clear ended stream: {}", e);
                }
            }
        }
    }

    /// Applies a patch optimistically, persists it and broadcasts it.
    /// A patch that can't be persisted stays visible with an error on its slice,
    /// until it is resubmitted, discarded or overridden by a later write.
    async fn write_room(self: &Arc<Self>, patch: RoomPatch, slice: Slice) -> Result<()> {
        self.drop_overridden_writes(&patch);

        self.room.lock().apply_local(patch.clone());
        self.publish_room();
        self.sync_effects().await;

        self.persist_room(patch, slice).await
    }

    /// Stores a pending patch and broadcasts it once stored.
    async fn persist_room(self: &Arc<Self>, patch: RoomPatch, slice: Slice) -> Result<()> {
        let key = RoomReducer::key(&patch);

        let result = {
            let _sync = self.room_sync.lock().await;
            let result = self
                .context
                .database
                .update_room(patch.to_update(self.room_id))
                .await;

            if let Ok(room) = &result {
                self.room.lock().settle(&key, RoomState::from(room.clone()));
            }

            result
        };

        if let Err(e) = result {
            let error = self.surface(e.into()).await;

            self.room.lock().fail(&key, &error);
            self.failed_writes.lock().push((slice, patch));
            self.set_error(slice, Some(error.clone()));

            return Err(error);
        }

        self.publish_room();
        self.set_error(slice, None);
        self.sync_effects().await;

        self.publish(Topic::updates(self.room_id), EventKind::RoomUpdates, &patch)
            .await
            .map_err(|error| {
                self.set_error(slice, Some(error.clone()));
                error
            })
    }

    /// Forgets failed writes to the field groups a new local patch overrides.
    fn drop_overridden_writes(&self, patch: &RoomPatch) {
        let overridden: Vec<_> = {
            let mut failed = self.failed_writes.lock();
            let (overridden, kept) = std::mem::take(&mut *failed)
                .into_iter()
                .partition(|(_, p)| RoomReducer::supersede(p, patch).is_none());

            *failed = kept;
            overridden
        };

        for (slice, p) in overridden {
            self.room.lock().reset(&p.id);
            self.set_error(slice, None);
        }
    }

    async fn discard_writes(self: &Arc<Self>, filter: impl Fn(Slice) -> bool) {
        let discarded: Vec<_> = {
            let mut failed = self.failed_writes.lock();
            let (discarded, kept) = std::mem::take(&mut *failed)
                .into_iter()
                .partition(|(slice, _)| filter(*slice));

            *failed = kept;
            discarded
        };

        if discarded.is_empty() {
            return;
        }

        for (slice, patch) in discarded {
            self.room.lock().reset(&patch.id);
            self.set_error(slice, None);
        }

        self.publish_room();
        self.sync_effects().await;
    }

    async fn refresh_room(&self) -> Result<()> {
        let result = {
            let _sync = self.room_sync.lock().await;
            let result = self.context.database.room_by_id(self.room_id).await;

            if let Ok(room) = &result {
                self.room.lock().rebase(RoomState::from(room.clone()));
            }

            result
        };

        match result {
            Ok(_) => {
                self.publish_room();
                Ok(())
            }
            Err(e) => Err(self.surface(e.into()).await),
        }
    }

    async fn deliver_message(&self, message: MessageData) -> Result<MessageData> {
        let new_message = NewMessage {
            id: message.id,
            room_id: self.room_id,
            sender_id: message.sender.id,
            content: message.content.clone(),
            sent_at: message.sent_at,
        };

        let stored = match self.context.database.create_message(new_message).await {
            Ok(stored) => stored,
            Err(e) => {
                let error = self.surface(e.into()).await;
                warn!("Could not send message {}: {}", message.id, error);

                self.messages.lock().fail(&message.id, &error);
                self.set_message_error(Some(MessageError {
                    error: error.clone(),
                    message_id: Some(message.id),
                    content: message.content,
                }));

                return Err(error);
            }
        };

        self.messages.lock().confirm(&stored.id);
        self.publish_messages();
        self.set_message_error(None);

        // Stored messages reach late peers through the store, so a failed broadcast is not an error
        if let Err(e) = self
            .publish(Topic::messages(self.room_id), EventKind::NewMessage, &stored)
            .await
        {
            warn!("Could not broadcast message {}: {}", stored.id, e);
        }

        Ok(stored)
    }

    /// Validates and persists a display name, showing it right away.
    async fn claim_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CollabError::NameRequired);
        }

        let participant = self.participant();
        if participant.name == name {
            return Ok(());
        }

        match self
            .context
            .database
            .participant_by_name(self.room_id, name)
            .await
        {
            Ok(other) if other.id != participant.id => {
                return Err(CollabError::NameConflict(name.to_string()))
            }
            Err(e) if !e.is_not_found() => return Err(self.surface(e.into()).await),
            _ => {}
        }

        self.participant.lock().name = name.to_string();

        let updated = self
            .context
            .database
            .update_participant(UpdatedParticipant {
                id: participant.id,
                name: Some(name.to_string()),
            })
            .await;

        match updated {
            Ok(updated) => *self.participant.lock() = updated,
            Err(e) => {
                self.participant.lock().name = participant.name;
                return Err(self.surface(e.into()).await);
            }
        }

        self.presence.rename(name).await?;

        info!("Participant {} is now known as {}", participant.id, name);

        Ok(())
    }

    /// Follows the visible room state with the media and the guest stream.
    async fn sync_effects(self: &Arc<Self>) {
        if self.token.is_cancelled() {
            return;
        }

        let state = self.room.lock().visible();
        self.sync_media(&state).await;

        if let Err(e) = self.stream.sync_guest(&state.stream).await {
            warn!("Could not watch the stream of room {}: {}", self.room_id, e);
            self.set_error(Slice::Stream, Some(e.into()));
        }
    }

    async fn sync_media(self: &Arc<Self>, state: &RoomState) {
        let current = self.observed.media.borrow().clone();
        let source = VideoSource::parse(&state.video_source);
        let wanted = source.as_ref().ok().and_then(VideoSource::content_uri);

        if let Some(previous) = current.content_uri() {
            if Some(previous) != wanted {
                self.abandon_content(previous).await;
            }
        }

        let media = match source {
            Ok(VideoSource::Url(url)) => Media::Url(url),
            Err(reason) => Media::Invalid {
                source: state.video_source.clone(),
                reason,
            },
            Ok(VideoSource::Content(uri)) => {
                let local = self
                    .local_file
                    .lock()
                    .as_ref()
                    .filter(|(local, _)| *local == uri)
                    .map(|(_, file)| file.clone());

                // Fetching, streamable or unavailable content is kept until
                // the source changes or the content is retried
                let resolved = current.content_uri() == Some(&uri)
                    && !matches!(current, Media::LocalFile { .. });

                match local {
                    Some(file) => Media::LocalFile { uri, file },
                    None if resolved => return,
                    None if state.uploader_id == Some(self.participant_id()) => {
                        Media::Unavailable {
                            uri,
                            reason: "The uploaded file is no longer available".to_string(),
                        }
                    }
                    None => {
                        self.start_download(uri.clone());
                        Media::Fetching { uri }
                    }
                }
            }
        };

        self.set_media(media);
    }

    fn start_download(self: &Arc<Self>, uri: ContentUri) {
        let session = Arc::downgrade(self);
        let torrent = self.context.torrent.clone();

        tokio::spawn(async move {
            let result = torrent.download(&uri).await;

            if let Some(session) = session.upgrade() {
                session.finish_download(uri, result);
            }
        });
    }

    fn finish_download(
        &self,
        uri: ContentUri,
        result: std::result::Result<StreamHandle, TorrentError>,
    ) {
        let (media, error) = match result {
            Ok(handle) => {
                info!("Content {} of room {} is ready", uri, self.room_id);
                (Media::Streamable(handle), None)
            }
            Err(e) => {
                warn!("Content {} of room {} is unavailable: {}", uri, self.room_id, e);

                let error = CollabError::from(e);
                let media = Media::Unavailable {
                    uri: uri.clone(),
                    reason: error.to_string(),
                };

                (media, Some(error))
            }
        };

        // The room may have moved on while fetching
        let applied = self.observed.media.send_if_modified(|current| {
            let wanted = matches!(current, Media::Fetching { uri: u } if *u == uri);

            if wanted {
                *current = media;
            }

            wanted
        });

        if applied {
            self.set_error(Slice::Content, error);
        }
    }

    async fn abandon_content(&self, uri: &ContentUri) {
        debug!("Letting go of {}", uri);

        self.context.torrent.stop_if_current(uri).await;

        let mut local_file = self.local_file.lock();
        if local_file.as_ref().is_some_and(|(local, _)| local == uri) {
            *local_file = None;
        }
    }

    /// Stops everything the session drives. Returns the stream fields to
    /// persist if this participant was publishing.
    async fn release(&self) -> Option<StreamFields> {
        self.token.cancel();
        self.presence.leave().await;

        let content = self.observed.media.borrow().content_uri().cloned();
        if let Some(uri) = content {
            self.abandon_content(&uri).await;
        }

        self.stream.shutdown().await
    }

    async fn surface(&self, error: CollabError) -> CollabError {
        if error.is_terminal() {
            self.terminate(error.clone()).await;
        }

        error
    }

    async fn terminate(&self, error: CollabError) {
        let first = self.observed.terminated.send_if_modified(|terminated| {
            if terminated.is_some() {
                return false;
            }

            *terminated = Some(error.clone());
            true
        });

        if first {
            warn!("Room session {} ended: {}", self.room_id, error);
            self.release().await;
        }
    }

    async fn publish<T>(&self, topic: Topic, kind: EventKind, payload: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.context
            .bus
            .publish(topic, kind, self.participant_id(), payload)
            .await
            .map_err(CollabError::from)
    }

    fn publish_room(&self) {
        let visible = self.room.lock().visible();

        self.observed.room.send_if_modified(|room| {
            let changed = *room != visible;
            *room = visible;
            changed
        });
    }

    fn publish_messages(&self) {
        let visible = self.messages.lock().visible();

        self.observed.messages.send_if_modified(|messages| {
            let changed = *messages != visible;
            *messages = visible;
            changed
        });
    }

    fn set_media(&self, media: Media) {
        self.observed.media.send_if_modified(|current| {
            let changed = *current != media;
            *current = media;
            changed
        });
    }

    fn set_error(&self, slice: Slice, error: Option<CollabError>) {
        self.observed.errors.send_if_modified(|errors| {
            let target = match slice {
                Slice::VideoSource => &mut errors.video_source,
                Slice::Stream => &mut errors.stream,
                Slice::Content => &mut errors.content,
            };

            let changed = *target != error;
            *target = error;
            changed
        });
    }

    fn set_message_error(&self, error: Option<MessageError>) {
        self.observed.errors.send_if_modified(|errors| {
            let changed = errors.message != error;
            errors.message = error;
            changed
        });
    }
}

/// Folds every inbound event of a session, one at a time, until the session ends.
async fn consume<Db, B>(
    session: Weak<RoomSession<Db, B>>,
    mut messages: SubscriptionHandle<B>,
    mut updates: SubscriptionHandle<B>,
    mut stream_events: StreamEvents,
    token: CancellationToken,
) where
    Db: Database,
    B: Bus,
{
    loop {
        let inbound = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            delivery = messages.recv() => delivery.map(Inbound::Delivery),
            delivery = updates.recv() => delivery.map(Inbound::Delivery),
            event = stream_events.recv() => event.map(Inbound::Stream),
        };

        let Some(inbound) = inbound else {
            warn!("A room subscription closed, stopping consumer");
            break;
        };

        let Some(session) = session.upgrade() else {
            break;
        };

        match inbound {
            Inbound::Delivery(delivery) => session.handle_delivery(delivery).await,
            Inbound::Stream(event) => session.handle_stream_event(event).await,
        }
    }

    debug!("Consumer of {} stopped", messages.topic());
}
