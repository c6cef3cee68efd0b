use crate::api::{
    AuthorizeError, BroadcastError, DatabaseObserver, GetError, NodeSettings, PutError, SettingsStore,
};
use crate::append_log::{Entry, VerifyError};
use crate::capability::{CapabilityChange, CapabilityState};
use crate::commitlog::{LogFactory, Sequence};
use crate::ephemeral::{self, EphemeralChannel, EphemeralMessage, MessageId};
use crate::keys::ReadKey;
use crate::replication::{SessionCommand, SessionId};
use crate::store::{BatchHalt, LocalWrite, MultiLogStore, ReceiveBatch, WatchCallback, WatchHandle};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// Everything that touches a database's state goes through this event loop, one event at a time.
// Replication sessions and the public API are only clients of it.
pub(crate) enum Event {
    Put(String, Value, Callback<Entry, PutError>),
    Get(String, Callback<Value, GetError>),
    SetCapability(ReadKey, CapabilityState, Callback<Entry, AuthorizeError>),
    CapabilityState(ReadKey, oneshot::Sender<Option<CapabilityState>>),
    Watch(String, WatchCallback, oneshot::Sender<WatchHandle>),
    Broadcast(EphemeralMessage, Callback<MessageId, BroadcastError>),
    Subscribe(Box<dyn DatabaseObserver>),

    // Replication sessions.
    OpenSession(oneshot::Sender<(SessionId, mpsc::UnboundedReceiver<SessionCommand>)>),
    Heads(oneshot::Sender<Vec<(ReadKey, u64)>>),
    ReadEntries(ReadEntriesInput, Callback<Vec<Entry>, io::Error>),
    ReceiveEntries(ReceiveEntriesInput, Callback<ReceiveEntriesOutput, ReceiveEntriesError>),
    EphemeralReceived(SessionId, Bytes),
    SessionLive(SessionId, SessionCapabilities),
    SessionClosed(SessionId, Option<String>),
}

pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

pub(crate) struct ReadEntriesInput {
    pub(crate) writer: ReadKey,
    pub(crate) from: Sequence,
    pub(crate) limit: usize,
}

pub(crate) struct ReceiveEntriesInput {
    pub(crate) session: SessionId,
    pub(crate) writer: ReadKey,
    pub(crate) entries: Vec<Entry>,
}

#[derive(Debug)]
pub(crate) struct ReceiveEntriesOutput {
    /// How many entries from the front of the batch are now held locally.
    pub(crate) accepted: usize,
    pub(crate) rejection: Option<VerifyError>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReceiveEntriesError {
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
    #[error("Database task has exited")]
    ActorExited,
}

/// What a session agreed with its peer during the handshake.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SessionCapabilities {
    pub(crate) ephemeral: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("Database task has exited")]
pub struct ActorExited;

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) async fn put(&self, path: String, value: Value) -> Result<Entry, PutError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Put(path, value, Callback(tx))).await?;
        rx.await.unwrap_or(Err(PutError::ActorExited))
    }

    pub(crate) async fn get(&self, path: String) -> Result<Value, GetError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Get(path, Callback(tx))).await?;
        rx.await.unwrap_or(Err(GetError::ActorExited))
    }

    pub(crate) async fn set_capability(
        &self,
        subject: ReadKey,
        state: CapabilityState,
    ) -> Result<Entry, AuthorizeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::SetCapability(subject, state, Callback(tx))).await?;
        rx.await.unwrap_or(Err(AuthorizeError::ActorExited))
    }

    pub(crate) async fn capability_state(&self, subject: ReadKey) -> Result<Option<CapabilityState>, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::CapabilityState(subject, tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn watch(&self, path: String, callback: WatchCallback) -> Result<WatchHandle, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Watch(path, callback, tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn broadcast(&self, message: EphemeralMessage) -> Result<MessageId, BroadcastError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Broadcast(message, Callback(tx))).await?;
        rx.await.unwrap_or(Err(BroadcastError::ActorExited))
    }

    pub(crate) async fn subscribe(&self, observer: Box<dyn DatabaseObserver>) -> Result<(), ActorExited> {
        self.send(Event::Subscribe(observer)).await
    }

    pub(crate) async fn open_session(
        &self,
    ) -> Result<(SessionId, mpsc::UnboundedReceiver<SessionCommand>), ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::OpenSession(tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn heads(&self) -> Result<Vec<(ReadKey, u64)>, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Heads(tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn read_entries(&self, input: ReadEntriesInput) -> Result<Vec<Entry>, ReadEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ReadEntries(input, Callback(tx))).await?;
        match rx.await {
            Ok(result) => result.map_err(ReadEntriesError::LocalIoError),
            Err(_) => Err(ReadEntriesError::ActorExited),
        }
    }

    pub(crate) async fn receive_entries(
        &self,
        input: ReceiveEntriesInput,
    ) -> Result<ReceiveEntriesOutput, ReceiveEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ReceiveEntries(input, Callback(tx)))
            .await
            .map_err(|_| ReceiveEntriesError::ActorExited)?;
        rx.await.unwrap_or(Err(ReceiveEntriesError::ActorExited))
    }

    pub(crate) async fn ephemeral_received(&self, session: SessionId, payload: Bytes) -> Result<(), ActorExited> {
        self.send(Event::EphemeralReceived(session, payload)).await
    }

    pub(crate) async fn session_live(&self, session: SessionId, capabilities: SessionCapabilities) -> Result<(), ActorExited> {
        self.send(Event::SessionLive(session, capabilities)).await
    }

    pub(crate) async fn session_closed(&self, session: SessionId, error: Option<String>) -> Result<(), ActorExited> {
        self.send(Event::SessionClosed(session, error)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReadEntriesError {
    #[error("Failed to read log")]
    LocalIoError(io::Error),
    #[error("Database task has exited")]
    ActorExited,
}

struct SessionLink {
    commands: mpsc::UnboundedSender<SessionCommand>,
    live: bool,
    ephemeral: bool,
}

/// DatabaseActor owns a database's state and applies events to it one at a time.
pub(crate) struct DatabaseActor<F>
where
    F: LogFactory<Entry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    store: MultiLogStore<F>,
    ephemeral: EphemeralChannel,
    sessions: BTreeMap<SessionId, SessionLink>,
    next_session_id: u64,
    observers: Vec<Box<dyn DatabaseObserver>>,
    settings: NodeSettings,
    settings_store: Arc<dyn SettingsStore>,
}

impl<F> DatabaseActor<F>
where
    F: LogFactory<Entry> + Send + 'static,
    F::Log: Send,
{
    pub(crate) fn new(
        logger: slog::Logger,
        receiver: mpsc::Receiver<Event>,
        store: MultiLogStore<F>,
        ephemeral: EphemeralChannel,
        settings: NodeSettings,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Self {
        DatabaseActor {
            logger,
            receiver,
            store,
            ephemeral,
            sessions: BTreeMap::new(),
            next_session_id: 0,
            observers: vec![],
            settings,
            settings_store,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Event loop exited.");
    }

    // This must NOT be async. Anything slow is spawned, and reports back as another event if it
    // needs to.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Put(path, value, callback) => {
                let result = self
                    .store
                    .put(path, value)
                    .map(|write| self.after_local_write(write))
                    .map_err(PutError::from);
                callback.send(result);
            }
            Event::Get(path, callback) => {
                callback.send(self.store.get(&path).ok_or(GetError::NotFound(path)));
            }
            Event::SetCapability(subject, state, callback) => {
                let result = match state {
                    CapabilityState::Authorized => self.store.authorize(subject),
                    CapabilityState::Revoked => self.store.revoke(subject),
                    CapabilityState::Pending => self.store.mark_pending(subject),
                };
                let result = result
                    .map(|write| self.after_local_write(write))
                    .map_err(AuthorizeError::from);
                callback.send(result);
            }
            Event::CapabilityState(subject, callback) => {
                let _ = callback.send(self.store.capability_state(&subject));
            }
            Event::Watch(path, watch_callback, callback) => {
                let _ = callback.send(self.store.watch(path, watch_callback));
            }
            Event::Broadcast(message, callback) => {
                callback.send(self.broadcast(message));
            }
            Event::Subscribe(observer) => {
                self.observers.push(observer);
            }
            Event::OpenSession(callback) => {
                let id = SessionId::new(self.next_session_id);
                self.next_session_id += 1;

                let (tx, rx) = mpsc::unbounded_channel();
                self.sessions.insert(
                    id,
                    SessionLink {
                        commands: tx,
                        live: false,
                        ephemeral: false,
                    },
                );
                if callback.send((id, rx)).is_err() {
                    self.sessions.remove(&id);
                }
            }
            Event::Heads(callback) => {
                let _ = callback.send(self.store.heads());
            }
            Event::ReadEntries(input, callback) => {
                callback.send(self.store.read_entries(&input.writer, input.from, input.limit));
            }
            Event::ReceiveEntries(input, callback) => {
                let session = input.session;
                let writer = input.writer;
                let batch = self.store.receive_entries(writer, input.entries);
                callback.send(self.after_receive(session, writer, batch));
            }
            Event::EphemeralReceived(session, payload) => {
                self.handle_ephemeral_frame(session, payload);
            }
            Event::SessionLive(session, capabilities) => {
                if let Some(link) = self.sessions.get_mut(&session) {
                    link.live = true;
                    link.ephemeral = capabilities.ephemeral;
                    slog::info!(self.logger, "Session {} is live ({} live).", session, self.live_session_count());
                }
            }
            Event::SessionClosed(session, error) => {
                self.sessions.remove(&session);
                for observer in self.observers.iter_mut() {
                    observer.on_session_closed(session, error.as_deref());
                }
            }
        }
    }

    fn after_local_write(&mut self, write: LocalWrite) -> Entry {
        if let Some(writer) = self.store.local_read_key() {
            self.push_entry(None, writer, &write.entry);
        }
        self.handle_capability_changes(&write.capability_changes);
        write.entry
    }

    fn after_receive(
        &mut self,
        session: SessionId,
        writer: ReadKey,
        batch: ReceiveBatch,
    ) -> Result<ReceiveEntriesOutput, ReceiveEntriesError> {
        for entry in batch.applied.iter() {
            self.push_entry(Some(session), writer, entry);
            for observer in self.observers.iter_mut() {
                observer.on_entry_received(&writer, entry);
            }
        }
        self.handle_capability_changes(&batch.capability_changes);

        match batch.halted {
            None => Ok(ReceiveEntriesOutput {
                accepted: batch.accepted,
                rejection: None,
            }),
            Some(BatchHalt::Rejected(e)) => Ok(ReceiveEntriesOutput {
                accepted: batch.accepted,
                rejection: Some(e),
            }),
            Some(BatchHalt::LocalIoError(e)) => Err(ReceiveEntriesError::LocalIoError(e)),
        }
    }

    /// Hands a newly stored entry to every session except the one it came from. Sessions decide
    /// for themselves whether their peer still needs it.
    fn push_entry(&mut self, source: Option<SessionId>, writer: ReadKey, entry: &Entry) {
        for (id, link) in self.sessions.iter() {
            if Some(*id) == source {
                continue;
            }
            let _ = link.commands.send(SessionCommand::Append {
                writer,
                entry: entry.clone(),
            });
        }
    }

    fn handle_capability_changes(&mut self, changes: &[CapabilityChange]) {
        let local = self.store.local_read_key();

        for change in changes {
            slog::info!(
                self.logger,
                "Capability of {:?} changed from {:?} to {:?}",
                change.subject,
                change.previous,
                change.current
            );
            for observer in self.observers.iter_mut() {
                observer.on_capability_changed(change);
            }

            if Some(change.subject) == local {
                self.settings.is_authorised_node = change.current == Some(CapabilityState::Authorized);
                self.persist_settings();
            }
        }
    }

    fn persist_settings(&self) {
        let logger = self.logger.clone();
        let settings = self.settings.clone();
        let settings_store = self.settings_store.clone();

        tokio::spawn(async move {
            if let Err(e) = settings_store.store(settings).await {
                slog::warn!(logger, "Failed to persist node settings: {}", e);
            }
        });
    }

    fn broadcast(&mut self, message: EphemeralMessage) -> Result<MessageId, BroadcastError> {
        let (id, sealed) = self.ephemeral.seal(&message)?;
        let sent = self.forward_ephemeral(None, Bytes::from(sealed));
        slog::debug!(self.logger, "Broadcast {:?} to {} sessions.", id, sent);
        Ok(id)
    }

    fn handle_ephemeral_frame(&mut self, session: SessionId, payload: Bytes) {
        match self.ephemeral.receive(&payload) {
            ephemeral::ReceiveOutcome::Delivered(message) => {
                for observer in self.observers.iter_mut() {
                    observer.on_message(&message);
                }
                self.forward_ephemeral(Some(session), payload);
            }
            ephemeral::ReceiveOutcome::Duplicate(id) => {
                slog::trace!(self.logger, "Dropping duplicate message {:?}", id);
            }
            ephemeral::ReceiveOutcome::BadMessage(reason) => {
                slog::warn!(self.logger, "Bad message from session {}: {}", session, reason);
                for observer in self.observers.iter_mut() {
                    observer.on_bad_message(session, &reason);
                }
            }
            ephemeral::ReceiveOutcome::Relay => {
                self.forward_ephemeral(Some(session), payload);
            }
        }
    }

    fn forward_ephemeral(&self, source: Option<SessionId>, payload: Bytes) -> usize {
        let mut sent = 0;
        for (id, link) in self.sessions.iter() {
            if Some(*id) == source || !link.live || !link.ephemeral {
                continue;
            }
            if link.commands.send(SessionCommand::Ephemeral(payload.clone())).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn live_session_count(&self) -> usize {
        self.sessions.values().filter(|link| link.live).count()
    }
}

// -- Conversions --

impl From<ActorExited> for ReadEntriesError {
    fn from(_: ActorExited) -> Self {
        ReadEntriesError::ActorExited
    }
}
