use crate::actor::{ActorClient, ActorExited};
use crate::api::event_bus::{DatabaseObserver, EventListener};
use crate::append_log::Entry;
use crate::capability::CapabilityState;
use crate::ephemeral::{EphemeralMessage, MessageId, SealError};
use crate::keys::{DatabaseKey, DiscoveryHandle, ReadKey};
use crate::replication::{self, SessionConfig, SessionError, SessionHandle};
use crate::store::{SetCapabilityError, WatchHandle, WriteError};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Database is a handle to one local replica of a multi-writer database. Cloning it is cheap and
/// every clone talks to the same replica.
#[derive(Clone)]
pub struct Database {
    logger: slog::Logger,
    database_key: DatabaseKey,
    local_read_key: Option<ReadKey>,
    actor: ActorClient,
    session_options: SessionOptions,
}

#[derive(Copy, Clone)]
pub(super) struct SessionOptions {
    pub(super) max_frame_length: usize,
    pub(super) max_suspect_entries: usize,
    pub(super) sync_batch_size: usize,
}

impl Database {
    pub(super) fn new(
        logger: slog::Logger,
        database_key: DatabaseKey,
        local_read_key: Option<ReadKey>,
        actor: ActorClient,
        session_options: SessionOptions,
    ) -> Self {
        Database {
            logger,
            database_key,
            local_read_key,
            actor,
            session_options,
        }
    }

    /// The origin writer's read key, which identifies the database.
    pub fn database_key(&self) -> DatabaseKey {
        self.database_key
    }

    /// The hyphalink users share to let others open this database.
    pub fn hyphalink(&self) -> String {
        self.database_key.to_hex()
    }

    pub fn discovery_handle(&self) -> DiscoveryHandle {
        self.database_key.discovery_handle()
    }

    /// The key this node writes under, if it has one.
    pub fn local_read_key(&self) -> Option<ReadKey> {
        self.local_read_key
    }

    /// Appends a write of `value` at `path` to the local writer's log.
    pub async fn put(&self, path: impl Into<String>, value: Value) -> Result<Entry, PutError> {
        self.actor.put(path.into(), value).await
    }

    /// Resolves `path` across all authorized writers.
    pub async fn get(&self, path: impl Into<String>) -> Result<Value, GetError> {
        self.actor.get(path.into()).await
    }

    /// Calls `callback` each time the resolved value of `path` changes, at most once per applied
    /// batch. Stops when the returned handle is dropped.
    pub async fn watch<C>(&self, path: impl Into<String>, callback: C) -> Result<WatchHandle, ActorExited>
    where
        C: FnMut(Option<&Value>) + Send + 'static,
    {
        self.actor.watch(path.into(), Box::new(callback)).await
    }

    /// Grants `subject` the right to write. The local writer must be authorized itself.
    pub async fn authorize(&self, subject: ReadKey) -> Result<Entry, AuthorizeError> {
        self.actor.set_capability(subject, CapabilityState::Authorized).await
    }

    pub async fn revoke(&self, subject: ReadKey) -> Result<Entry, AuthorizeError> {
        self.actor.set_capability(subject, CapabilityState::Revoked).await
    }

    /// Records that `subject` asked for write access and an authorizer has seen the request.
    pub async fn mark_pending(&self, subject: ReadKey) -> Result<Entry, AuthorizeError> {
        self.actor.set_capability(subject, CapabilityState::Pending).await
    }

    pub async fn is_authorized(&self, writer: ReadKey) -> Result<bool, ActorExited> {
        Ok(self.capability_state(writer).await? == Some(CapabilityState::Authorized))
    }

    /// `None` if no capability record mentions `writer`.
    pub async fn capability_state(&self, writer: ReadKey) -> Result<Option<CapabilityState>, ActorExited> {
        self.actor.capability_state(writer).await
    }

    /// Sends an ephemeral message, signed as the local writer, to every live peer. Returns the
    /// message's id.
    pub async fn broadcast(&self, action: impl Into<String>, payload: Value) -> Result<MessageId, BroadcastError> {
        let sender = self.local_read_key.ok_or(BroadcastError::NotAWriter)?;
        self.actor
            .broadcast(EphemeralMessage::new(sender, action, payload))
            .await
    }

    /// Starts replicating with one peer over `stream`. With `live`, the session stays open after
    /// sync and pushes new entries and ephemeral messages, provided the peer asked for live too.
    pub async fn replicate<S>(&self, stream: S, live: bool) -> Result<SessionHandle, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let config = SessionConfig {
            logger: self.logger.clone(),
            database_key: self.database_key,
            live,
            max_frame_length: self.session_options.max_frame_length,
            max_suspect_entries: self.session_options.max_suspect_entries,
            sync_batch_size: self.session_options.sync_batch_size,
        };

        replication::start(config, self.actor.clone(), stream).await
    }

    pub async fn subscribe<O: DatabaseObserver>(&self, observer: O) -> Result<(), ActorExited> {
        self.actor.subscribe(Box::new(observer)).await
    }

    /// Returns a listener for everything this database observes from now on.
    pub async fn events(&self) -> Result<EventListener, ActorExited> {
        let (listener, observer) = EventListener::new(self.logger.clone());
        self.subscribe(observer).await?;
        Ok(listener)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PutError {
    #[error("This node holds no write key")]
    NotAWriter,
    #[error("{0:?} is not currently authorized to write")]
    Unauthorized(ReadKey),
    #[error("Value can't be encoded")]
    InvalidValue(serde_json::Error),
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
    #[error("Database task has exited")]
    ActorExited,
}

impl PutError {
    /// Only local I/O is worth retrying. Authorization has to be requested again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PutError::LocalIoError(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GetError {
    #[error("Nothing is written at {0}")]
    NotFound(String),
    #[error("Database task has exited")]
    ActorExited,
}

impl GetError {
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorizeError {
    #[error("This node holds no write key")]
    NotAWriter,
    #[error("{0:?} is not currently authorized to grant access")]
    Unauthorized(ReadKey),
    #[error("The origin writer's authorization can't be changed")]
    OriginIsPermanent,
    #[error("Failed to encode capability record")]
    Encoding(serde_json::Error),
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
    #[error("Database task has exited")]
    ActorExited,
}

impl AuthorizeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthorizeError::LocalIoError(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("This node holds no write key to sign as")]
    NotAWriter,
    #[error("This node holds no channel key and can only relay")]
    NoChannelKey,
    #[error("Message can't be encoded")]
    Encoding(serde_json::Error),
    #[error("Failed to encrypt message")]
    Encryption,
    #[error("Database task has exited")]
    ActorExited,
}

impl BroadcastError {
    pub fn is_retryable(&self) -> bool {
        false
    }
}

// -- Conversions --

impl From<WriteError> for PutError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::NotAWriter => PutError::NotAWriter,
            WriteError::Unauthorized(writer) => PutError::Unauthorized(writer),
            WriteError::Encoding(e) => PutError::InvalidValue(e),
            WriteError::LocalIoError(e) => PutError::LocalIoError(e),
        }
    }
}

impl From<SetCapabilityError> for AuthorizeError {
    fn from(e: SetCapabilityError) -> Self {
        match e {
            SetCapabilityError::Write(WriteError::NotAWriter) => AuthorizeError::NotAWriter,
            SetCapabilityError::Write(WriteError::Unauthorized(writer)) => AuthorizeError::Unauthorized(writer),
            SetCapabilityError::Write(WriteError::Encoding(e)) => AuthorizeError::Encoding(e),
            SetCapabilityError::Write(WriteError::LocalIoError(e)) => AuthorizeError::LocalIoError(e),
            SetCapabilityError::OriginIsPermanent => AuthorizeError::OriginIsPermanent,
        }
    }
}

impl From<SealError> for BroadcastError {
    fn from(e: SealError) -> Self {
        match e {
            SealError::NoChannelKey => BroadcastError::NoChannelKey,
            SealError::Encoding(e) => BroadcastError::Encoding(e),
            SealError::Encryption => BroadcastError::Encryption,
        }
    }
}

impl From<ActorExited> for PutError {
    fn from(_: ActorExited) -> Self {
        PutError::ActorExited
    }
}

impl From<ActorExited> for GetError {
    fn from(_: ActorExited) -> Self {
        GetError::ActorExited
    }
}

impl From<ActorExited> for AuthorizeError {
    fn from(_: ActorExited) -> Self {
        AuthorizeError::ActorExited
    }
}

impl From<ActorExited> for BroadcastError {
    fn from(_: ActorExited) -> Self {
        BroadcastError::ActorExited
    }
}
