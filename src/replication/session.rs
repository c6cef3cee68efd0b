use crate::actor::{
    ActorClient, ActorExited, ReadEntriesError, ReadEntriesInput, ReceiveEntriesError, ReceiveEntriesInput,
    SessionCapabilities,
};
use crate::append_log::{Entry, VerifyError};
use crate::commitlog::Sequence;
use crate::ephemeral::EXTENSION_NAME;
use crate::keys::{DatabaseKey, ReadKey};
use crate::replication::codec::{Frame, FrameCodec, FrameError, Handshake, LogHead};
use crate::replication::state::{self, SessionState, SessionStateListener, SessionStateNotifier};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::{fmt, io};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::codec::{FramedRead, FramedWrite};

const PROTOCOL_VERSION: u32 = 1;

/// Our handshake advertises exactly one extension, so its id is always 0.
const EPHEMERAL_EXTENSION_ID: u32 = 0;

/// Most bulk `Entries` frames a session queues for its writer at once. Live pushes and control
/// frames don't count against it.
const SYNC_WINDOW_FRAMES: usize = 4;

/// How long a failing session keeps writing before it hangs up.
const ERROR_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Identifies one replication session within a database.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(id: u64) -> Self {
        SessionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the database's event loop asks of a session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// `entry` was just stored locally. Push it if the peer doesn't have it.
    Append { writer: ReadKey, entry: Entry },
    /// A sealed ephemeral frame to pass on to the peer.
    Ephemeral(Bytes),
}

pub(crate) struct SessionConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) database_key: DatabaseKey,
    pub(crate) live: bool,
    pub(crate) max_frame_length: usize,
    pub(crate) max_suspect_entries: usize,
    pub(crate) sync_batch_size: usize,
}

/// SessionHandle observes and controls a running replication session.
pub struct SessionHandle {
    id: SessionId,
    state: SessionStateListener,
    close: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Waits until the session is at or past `state` (e.g. `Live`), and returns the state it is
    /// in then. A session that fails or finishes returns `Closed`.
    pub async fn wait_for(&mut self, state: SessionState) -> SessionState {
        self.state.reached(state).await
    }

    /// Asks the session to close. Frames not yet written are discarded.
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    /// Waits for the session to end. `Ok` means it ended cleanly: sync completed (non-live) and
    /// every frame for the peer was written, the peer hung up while live, or `close` was called.
    /// There is no deadline; wrap the call in a timeout to impose one.
    pub async fn join(self) -> Result<(), SessionError> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::TaskFailed),
        }
    }
}

/// Registers a session with the database and starts it on its own task.
pub(crate) async fn start<S>(config: SessionConfig, actor: ActorClient, stream: S) -> Result<SessionHandle, SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (id, commands) = actor.open_session().await?;
    let logger = config.logger.new(slog::o!("session" => id.as_u64()));
    let (notifier, listener) = state::new(SessionState::Handshaking);
    let (close_tx, close_rx) = oneshot::channel();

    let session = ReplicationSession {
        id,
        logger,
        database_key: config.database_key,
        wants_live: config.live,
        max_frame_length: config.max_frame_length,
        max_suspect_entries: config.max_suspect_entries,
        sync_batch_size: config.sync_batch_size,
        actor,
        state: notifier,
    };
    let task = tokio::spawn(session.run(stream, commands, close_rx));

    Ok(SessionHandle {
        id,
        state: listener,
        close: Some(close_tx),
        task,
    })
}

struct ReplicationSession {
    id: SessionId,
    logger: slog::Logger,
    database_key: DatabaseKey,
    wants_live: bool,
    max_frame_length: usize,
    max_suspect_entries: usize,
    sync_batch_size: usize,
    actor: ActorClient,
    state: SessionStateNotifier,
}

/// How the exchange ended, when it ended without error.
#[derive(Debug)]
enum Exit {
    /// Both sides synced and at least one didn't want live mode.
    Completed,
    /// Peer hung up while live.
    PeerClosed,
    /// `SessionHandle::close`.
    LocalClose,
}

/// Which part of one log still has to be sent to the peer: `next..until`.
#[derive(Debug)]
struct Cursor {
    next: u64,
    until: u64,
}

impl Cursor {
    fn is_pending(&self) -> bool {
        self.next < self.until
    }
}

struct Outgoing {
    frame: Frame,
    // Held until the frame is written, to bound queued sync data.
    _permit: Option<OwnedSemaphorePermit>,
}

/// Protocol progress after the handshake.
struct SyncProgress {
    peer_extensions: Vec<String>,
    peer_ephemeral: bool,
    live: bool,
    /// Log lengths from the peer's `Have`. `None` until it arrives.
    peer_heads: Option<BTreeMap<ReadKey, u64>>,
    cursors: BTreeMap<ReadKey, Cursor>,
    sent_sync_complete: bool,
    peer_sync_complete: bool,
    rejected_batches: usize,
}

impl SyncProgress {
    fn has_pending(&self) -> bool {
        self.cursors.values().any(Cursor::is_pending)
    }

    fn cursor(&mut self, writer: ReadKey) -> &mut Cursor {
        let peer_length = self
            .peer_heads
            .as_ref()
            .and_then(|heads| heads.get(&writer).copied())
            .unwrap_or(0);

        self.cursors.entry(writer).or_insert(Cursor {
            next: peer_length,
            until: peer_length,
        })
    }
}

impl ReplicationSession {
    async fn run<S>(
        self,
        stream: S,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        close: oneshot::Receiver<()>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        slog::info!(self.logger, "Session started (live requested: {}).", self.wants_live);

        let result = self.run_protocol(stream, commands, close).await;
        self.state.notify_new_state(SessionState::Closed);

        let error = match &result {
            Ok(exit) => {
                slog::info!(self.logger, "Session closed: {:?}", exit);
                None
            }
            Err(e) => {
                slog::warn!(self.logger, "Session failed: {}", e);
                Some(e.to_string())
            }
        };
        let _ = self.actor.session_closed(self.id, error).await;

        result.map(|_| ())
    }

    async fn run_protocol<S>(
        &self,
        stream: S,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut close: oneshot::Receiver<()>,
    ) -> Result<Exit, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let codec = FrameCodec::new(self.max_frame_length);
        let mut frames = FramedRead::new(reader, codec.clone());

        // Writes happen on their own task, so a peer that is slow to read never stops us from
        // reading (and the peer from writing).
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_frames(FramedWrite::new(writer, codec), outgoing_rx));

        let result = self
            .exchange(&mut frames, &outgoing, &mut commands, &mut close)
            .await;
        drop(outgoing);

        match result {
            Ok(Exit::LocalClose) => writer_task.abort(),
            // Sync isn't done until everything we queued has been written out, however long a
            // slow reader takes.
            Ok(Exit::Completed) => match drain_until_written(&mut frames, writer_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(SessionError::TaskFailed),
            },
            // The peer is gone, so anything still queued has nowhere to go.
            Ok(Exit::PeerClosed) => {
                if let Ok(Err(e)) = writer_task.await {
                    slog::debug!(self.logger, "Peer hung up before reading everything: {}", e);
                }
            }
            // Give the handshake that tells the peer why we are leaving a chance to reach it.
            Err(_) => match tokio::time::timeout(ERROR_FLUSH_TIMEOUT, &mut writer_task).await {
                Ok(Ok(Err(e))) => slog::debug!(self.logger, "Writer failed while flushing: {}", e),
                Ok(_) => {}
                Err(_) => {
                    slog::debug!(self.logger, "Peer stopped reading, dropping unsent frames.");
                    writer_task.abort();
                }
            },
        }

        result
    }

    async fn exchange<R>(
        &self,
        frames: &mut FramedRead<R, FrameCodec>,
        outgoing: &mpsc::UnboundedSender<Outgoing>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        close: &mut oneshot::Receiver<()>,
    ) -> Result<Exit, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut progress = self.handshake(frames, outgoing).await?;
        self.state.notify_new_state(SessionState::Syncing);

        let heads = self.actor.heads().await?;
        send(
            outgoing,
            Frame::Have(
                heads
                    .into_iter()
                    .map(|(read_key, length)| LogHead { read_key, length })
                    .collect(),
            ),
            None,
        )?;

        let sync_window = Arc::new(Semaphore::new(SYNC_WINDOW_FRAMES));
        let mut close_detached = false;

        loop {
            if progress.peer_heads.is_some() && !progress.sent_sync_complete && !progress.has_pending() {
                send(outgoing, Frame::SyncComplete, None)?;
                progress.sent_sync_complete = true;
            }
            if self.state.current() == SessionState::Syncing
                && progress.sent_sync_complete
                && progress.peer_sync_complete
            {
                if !progress.live {
                    return Ok(Exit::Completed);
                }
                self.actor
                    .session_live(
                        self.id,
                        SessionCapabilities {
                            ephemeral: progress.peer_ephemeral,
                        },
                    )
                    .await?;
                self.state.notify_new_state(SessionState::Live);
                slog::info!(self.logger, "Synced, now live.");
            }

            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame, &mut progress).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None if self.state.current() == SessionState::Live => return Ok(Exit::PeerClosed),
                    None => return Err(SessionError::StreamClosed),
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut progress, outgoing)?,
                    None => return Err(SessionError::ActorExited),
                },
                permit = sync_window.clone().acquire_owned(), if progress.has_pending() => {
                    let permit = permit.map_err(|_| SessionError::ActorExited)?;
                    self.send_next_batch(&mut progress, outgoing, permit).await?;
                },
                result = &mut *close, if !close_detached => match result {
                    Ok(()) => return Ok(Exit::LocalClose),
                    // Handle dropped without closing; keep running.
                    Err(_) => close_detached = true,
                },
            }
        }
    }

    async fn handshake<R>(
        &self,
        frames: &mut FramedRead<R, FrameCodec>,
        outgoing: &mpsc::UnboundedSender<Outgoing>,
    ) -> Result<SyncProgress, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let discovery_handle = self.database_key.discovery_handle();
        send(
            outgoing,
            Frame::Handshake(Handshake {
                protocol_version: PROTOCOL_VERSION,
                discovery_handle,
                extensions: vec![EXTENSION_NAME.to_string()],
                live: self.wants_live,
            }),
            None,
        )?;

        let peer = match frames.next().await {
            Some(Ok(Frame::Handshake(peer))) => peer,
            Some(Ok(_)) => return Err(SessionError::Protocol("expected a handshake".to_string())),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(SessionError::StreamClosed),
        };
        if peer.protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::IncompatibleVersion(peer.protocol_version));
        }
        if peer.discovery_handle != discovery_handle {
            return Err(SessionError::WrongDatabase);
        }

        let peer_ephemeral = peer.extensions.iter().any(|name| name == EXTENSION_NAME);
        slog::debug!(
            self.logger,
            "Handshake done. Peer extensions {:?}, peer wants live: {}",
            peer.extensions,
            peer.live
        );

        Ok(SyncProgress {
            peer_extensions: peer.extensions,
            peer_ephemeral,
            live: self.wants_live && peer.live,
            peer_heads: None,
            cursors: BTreeMap::new(),
            sent_sync_complete: false,
            peer_sync_complete: false,
            rejected_batches: 0,
        })
    }

    async fn handle_frame(&self, frame: Frame, progress: &mut SyncProgress) -> Result<(), SessionError> {
        match frame {
            Frame::Handshake(_) => Err(SessionError::Protocol("unexpected second handshake".to_string())),
            Frame::Have(peer_heads) => self.handle_have(peer_heads, progress).await,
            Frame::Entries { read_key, entries } => self.handle_entries(read_key, entries, progress).await,
            Frame::SyncComplete => {
                progress.peer_sync_complete = true;
                Ok(())
            }
            Frame::Extension { id, payload } => {
                let is_ephemeral = progress
                    .peer_extensions
                    .get(id as usize)
                    .map(|name| name == EXTENSION_NAME)
                    .unwrap_or(false);
                if is_ephemeral {
                    self.actor.ephemeral_received(self.id, payload).await?;
                } else {
                    slog::debug!(self.logger, "Ignoring frame for unknown extension {}", id);
                }
                Ok(())
            }
        }
    }

    /// The peer's heads tell us where to start sending each log. Our own heads are read now,
    /// rather than at handshake time, so appends in between aren't missed.
    async fn handle_have(&self, peer_heads: Vec<LogHead>, progress: &mut SyncProgress) -> Result<(), SessionError> {
        if progress.peer_heads.is_some() {
            return Err(SessionError::Protocol("unexpected second have".to_string()));
        }
        progress.peer_heads = Some(
            peer_heads
                .into_iter()
                .map(|head| (head.read_key, head.length))
                .collect(),
        );

        for (writer, length) in self.actor.heads().await? {
            let cursor = progress.cursor(writer);
            cursor.until = cursor.until.max(length);
        }

        let pending: Vec<_> = progress
            .cursors
            .iter()
            .filter(|(_, cursor)| cursor.is_pending())
            .map(|(writer, cursor)| (*writer, cursor.next, cursor.until))
            .collect();
        slog::debug!(self.logger, "Peer is missing {:?}", pending);
        Ok(())
    }

    async fn handle_entries(
        &self,
        writer: ReadKey,
        entries: Vec<Entry>,
        progress: &mut SyncProgress,
    ) -> Result<(), SessionError> {
        if entries.is_empty() {
            return Ok(());
        }
        let sequences: Vec<Sequence> = entries.iter().map(|entry| entry.sequence()).collect();

        let output = self
            .actor
            .receive_entries(ReceiveEntriesInput {
                session: self.id,
                writer,
                entries,
            })
            .await?;

        if output.accepted > 0 {
            // The peer holds whatever it sent us, so there's no need to send it back.
            let held = sequences[output.accepted - 1].as_u64() + 1;
            let cursor = progress.cursor(writer);
            cursor.next = cursor.next.max(held);
            cursor.until = cursor.until.max(cursor.next);
        }

        if let Some(rejection) = output.rejection {
            progress.rejected_batches += 1;
            slog::warn!(
                self.logger,
                "Peer sent an entry for {:?} that failed verification ({} of {} allowed): {}",
                writer,
                progress.rejected_batches,
                self.max_suspect_entries,
                rejection
            );
            if progress.rejected_batches >= self.max_suspect_entries {
                return Err(SessionError::VerificationFailed(rejection));
            }
        }

        Ok(())
    }

    fn handle_command(
        &self,
        command: SessionCommand,
        progress: &mut SyncProgress,
        outgoing: &mpsc::UnboundedSender<Outgoing>,
    ) -> Result<(), SessionError> {
        match command {
            SessionCommand::Append { writer, entry } => {
                if progress.peer_heads.is_none() {
                    // Covered by the heads we read once the peer's `Have` arrives.
                    return Ok(());
                }

                let sequence = entry.sequence().as_u64();
                let cursor = progress.cursor(writer);
                cursor.until = cursor.until.max(sequence + 1);

                if cursor.next == sequence && cursor.until == sequence + 1 {
                    cursor.next += 1;
                    send(
                        outgoing,
                        Frame::Entries {
                            read_key: writer,
                            entries: vec![entry],
                        },
                        None,
                    )?;
                }
                Ok(())
            }
            SessionCommand::Ephemeral(payload) => {
                if self.state.current() == SessionState::Live && progress.peer_ephemeral {
                    send(
                        outgoing,
                        Frame::Extension {
                            id: EPHEMERAL_EXTENSION_ID,
                            payload,
                        },
                        None,
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Sends the next batch of the first log the peer is behind on.
    async fn send_next_batch(
        &self,
        progress: &mut SyncProgress,
        outgoing: &mpsc::UnboundedSender<Outgoing>,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), SessionError> {
        let (writer, next, until) = match progress.cursors.iter().find(|(_, cursor)| cursor.is_pending()) {
            Some((writer, cursor)) => (*writer, cursor.next, cursor.until),
            None => return Ok(()),
        };
        let limit = self.sync_batch_size.min((until - next) as usize);

        let entries = self
            .actor
            .read_entries(ReadEntriesInput {
                writer,
                from: Sequence::new(next),
                limit,
            })
            .await?;

        let cursor = progress.cursor(writer);
        if entries.is_empty() {
            // We don't hold what we thought we did; nothing more to send for this log.
            slog::warn!(self.logger, "Log {:?} ended at {} instead of {}", writer, next, until);
            cursor.until = cursor.next;
            return Ok(());
        }
        cursor.next += entries.len() as u64;

        send(
            outgoing,
            Frame::Entries {
                read_key: writer,
                entries,
            },
            Some(permit),
        )
    }
}

fn send(
    outgoing: &mpsc::UnboundedSender<Outgoing>,
    frame: Frame,
    permit: Option<OwnedSemaphorePermit>,
) -> Result<(), SessionError> {
    outgoing
        .send(Outgoing {
            frame,
            _permit: permit,
        })
        .map_err(|_| SessionError::StreamClosed)
}

/// Waits for the writer to finish. Frames the peer still sends are read and dropped, so a peer
/// blocked on writing to us can get to reading what we wrote.
async fn drain_until_written<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    mut writer_task: JoinHandle<Result<(), FrameError>>,
) -> Result<Result<(), FrameError>, tokio::task::JoinError>
where
    R: AsyncRead + Unpin,
{
    let mut reading = true;
    loop {
        tokio::select! {
            result = &mut writer_task => return result,
            frame = frames.next(), if reading => {
                if !matches!(frame, Some(Ok(_))) {
                    reading = false;
                }
            }
        }
    }
}

async fn write_frames<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(Outgoing { frame, _permit }) = outgoing.recv().await {
        sink.send(frame).await?;
    }
    sink.close().await
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Stream closed before sync completed")]
    StreamClosed,
    #[error("Stream error")]
    Io(io::Error),
    #[error("Peer violated the protocol: {0}")]
    Protocol(String),
    #[error("Peer speaks protocol version {0}")]
    IncompatibleVersion(u32),
    #[error("Peer is replicating a different database")]
    WrongDatabase,
    #[error("Peer kept sending entries that failed verification, last: {0}")]
    VerificationFailed(VerifyError),
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
    #[error("Database task has exited")]
    ActorExited,
    #[error("Session task panicked or was cancelled")]
    TaskFailed,
}

impl SessionError {
    /// Transport trouble is worth redialing for. A peer that is incompatible or misbehaving will
    /// fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::StreamClosed | SessionError::Io(_) | SessionError::LocalIoError(_) => true,
            SessionError::Protocol(_)
            | SessionError::IncompatibleVersion(_)
            | SessionError::WrongDatabase
            | SessionError::VerificationFailed(_)
            | SessionError::ActorExited
            | SessionError::TaskFailed => false,
        }
    }
}

// -- Conversions --

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => SessionError::Io(e),
            e => SessionError::Protocol(e.to_string()),
        }
    }
}

impl From<ActorExited> for SessionError {
    fn from(_: ActorExited) -> Self {
        SessionError::ActorExited
    }
}

impl From<ReadEntriesError> for SessionError {
    fn from(e: ReadEntriesError) -> Self {
        match e {
            ReadEntriesError::LocalIoError(e) => SessionError::LocalIoError(e),
            ReadEntriesError::ActorExited => SessionError::ActorExited,
        }
    }
}

impl From<ReceiveEntriesError> for SessionError {
    fn from(e: ReceiveEntriesError) -> Self {
        match e {
            ReceiveEntriesError::LocalIoError(e) => SessionError::LocalIoError(e),
            ReceiveEntriesError::ActorExited => SessionError::ActorExited,
        }
    }
}
