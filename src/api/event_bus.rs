use crate::append_log::Entry;
use crate::capability::CapabilityChange;
use crate::commitlog::Sequence;
use crate::ephemeral::{BadMessage, EphemeralMessage};
use crate::keys::ReadKey;
use crate::replication::SessionId;
use tokio::sync::mpsc;

/// DatabaseObserver is told about things that happen to a database. Methods are called from the
/// database's event loop, so they must return quickly and must not call back into the database.
pub trait DatabaseObserver: Send + 'static {
    /// A replicated entry was verified and applied.
    fn on_entry_received(&mut self, _writer: &ReadKey, _entry: &Entry) {}

    /// A writer's derived authorization changed.
    fn on_capability_changed(&mut self, _change: &CapabilityChange) {}

    /// An ephemeral message was decrypted for the first time.
    fn on_message(&mut self, _message: &EphemeralMessage) {}

    /// An ephemeral frame from `session` was dropped.
    fn on_bad_message(&mut self, _session: SessionId, _reason: &BadMessage) {}

    /// `error` is `None` if the session ended cleanly.
    fn on_session_closed(&mut self, _session: SessionId, _error: Option<&str>) {}
}

/// An event that happened, as observed by the local database.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    EntryReceived(EntryReceivedEventData),
    CapabilityChanged(CapabilityChange),
    Message(EphemeralMessage),
    BadMessage(BadMessageEventData),
    SessionClosed(SessionClosedEventData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryReceivedEventData {
    pub writer: ReadKey,
    pub sequence: Sequence,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BadMessageEventData {
    pub session: SessionId,
    pub reason: BadMessage,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionClosedEventData {
    pub session: SessionId,
    pub error: Option<String>,
}

pub struct EventListener {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventListener {
    pub(super) fn new(logger: slog::Logger) -> (Self, ChannelObserver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            EventListener { receiver },
            ChannelObserver {
                logger,
                sender,
                closed: false,
            },
        )
    }

    /// `next_event()` returns the next event this database observes, in order. Returns `None` once
    /// the database has shut down.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

/// Forwards observer callbacks to an `EventListener`.
pub(super) struct ChannelObserver {
    logger: slog::Logger,
    sender: mpsc::UnboundedSender<Event>,
    closed: bool,
}

impl ChannelObserver {
    fn publish(&mut self, event: Event) {
        if self.closed {
            return;
        }
        if self.sender.send(event).is_err() {
            slog::warn!(self.logger, "Event listener was dropped, no longer publishing events.");
            self.closed = true;
        }
    }
}

impl DatabaseObserver for ChannelObserver {
    fn on_entry_received(&mut self, writer: &ReadKey, entry: &Entry) {
        self.publish(Event::EntryReceived(EntryReceivedEventData {
            writer: *writer,
            sequence: entry.sequence(),
        }));
    }

    fn on_capability_changed(&mut self, change: &CapabilityChange) {
        self.publish(Event::CapabilityChanged(change.clone()));
    }

    fn on_message(&mut self, message: &EphemeralMessage) {
        self.publish(Event::Message(message.clone()));
    }

    fn on_bad_message(&mut self, session: SessionId, reason: &BadMessage) {
        self.publish(Event::BadMessage(BadMessageEventData {
            session,
            reason: reason.clone(),
        }));
    }

    fn on_session_closed(&mut self, session: SessionId, error: Option<&str>) {
        self.publish(Event::SessionClosed(SessionClosedEventData {
            session,
            error: error.map(String::from),
        }));
    }
}
