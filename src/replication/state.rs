use tokio::sync::watch;

/// Where a replication session is in its lifecycle. States only ever move forward, in declaration
/// order, and `Closed` is terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SessionState {
    /// Exchanging protocol version, database handle and extensions.
    Handshaking,
    /// Exchanging log heads and streaming missing entries.
    Syncing,
    /// Fully synced. New entries and ephemeral messages are pushed as they happen.
    Live,
    Closed,
}

pub(super) fn new(initial_state: SessionState) -> (SessionStateNotifier, SessionStateListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (SessionStateNotifier { snd }, SessionStateListener { rcv })
}

pub(super) struct SessionStateNotifier {
    snd: watch::Sender<SessionState>,
}

impl SessionStateNotifier {
    pub(super) fn notify_new_state(&self, new_state: SessionState) {
        let _ = self.snd.send(new_state);
    }

    pub(super) fn current(&self) -> SessionState {
        *self.snd.borrow()
    }
}

#[derive(Clone)]
pub(super) struct SessionStateListener {
    rcv: watch::Receiver<SessionState>,
}

impl SessionStateListener {
    pub(super) fn current(&self) -> SessionState {
        *self.rcv.borrow()
    }

    /// Waits until the session is at or past `target`, and returns the state it is in then.
    pub(super) async fn reached(&mut self, target: SessionState) -> SessionState {
        loop {
            let current = self.current();
            if current >= target {
                return current;
            }
            if self.rcv.changed().await.is_err() {
                // Notifier is gone, so the session task has ended.
                return SessionState::Closed;
            }
        }
    }
}
