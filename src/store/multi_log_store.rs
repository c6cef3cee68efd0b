use crate::append_log::{AppendError, AppendOnlyLog, Entry, ReceiveError, ReceiveOutcome, VerifyError};
use crate::capability::{CapabilityChange, CapabilityError, CapabilitySet, CapabilityState};
use crate::commitlog::{LogFactory, Sequence};
use crate::keys::{DatabaseKey, KeyPair, ReadKey};
use crate::store::operation::{Operation, PutOperation};
use crate::store::view::PathIndex;
use crate::store::watch::{ChangedPaths, WatchCallback, WatchHandle, WatchRegistry};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;

/// MultiLogStore is the logical database: one AppendOnlyLog per known writer, the capability set
/// derived from them, and the merged path view.
///
/// Entries from writers that aren't (yet) authorized are stored and replicated like any other,
/// because an authorization record for them may still arrive. They're only excluded when a path
/// is resolved.
pub(crate) struct MultiLogStore<F>
where
    F: LogFactory<Entry>,
{
    logger: slog::Logger,
    local_writer: Option<KeyPair>,
    factory: F,
    logs: BTreeMap<ReadKey, AppendOnlyLog<F::Log>>,
    capabilities: CapabilitySet,
    paths: PathIndex,
    watchers: WatchRegistry,
    // Lamport clock: highest clock of any operation applied so far.
    clock: u64,
}

/// The result of a local write.
pub(crate) struct LocalWrite {
    pub(crate) entry: Entry,
    pub(crate) capability_changes: Vec<CapabilityChange>,
}

/// The result of applying a batch of entries received from a peer.
pub(crate) struct ReceiveBatch {
    /// Entries that were new to us, in the order they were applied.
    pub(crate) applied: Vec<Entry>,
    /// How many entries from the front of the batch we now hold, counting duplicates.
    pub(crate) accepted: usize,
    pub(crate) capability_changes: Vec<CapabilityChange>,
    /// Why processing stopped before the end of the batch, if it did.
    pub(crate) halted: Option<BatchHalt>,
}

pub(crate) enum BatchHalt {
    Rejected(VerifyError),
    LocalIoError(io::Error),
}

impl<F> MultiLogStore<F>
where
    F: LogFactory<Entry>,
{
    /// Opens the database, reopening and replaying every log the factory already holds.
    pub(crate) fn open(
        logger: slog::Logger,
        database_key: DatabaseKey,
        local_writer: Option<KeyPair>,
        factory: F,
    ) -> Result<Self, io::Error> {
        let mut store = MultiLogStore {
            logger,
            local_writer,
            factory,
            logs: BTreeMap::new(),
            capabilities: CapabilitySet::new(database_key),
            paths: PathIndex::default(),
            watchers: WatchRegistry::default(),
            clock: 0,
        };

        let mut writers = store.factory.existing_logs()?;
        writers.push(database_key);
        if let Some(local) = store.local_read_key() {
            writers.push(local);
        }

        // Nothing is watching yet.
        let mut changed = ChangedPaths::none();
        let mut capability_changes = vec![];
        for writer in writers {
            if store.logs.contains_key(&writer) {
                continue;
            }
            let entries: Vec<Entry> = store
                .log_mut(writer)?
                .iter_from(Sequence::start())
                .collect::<Result<_, _>>()?;
            for entry in entries.iter() {
                store.apply_entry(writer, entry, &mut changed, &mut capability_changes);
            }
        }

        slog::info!(
            store.logger,
            "Opened database with {} logs, {} authorized writers.",
            store.logs.len(),
            store.capabilities.authorized_writers().count()
        );

        Ok(store)
    }

    pub(crate) fn local_read_key(&self) -> Option<ReadKey> {
        self.local_writer.as_ref().map(|writer| writer.read_key())
    }

    pub(crate) fn is_authorized(&self, read_key: &ReadKey) -> bool {
        self.capabilities.is_authorized(read_key)
    }

    pub(crate) fn capability_state(&self, read_key: &ReadKey) -> Option<CapabilityState> {
        self.capabilities.state(read_key)
    }

    pub(crate) fn get(&self, path: &str) -> Option<Value> {
        let capabilities = &self.capabilities;
        self.paths
            .resolve(path, |writer| capabilities.is_authorized(writer))
            .cloned()
    }

    pub(crate) fn watch(&mut self, path: String, callback: WatchCallback) -> WatchHandle {
        let current = self.get(&path);
        self.watchers.register(path, callback, current)
    }

    pub(crate) fn put(&mut self, path: String, value: Value) -> Result<LocalWrite, WriteError> {
        let writer = self.authorized_local_writer()?;
        let writer_sequence = self.log_mut(writer)?.length();

        let operation = Operation::Put(PutOperation {
            path,
            value,
            writer_sequence,
            clock: self.clock + 1,
        });
        self.append_local(writer, operation)
    }

    pub(crate) fn authorize(&mut self, subject: ReadKey) -> Result<LocalWrite, SetCapabilityError> {
        self.set_capability(subject, CapabilityState::Authorized)
    }

    pub(crate) fn revoke(&mut self, subject: ReadKey) -> Result<LocalWrite, SetCapabilityError> {
        self.set_capability(subject, CapabilityState::Revoked)
    }

    pub(crate) fn mark_pending(&mut self, subject: ReadKey) -> Result<LocalWrite, SetCapabilityError> {
        self.set_capability(subject, CapabilityState::Pending)
    }

    fn set_capability(&mut self, subject: ReadKey, state: CapabilityState) -> Result<LocalWrite, SetCapabilityError> {
        let writer = self.authorized_local_writer()?;
        let record = self
            .capabilities
            .new_record(subject, state, writer, self.clock + 1)?;

        let write = self.append_local(writer, Operation::Capability(record))?;
        slog::info!(
            self.logger,
            "Set {:?} to {:?} (entry {}).",
            subject,
            state,
            write.entry.sequence()
        );
        Ok(write)
    }

    fn authorized_local_writer(&self) -> Result<ReadKey, WriteError> {
        let writer = self.local_read_key().ok_or(WriteError::NotAWriter)?;
        if !self.capabilities.is_authorized(&writer) {
            return Err(WriteError::Unauthorized(writer));
        }
        Ok(writer)
    }

    fn append_local(&mut self, writer: ReadKey, operation: Operation) -> Result<LocalWrite, WriteError> {
        let payload = operation.encode().map_err(WriteError::Encoding)?;
        let entry = self.log_mut(writer)?.append(payload)?;

        let mut changed = ChangedPaths::none();
        let mut capability_changes = vec![];
        self.apply_entry(writer, &entry, &mut changed, &mut capability_changes);
        self.dispatch_watchers(&changed);

        Ok(LocalWrite {
            entry,
            capability_changes,
        })
    }

    /// Verifies and applies entries a peer sent for `writer`'s log, in order. Processing stops at
    /// the first entry that can't be applied; everything before it stays applied. Watchers are
    /// notified once for the whole batch.
    pub(crate) fn receive_entries(&mut self, writer: ReadKey, entries: Vec<Entry>) -> ReceiveBatch {
        let mut applied = vec![];
        let mut accepted = 0;
        let mut changed = ChangedPaths::none();
        let mut capability_changes = vec![];
        let mut halted = None;

        for entry in entries {
            let outcome = match self.log_mut(writer) {
                Ok(log) => log.receive(entry.clone()),
                Err(e) => Err(ReceiveError::LocalIoError(e)),
            };

            match outcome {
                Ok(ReceiveOutcome::Appended) => {
                    self.apply_entry(writer, &entry, &mut changed, &mut capability_changes);
                    applied.push(entry);
                    accepted += 1;
                }
                Ok(ReceiveOutcome::Duplicate) => accepted += 1,
                Err(ReceiveError::Verification(e)) => {
                    slog::warn!(self.logger, "Rejected entry for {:?}: {}", writer, e);
                    halted = Some(BatchHalt::Rejected(e));
                    break;
                }
                Err(ReceiveError::LocalIoError(e)) => {
                    slog::error!(self.logger, "Failed to store entry for {:?}: {:?}", writer, e);
                    halted = Some(BatchHalt::LocalIoError(e));
                    break;
                }
            }
        }

        self.dispatch_watchers(&changed);

        ReceiveBatch {
            applied,
            accepted,
            capability_changes,
            halted,
        }
    }

    /// Length of every log we hold.
    pub(crate) fn heads(&self) -> Vec<(ReadKey, u64)> {
        self.logs
            .iter()
            .map(|(read_key, log)| (*read_key, log.length()))
            .collect()
    }

    /// Up to `limit` entries of `writer`'s log, starting at `from`.
    pub(crate) fn read_entries(&self, writer: &ReadKey, from: Sequence, limit: usize) -> Result<Vec<Entry>, io::Error> {
        match self.logs.get(writer) {
            Some(log) => log.iter_from(from).take(limit).collect(),
            None => Ok(vec![]),
        }
    }

    fn log_mut(&mut self, writer: ReadKey) -> Result<&mut AppendOnlyLog<F::Log>, io::Error> {
        if !self.logs.contains_key(&writer) {
            let write_key = self
                .local_writer
                .as_ref()
                .filter(|local| local.read_key() == writer)
                .map(|local| local.write_key().clone());
            let storage = self.factory.try_create_log(&writer)?;
            let log = AppendOnlyLog::open(writer, write_key, storage)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            slog::debug!(self.logger, "Tracking log {:?}", writer);
            self.logs.insert(writer, log);
        }

        self.logs
            .get_mut(&writer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log vanished"))
    }

    /// Folds one verified entry into the derived state. An entry whose payload we can't make
    /// sense of is kept in its log (it is validly signed) but has no effect.
    fn apply_entry(
        &mut self,
        writer: ReadKey,
        entry: &Entry,
        changed: &mut ChangedPaths,
        capability_changes: &mut Vec<CapabilityChange>,
    ) {
        let operation = match Operation::decode(entry.payload()) {
            Ok(operation) => operation,
            Err(e) => {
                slog::warn!(
                    self.logger,
                    "Ignoring undecodable entry {} of {:?}: {}",
                    entry.sequence(),
                    writer,
                    e
                );
                return;
            }
        };
        self.clock = self.clock.max(operation.clock());

        match operation {
            Operation::Put(put) => {
                if put.writer_sequence != entry.sequence().as_u64() {
                    slog::warn!(
                        self.logger,
                        "Ignoring put at entry {} of {:?} claiming sequence {}",
                        entry.sequence(),
                        writer,
                        put.writer_sequence
                    );
                    return;
                }
                if self
                    .paths
                    .record(writer, &put.path, entry.sequence(), put.clock, put.value)
                {
                    changed.insert(put.path);
                }
            }
            Operation::Capability(record) => {
                match self.capabilities.apply_record(writer, entry.sequence(), record) {
                    Ok(changes) => {
                        if !changes.is_empty() {
                            changed.set_all();
                            capability_changes.extend(changes);
                        }
                    }
                    Err(e) => slog::warn!(
                        self.logger,
                        "Ignoring capability record at entry {} of {:?}: {}",
                        entry.sequence(),
                        writer,
                        e
                    ),
                }
            }
        }
    }

    fn dispatch_watchers(&mut self, changed: &ChangedPaths) {
        let paths = &self.paths;
        let capabilities = &self.capabilities;
        self.watchers.dispatch(changed, |path| {
            paths
                .resolve(path, |writer| capabilities.is_authorized(writer))
                .cloned()
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WriteError {
    #[error("This node holds no write key")]
    NotAWriter,
    #[error("{0:?} is not currently authorized")]
    Unauthorized(ReadKey),
    #[error("Failed to encode operation")]
    Encoding(serde_json::Error),
    #[error("Failed to persist log")]
    LocalIoError(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SetCapabilityError {
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("The origin writer's authorization can't be changed")]
    OriginIsPermanent,
}

// -- Conversions --

impl From<AppendError> for WriteError {
    fn from(e: AppendError) -> Self {
        match e {
            AppendError::NotAWriter => WriteError::NotAWriter,
            AppendError::LocalIoError(e) => WriteError::LocalIoError(e),
        }
    }
}

impl From<CapabilityError> for SetCapabilityError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Unauthorized(read_key) => SetCapabilityError::Write(WriteError::Unauthorized(read_key)),
            CapabilityError::OriginIsPermanent => SetCapabilityError::OriginIsPermanent,
            CapabilityError::ForgedAuthorizer { writer, .. } => {
                SetCapabilityError::Write(WriteError::Unauthorized(writer))
            }
        }
    }
}
