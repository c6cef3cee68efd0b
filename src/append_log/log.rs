use crate::append_log::Entry;
use crate::commitlog;
use crate::commitlog::Sequence;
use crate::keys::{ReadKey, WriteKey};
use bytes::Bytes;
use std::io;

/// AppendOnlyLog is a single writer's hash-chained, signed log, and the unit of replication.
///
/// Every entry after the first carries the hash of its predecessor, and every entry is signed by
/// the log's write key. A log opened with only a read key can't `append`; its entries arrive
/// through `receive` and are verified one by one.
pub(crate) struct AppendOnlyLog<L>
where
    L: commitlog::Log<Entry>,
{
    read_key: ReadKey,
    write_key: Option<WriteKey>,
    log: L,
    // Copy of the latest entry. It must be updated atomically with the underlying log.
    tail: Option<Entry>,
}

impl<L> AppendOnlyLog<L>
where
    L: commitlog::Log<Entry>,
{
    /// Wraps existing storage. Whatever is already stored is re-verified from the first entry, as
    /// nothing from a previous run is trusted.
    pub(crate) fn open(read_key: ReadKey, write_key: Option<WriteKey>, log: L) -> Result<Self, OpenLogError> {
        if let Some(write_key) = write_key.as_ref() {
            if write_key.read_key() != read_key {
                return Err(OpenLogError::MismatchedWriteKey);
            }
        }

        let mut this = AppendOnlyLog {
            read_key,
            write_key,
            log,
            tail: None,
        };

        let mut previous: Option<Entry> = None;
        for entry in this.iter_from(Sequence::start()) {
            let entry = entry?;
            this.verify(&entry, previous.as_ref())
                .map_err(|e| OpenLogError::Corrupt(entry.sequence(), e))?;
            previous = Some(entry);
        }
        this.tail = previous;

        Ok(this)
    }

    /// Number of entries, which is also the sequence the next entry will get.
    pub(crate) fn length(&self) -> u64 {
        self.log.next_sequence().as_u64()
    }

    pub(crate) fn append(&mut self, payload: Bytes) -> Result<Entry, AppendError> {
        let write_key = self.write_key.as_ref().ok_or(AppendError::NotAWriter)?;

        let sequence = self.log.next_sequence();
        let previous_hash = self.tail.as_ref().map(|tail| tail.hash());
        let entry = Entry::sign(write_key, sequence, previous_hash, payload);

        self.append_verified(entry.clone())
            .map_err(AppendError::LocalIoError)?;

        Ok(entry)
    }

    /// Checks `entry`'s signature against this log's read key, and that it links onto
    /// `previous` (which must be `None` for the first entry).
    pub(crate) fn verify(&self, entry: &Entry, previous: Option<&Entry>) -> Result<(), VerifyError> {
        match previous {
            None => {
                if entry.sequence() != Sequence::start() {
                    return Err(VerifyError::SequenceGap {
                        expected: Sequence::start(),
                        received: entry.sequence(),
                    });
                }
                if entry.previous_hash().is_some() {
                    return Err(VerifyError::HashChainMismatch(entry.sequence()));
                }
            }
            Some(previous) => {
                let expected = previous.sequence().plus(1);
                if entry.sequence() != expected {
                    return Err(VerifyError::SequenceGap {
                        expected,
                        received: entry.sequence(),
                    });
                }
                if entry.previous_hash() != Some(previous.hash()) {
                    return Err(VerifyError::HashChainMismatch(entry.sequence()));
                }
            }
        }

        if !entry.has_valid_signature(&self.read_key) {
            return Err(VerifyError::BadSignature(entry.sequence()));
        }

        Ok(())
    }

    /// Verifies and appends an entry that some peer produced.
    ///
    /// An exact copy of an entry we already hold is accepted as a no-op, so replaying a sync
    /// exchange is harmless. A different entry at a sequence we already hold means the writer
    /// forked its log, and is rejected.
    pub(crate) fn receive(&mut self, entry: Entry) -> Result<ReceiveOutcome, ReceiveError> {
        let next_sequence = self.log.next_sequence();

        if entry.sequence() < next_sequence {
            let existing = self.get(entry.sequence())?;
            return match existing {
                Some(existing) if existing == entry => Ok(ReceiveOutcome::Duplicate),
                _ => Err(ReceiveError::Verification(VerifyError::ConflictingEntry(entry.sequence()))),
            };
        }

        self.verify(&entry, self.tail.as_ref())?;
        self.append_verified(entry)?;

        Ok(ReceiveOutcome::Appended)
    }

    pub(crate) fn get(&self, sequence: Sequence) -> Result<Option<Entry>, io::Error> {
        self.log.read(sequence)
    }

    #[cfg(test)]
    pub(crate) fn tail(&self) -> Option<&Entry> {
        self.tail.as_ref()
    }

    /// Lazily yields entries from `from` to the current end of the log. Restartable: a session
    /// that reconnects simply asks again from its own cursor.
    pub(crate) fn iter_from(&self, from: Sequence) -> EntryIter<'_, L> {
        EntryIter {
            log: &self.log,
            next: from,
        }
    }

    fn append_verified(&mut self, entry: Entry) -> Result<(), io::Error> {
        let appended_sequence = self.log.append(entry.clone())?;
        debug_assert_eq!(appended_sequence, entry.sequence());
        // Only update state after log action completes.
        self.tail.replace(entry);

        Ok(())
    }
}

pub(crate) struct EntryIter<'a, L>
where
    L: commitlog::Log<Entry>,
{
    log: &'a L,
    next: Sequence,
}

impl<'a, L> Iterator for EntryIter<'a, L>
where
    L: commitlog::Log<Entry>,
{
    type Item = Result<Entry, io::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.log.read(self.next) {
            Ok(Some(entry)) => {
                self.next = self.next.plus(1);
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReceiveOutcome {
    Appended,
    Duplicate,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Entry {0} has an invalid signature")]
    BadSignature(Sequence),
    #[error("Entry {0} does not link to the previous entry's hash")]
    HashChainMismatch(Sequence),
    #[error("Expected entry {expected}, received {received}")]
    SequenceGap { expected: Sequence, received: Sequence },
    #[error("Entry {0} conflicts with the entry we already hold at that sequence")]
    ConflictingEntry(Sequence),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AppendError {
    #[error("This log has no write key")]
    NotAWriter,
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReceiveError {
    #[error("Entry failed verification: {0}")]
    Verification(#[from] VerifyError),
    #[error("Failed to persist log")]
    LocalIoError(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum OpenLogError {
    #[error("Write key does not belong to the read key")]
    MismatchedWriteKey,
    #[error("Stored entry {0} failed verification: {1}")]
    Corrupt(Sequence, VerifyError),
    #[error("Failed to read log")]
    LocalIoError(#[from] io::Error),
}
