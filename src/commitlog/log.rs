use std::convert::TryFrom;
use std::{fmt, io};

/// Sequence is the position of an entry in a log; i.e. a log entry's sequence number.
///
/// Sequences start from 0. The first entry of every log is written at sequence 0.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default)]
pub struct Sequence(u64);

impl Sequence {
    pub fn new(sequence: u64) -> Self {
        Sequence(sequence)
    }

    pub fn new_usize(sequence: usize) -> Self {
        Self::new(sequence as u64)
    }

    pub fn start() -> Self {
        Self::new(0)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Sequence {
        Sequence::new(self.0 + delta)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log is the storage underneath a single writer's append only log.
///
/// It knows nothing about signatures or hash chains; it only stores entries in order and hands
/// them back. There is no truncate: once appended, an entry stays.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next sequence, then returns the sequence
    /// that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Sequence, io::Error>;

    /// Read log entry at specified sequence.
    fn read(&self, sequence: Sequence) -> Result<Option<E>, io::Error>;

    /// next_sequence returns the next sequence that will be used to append an entry. This is
    /// also the number of entries in the log.
    fn next_sequence(&self) -> Sequence;
}

/// Stored bytes may be corrupt, so decoding is fallible and reported as `InvalidData`.
pub trait Entry: Clone + TryFrom<Vec<u8>, Error = io::Error> + Into<Vec<u8>> {}
