use crate::commitlog::{Entry, Log, Sequence};
use std::io;
use std::marker::PhantomData;

/// InMemoryLog keeps the log for the lifetime of the process only. Used by browser-like and test
/// nodes that replicate everything again on the next start.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the same conversion logic as the file log.
    log: Vec<Vec<u8>>,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        InMemoryLog {
            log: vec![],
            _pd: PhantomData::default(),
        }
    }

    fn vec_index(sequence: Sequence) -> usize {
        sequence.as_u64() as usize
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Sequence, io::Error> {
        let sequence = self.next_sequence();
        self.log.push(entry.into());

        Ok(sequence)
    }

    fn read(&self, sequence: Sequence) -> Result<Option<E>, io::Error> {
        match self.log.get(Self::vec_index(sequence)) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn next_sequence(&self) -> Sequence {
        Sequence::new_usize(self.log.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub(crate) Vec<u8>);

    impl Entry for TestEntry {}

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            if bytes.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "empty entry"));
            }
            Ok(TestEntry(bytes))
        }
    }

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    #[test]
    fn append_then_read() {
        let mut log = InMemoryLog::create();
        assert_eq!(Sequence::start(), log.next_sequence());

        assert_eq!(Sequence::new(0), log.append(TestEntry(vec![1])).unwrap());
        assert_eq!(Sequence::new(1), log.append(TestEntry(vec![2, 2])).unwrap());

        assert_eq!(Some(TestEntry(vec![2, 2])), log.read(Sequence::new(1)).unwrap());
        assert_eq!(None, log.read(Sequence::new(2)).unwrap());
        assert_eq!(Sequence::new(2), log.next_sequence());
    }
}
