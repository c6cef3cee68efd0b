use crate::commitlog::storage::{FileLog, StorageConfig};
use crate::commitlog::{Entry, InMemoryLog, Log};
use crate::keys::ReadKey;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;

const LOG_FILE_EXTENSION: &str = "log";

/// LogFactory creates the storage for one writer's log. A database learns about new writers at
/// runtime (through replication), so logs can't all be created up front.
pub trait LogFactory<E: Entry> {
    type Log: Log<E>;

    fn try_create_log(&self, read_key: &ReadKey) -> Result<Self::Log, io::Error>;

    /// Logs that already exist in this factory's storage, so they can be reopened on start.
    fn existing_logs(&self) -> Result<Vec<ReadKey>, io::Error>;
}

// -- InMemoryLogFactory --

pub struct InMemoryLogFactory<E: Entry> {
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLogFactory<E> {
    pub fn new() -> Self {
        InMemoryLogFactory { _pd: PhantomData }
    }
}

impl<E: Entry> LogFactory<E> for InMemoryLogFactory<E> {
    type Log = InMemoryLog<E>;

    fn try_create_log(&self, _: &ReadKey) -> Result<InMemoryLog<E>, io::Error> {
        Ok(InMemoryLog::create())
    }

    fn existing_logs(&self) -> Result<Vec<ReadKey>, io::Error> {
        Ok(vec![])
    }
}

// -- FileLogFactory --

/// One file per writer, named by the writer's hex read key.
pub struct FileLogFactory<E: Entry> {
    directory: PathBuf,
    sync_on_append: bool,
    _pd: PhantomData<E>,
}

impl<E: Entry> FileLogFactory<E> {
    pub fn new(directory: PathBuf, sync_on_append: bool) -> Self {
        FileLogFactory {
            directory,
            sync_on_append,
            _pd: PhantomData,
        }
    }

    fn log_path(&self, read_key: &ReadKey) -> PathBuf {
        self.directory
            .join(read_key.to_hex())
            .with_extension(LOG_FILE_EXTENSION)
    }
}

impl<E: Entry> LogFactory<E> for FileLogFactory<E> {
    type Log = FileLog<E>;

    fn try_create_log(&self, read_key: &ReadKey) -> Result<FileLog<E>, io::Error> {
        FileLog::open(StorageConfig {
            path: self.log_path(read_key),
            sync_on_append: self.sync_on_append,
        })
    }

    fn existing_logs(&self) -> Result<Vec<ReadKey>, io::Error> {
        let dir = match std::fs::read_dir(&self.directory) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let mut read_keys = Vec::new();
        for dir_entry in dir {
            let path = dir_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_FILE_EXTENSION) {
                continue;
            }
            // Files we didn't name are not ours; skip them rather than fail the whole open.
            if let Some(read_key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<ReadKey>().ok())
            {
                read_keys.push(read_key);
            }
        }

        read_keys.sort();
        Ok(read_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::in_memory::tests::TestEntry;
    use crate::keys::KeyPair;

    #[test]
    fn file_factory_lists_created_logs() {
        let dir = tempfile::tempdir().unwrap();
        let factory: FileLogFactory<TestEntry> = FileLogFactory::new(dir.path().join("logs"), false);
        assert!(factory.existing_logs().unwrap().is_empty());

        let mut expected = vec![KeyPair::generate().read_key(), KeyPair::generate().read_key()];
        for read_key in expected.iter() {
            factory.try_create_log(read_key).unwrap();
        }
        std::fs::write(dir.path().join("logs").join("README.txt"), b"not a log").unwrap();

        expected.sort();
        assert_eq!(expected, factory.existing_logs().unwrap());
    }
}
