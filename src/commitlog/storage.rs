use crate::commitlog::{Entry, Log, Sequence};
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::PathBuf;

const RECORD_HEADER_LEN: usize = 8;

// Loosely based on https://thehoard.blog/how-kafkas-storage-internals-work-3a29b02e026
//
// Each record in the file:
//
// ```text
// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 ...             |
// +---+---+---+---+---+---+---+---+-----...----------+
// |   crc (LE)    | data size (LE)|  data (variable) |
// +---------------+---------------+-----...----------+
// ```
//
// * `crc` - crc32 of `data`
// * `data size` - length of `data` in bytes
//
// A record that is cut short or fails its crc can only be the tail of a crashed append. It is
// truncated away on open; everything before it is kept.
pub struct FileLog<E: Entry> {
    file: File,
    // Every record is also held in memory. Reads never touch disk.
    records: Vec<Vec<u8>>,
    // Byte length of the intact records. Anything past it is left from a failed append.
    valid_len: u64,
    torn: bool,
    sync_on_append: bool,
    _pd: PhantomData<E>,
}

// Generic config for initializing a disk-based log, independent of the entry data model.
pub struct StorageConfig {
    pub path: PathBuf,
    pub sync_on_append: bool,
}

impl<E: Entry> FileLog<E> {
    pub fn open(config: StorageConfig) -> Result<Self, io::Error> {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let (records, valid_len) = Self::parse_records(&buffer);
        if valid_len < buffer.len() {
            file.set_len(valid_len as u64)?;
        }
        file.seek(SeekFrom::Start(valid_len as u64))?;

        Ok(FileLog {
            file,
            records,
            valid_len: valid_len as u64,
            torn: false,
            sync_on_append: config.sync_on_append,
            _pd: PhantomData::default(),
        })
    }

    /// Returns every intact record, and the byte length of the intact prefix.
    fn parse_records(buffer: &[u8]) -> (Vec<Vec<u8>>, usize) {
        let mut records = Vec::new();
        let mut offset = 0;

        while buffer.len() - offset >= RECORD_HEADER_LEN {
            let crc = u32::from_le_bytes([
                buffer[offset],
                buffer[offset + 1],
                buffer[offset + 2],
                buffer[offset + 3],
            ]);
            let data_len = u32::from_le_bytes([
                buffer[offset + 4],
                buffer[offset + 5],
                buffer[offset + 6],
                buffer[offset + 7],
            ]) as usize;

            let data_start = offset + RECORD_HEADER_LEN;
            if buffer.len() - data_start < data_len {
                break;
            }
            let data = &buffer[data_start..data_start + data_len];
            if crc32fast::hash(data) != crc {
                break;
            }

            records.push(data.to_vec());
            offset = data_start + data_len;
        }

        (records, offset)
    }

    fn write_record(&mut self, record: &[u8]) -> Result<(), io::Error> {
        self.file.write_all(record)?;
        if self.sync_on_append {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cuts off whatever a failed append left behind, so the next record follows the last
    /// intact one.
    fn repair_torn_tail(&mut self) -> Result<(), io::Error> {
        if self.torn {
            self.file.set_len(self.valid_len)?;
            self.file.seek(SeekFrom::Start(self.valid_len))?;
            self.torn = false;
        }
        Ok(())
    }
}

impl<E: Entry> Log<E> for FileLog<E> {
    fn append(&mut self, entry: E) -> Result<Sequence, io::Error> {
        let data: Vec<u8> = entry.into();
        let data_len = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry too large for file log"))?;

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
        record.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
        record.extend_from_slice(&data_len.to_le_bytes());
        record.extend_from_slice(&data);

        self.repair_torn_tail()?;
        if let Err(e) = self.write_record(&record) {
            self.torn = true;
            // Retried on the next append if it fails now.
            let _ = self.repair_torn_tail();
            return Err(e);
        }

        // Only update in-memory state after the write completes.
        self.valid_len += record.len() as u64;
        let sequence = self.next_sequence();
        self.records.push(data);
        Ok(sequence)
    }

    fn read(&self, sequence: Sequence) -> Result<Option<E>, io::Error> {
        match self.records.get(sequence.as_u64() as usize) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn next_sequence(&self) -> Sequence {
        Sequence::new_usize(self.records.len())
    }
}
