//! Single-writer, hash-chained, signed logs. The store composes one of these per writer.
mod entry;
mod log;

pub use entry::Entry;
pub use entry::EntryHash;
pub use log::VerifyError;

pub(crate) use log::AppendError;
pub(crate) use log::AppendOnlyLog;
pub(crate) use log::ReceiveError;
pub(crate) use log::ReceiveOutcome;
