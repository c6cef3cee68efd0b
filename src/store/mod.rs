//! The logical database built on top of many writers' logs.
mod multi_log_store;
mod operation;
mod view;
mod watch;

pub(crate) use multi_log_store::BatchHalt;
pub(crate) use multi_log_store::LocalWrite;
pub(crate) use multi_log_store::MultiLogStore;
pub(crate) use multi_log_store::ReceiveBatch;
pub(crate) use multi_log_store::SetCapabilityError;
pub(crate) use multi_log_store::WriteError;

pub use watch::WatchCallback;
pub use watch::WatchHandle;
