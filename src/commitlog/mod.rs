mod factory;
mod in_memory;
mod log;
mod storage;

pub use factory::FileLogFactory;
pub use factory::InMemoryLogFactory;
pub use factory::LogFactory;
pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Log;
pub use log::Sequence;
