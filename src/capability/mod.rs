//! Which writers are allowed to contribute to a database.
mod record;
mod set;

pub use record::CapabilityChange;
pub use record::CapabilityRecord;
pub use record::CapabilityState;
pub use record::Grant;

pub(crate) use set::CapabilityError;
pub(crate) use set::CapabilitySet;
