//! Syncs a database's logs with one peer over any byte stream.
mod codec;
mod proto;
mod session;
mod state;

pub use session::SessionError;
pub use session::SessionHandle;
pub use session::SessionId;
pub use state::SessionState;

pub(crate) use session::start;
pub(crate) use session::SessionCommand;
pub(crate) use session::SessionConfig;
