mod actor;
mod api;
mod append_log;
mod capability;
mod commitlog;
mod ephemeral;
mod keys;
mod replication;
mod store;

pub use actor::ActorExited;
pub use api::discover_database;
pub use api::try_create_database;
pub use api::try_open_database;
pub use api::try_open_database_read_only;
pub use api::AuthorizeError;
pub use api::BadMessageEventData;
pub use api::BroadcastError;
pub use api::CreateDatabaseError;
pub use api::Database;
pub use api::DatabaseConfig;
pub use api::DatabaseObserver;
pub use api::DatabaseOptions;
pub use api::DiscoveryError;
pub use api::DiscoveryRecord;
pub use api::DiscoveryResolver;
pub use api::EntryReceivedEventData;
pub use api::Event;
pub use api::EventListener;
pub use api::GetError;
pub use api::InMemorySettingsStore;
pub use api::LogStorage;
pub use api::NodeSettings;
pub use api::PutError;
pub use api::SessionClosedEventData;
pub use api::SettingsStore;
pub use api::HYPHALINK_WELL_KNOWN_PATH;
pub use append_log::Entry;
pub use append_log::EntryHash;
pub use append_log::VerifyError;
pub use capability::CapabilityChange;
pub use capability::CapabilityState;
pub use commitlog::Sequence;
pub use ephemeral::BadMessage;
pub use ephemeral::EphemeralMessage;
pub use ephemeral::MessageId;
pub use keys::ChannelKey;
pub use keys::DatabaseKey;
pub use keys::DiscoveryHandle;
pub use keys::KeyDerivation;
pub use keys::KeyError;
pub use keys::KeyMaterial;
pub use keys::KeyPair;
pub use keys::ReadKey;
pub use keys::WriteKey;
pub use replication::SessionError;
pub use replication::SessionHandle;
pub use replication::SessionId;
pub use replication::SessionState;
pub use store::WatchHandle;

// `crate::{root_mod}` holds no code, only `mod` and `pub use` statements. No `mod` is `pub`
// anywhere; public types are exported through individual `use` statements.
