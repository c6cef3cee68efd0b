//! This mod is meant to hold most of the code for the library's client-facing API.
mod database;
mod discovery;
mod event_bus;
mod options;
mod settings;
mod wiring;

pub use database::AuthorizeError;
pub use database::BroadcastError;
pub use database::Database;
pub use database::GetError;
pub use database::PutError;
pub use discovery::discover_database;
pub use discovery::DiscoveryError;
pub use discovery::DiscoveryRecord;
pub use discovery::DiscoveryResolver;
pub use discovery::HYPHALINK_WELL_KNOWN_PATH;
pub use event_bus::BadMessageEventData;
pub use event_bus::DatabaseObserver;
pub use event_bus::EntryReceivedEventData;
pub use event_bus::Event;
pub use event_bus::EventListener;
pub use event_bus::SessionClosedEventData;
pub use options::DatabaseOptions;
pub use settings::InMemorySettingsStore;
pub use settings::NodeSettings;
pub use settings::SettingsStore;
pub use wiring::try_create_database;
pub use wiring::try_open_database;
pub use wiring::try_open_database_read_only;
pub use wiring::CreateDatabaseError;
pub use wiring::DatabaseConfig;
pub use wiring::LogStorage;
