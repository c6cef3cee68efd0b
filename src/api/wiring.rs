use crate::actor::{ActorClient, DatabaseActor, Event};
use crate::api::database::{Database, SessionOptions};
use crate::api::options::DatabaseOptionsValidated;
use crate::api::settings::{NodeSettings, SettingsStore};
use crate::append_log::Entry;
use crate::commitlog::{FileLogFactory, InMemoryLogFactory, LogFactory};
use crate::ephemeral::EphemeralChannel;
use crate::keys::{ChannelKey, DatabaseKey, KeyPair};
use crate::store::MultiLogStore;
use crate::DatabaseOptions;
use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a database keeps its writers' logs.
#[derive(Clone, Debug)]
pub enum LogStorage {
    InMemory,
    /// One file per writer in this directory.
    Directory(PathBuf),
}

pub struct DatabaseConfig {
    pub info_logger: slog::Logger,
    pub settings: NodeSettings,
    pub settings_store: Arc<dyn SettingsStore>,
    pub storage: LogStorage,
    /// Pre-shared key for ephemeral messages. Without it the node only relays them.
    pub channel_key: Option<ChannelKey>,
    pub options: DatabaseOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateDatabaseError {
    #[error("This node already holds a database")]
    AlreadyExists,
    #[error("This node's settings belong to database {0:?}")]
    WrongDatabase(DatabaseKey),
    #[error("Illegal options for configuring database: {0}")]
    IllegalOptions(String),
    #[error("Log initialization failure")]
    LogInitialization(io::Error),
    #[error("Failed to persist node settings")]
    SettingsPersistence(io::Error),
}

/// Creates a new database with this node's writer as its origin. Fails if the node's settings
/// say it was initialised before.
pub async fn try_create_database(config: DatabaseConfig) -> Result<Database, CreateDatabaseError> {
    let mut settings = config.settings.clone();
    if settings.is_initialised_node {
        return Err(CreateDatabaseError::AlreadyExists);
    }

    let origin = settings.generate_writer();
    let database_key = origin.read_key();
    settings.is_initialised_node = true;
    settings.is_authorised_node = true;
    settings.hyphalink = Some(database_key);

    slog::info!(config.info_logger, "Creating database {}", database_key);
    start_database(config, settings, database_key, Some(origin)).await
}

/// Opens an existing database, usually one created by another node. A writer key is generated for
/// this node if it has none, but it can't write until an authorized writer authorizes it.
pub async fn try_open_database(
    config: DatabaseConfig,
    database_key: DatabaseKey,
) -> Result<Database, CreateDatabaseError> {
    let mut settings = checked_settings(&config, database_key)?;
    let writer = settings.generate_writer();

    slog::info!(config.info_logger, "Opening database {}", database_key);
    start_database(config, settings, database_key, Some(writer)).await
}

/// Opens an existing database for reading and syncing only. No writer key is used or generated,
/// even if the node's settings hold one, so every write fails with `NotAWriter`.
pub async fn try_open_database_read_only(
    config: DatabaseConfig,
    database_key: DatabaseKey,
) -> Result<Database, CreateDatabaseError> {
    let settings = checked_settings(&config, database_key)?;

    slog::info!(config.info_logger, "Opening database {} read-only", database_key);
    start_database(config, settings, database_key, None).await
}

fn checked_settings(config: &DatabaseConfig, database_key: DatabaseKey) -> Result<NodeSettings, CreateDatabaseError> {
    let mut settings = config.settings.clone();
    match settings.hyphalink {
        Some(existing) if existing != database_key => return Err(CreateDatabaseError::WrongDatabase(existing)),
        _ => {}
    }

    settings.is_initialised_node = true;
    settings.hyphalink = Some(database_key);
    Ok(settings)
}

async fn start_database(
    config: DatabaseConfig,
    settings: NodeSettings,
    database_key: DatabaseKey,
    writer: Option<KeyPair>,
) -> Result<Database, CreateDatabaseError> {
    let options = DatabaseOptionsValidated::try_from(config.options)
        .map_err(|e| CreateDatabaseError::IllegalOptions(e.to_string()))?;
    let logger = config.info_logger.new(slog::o!("db" => database_key.to_hex()));

    let (actor_client, actor_queue_rx) = ActorClient::new(options.actor_queue_size);
    let ephemeral = EphemeralChannel::new(database_key, config.channel_key, options.seen_set_capacity);
    let local_read_key = writer.as_ref().map(KeyPair::read_key);

    match config.storage {
        LogStorage::InMemory => {
            spawn_actor(
                logger.clone(),
                actor_queue_rx,
                database_key,
                settings,
                config.settings_store,
                ephemeral,
                writer,
                InMemoryLogFactory::new(),
            )
            .await?
        }
        LogStorage::Directory(directory) => {
            spawn_actor(
                logger.clone(),
                actor_queue_rx,
                database_key,
                settings,
                config.settings_store,
                ephemeral,
                writer,
                FileLogFactory::new(directory, true),
            )
            .await?
        }
    }

    Ok(Database::new(
        logger,
        database_key,
        local_read_key,
        actor_client,
        SessionOptions {
            max_frame_length: options.max_frame_length,
            max_suspect_entries: options.max_suspect_entries,
            sync_batch_size: options.sync_batch_size,
        },
    ))
}

async fn spawn_actor<F>(
    logger: slog::Logger,
    actor_queue_rx: mpsc::Receiver<Event>,
    database_key: DatabaseKey,
    mut settings: NodeSettings,
    settings_store: Arc<dyn SettingsStore>,
    ephemeral: EphemeralChannel,
    writer: Option<KeyPair>,
    factory: F,
) -> Result<(), CreateDatabaseError>
where
    F: LogFactory<Entry> + Send + 'static,
    F::Log: Send,
{
    let store = MultiLogStore::open(logger.clone(), database_key, writer, factory)
        .map_err(CreateDatabaseError::LogInitialization)?;

    if let Some(local) = store.local_read_key() {
        settings.is_authorised_node = store.is_authorized(&local);
    }
    settings_store
        .store(settings.clone())
        .await
        .map_err(CreateDatabaseError::SettingsPersistence)?;

    slog::info!(
        logger,
        "Database ready: {} writers, local writer authorized: {}",
        store.heads().len(),
        settings.is_authorised_node
    );

    let actor = DatabaseActor::new(logger, actor_queue_rx, store, ephemeral, settings, settings_store);
    tokio::spawn(actor.run_event_loop());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::settings::InMemorySettingsStore;

    fn config(settings: NodeSettings, store: Arc<InMemorySettingsStore>) -> DatabaseConfig {
        DatabaseConfig {
            info_logger: slog::Logger::root(slog::Discard, slog::o!()),
            settings,
            settings_store: store,
            storage: LogStorage::InMemory,
            channel_key: None,
            options: DatabaseOptions::default(),
        }
    }

    #[tokio::test]
    async fn create_persists_settings_and_refuses_twice() {
        let store = Arc::new(InMemorySettingsStore::new());
        let database = try_create_database(config(NodeSettings::default(), store.clone()))
            .await
            .unwrap();

        let settings = store.load().await.unwrap().unwrap();
        assert!(settings.is_initialised_node);
        assert!(settings.is_authorised_node);
        assert_eq!(settings.hyphalink, Some(database.database_key()));
        assert_eq!(database.local_read_key(), Some(database.database_key()));

        let result = try_create_database(config(settings, store)).await;
        assert!(matches!(result, Err(CreateDatabaseError::AlreadyExists)));
    }

    #[tokio::test]
    async fn open_generates_unauthorized_writer() {
        let database_key = crate::keys::KeyPair::generate().read_key();
        let store = Arc::new(InMemorySettingsStore::new());
        let database = try_open_database(config(NodeSettings::default(), store.clone()), database_key)
            .await
            .unwrap();

        let settings = store.load().await.unwrap().unwrap();
        assert!(!settings.is_authorised_node);
        assert_eq!(settings.read_key, database.local_read_key());
        assert_ne!(database.local_read_key(), Some(database_key));

        let other = crate::keys::KeyPair::generate().read_key();
        let result = try_open_database(config(settings, store), other).await;
        assert!(matches!(result, Err(CreateDatabaseError::WrongDatabase(_))));
    }

    #[tokio::test]
    async fn read_only_open_ignores_stored_writer() {
        let database_key = crate::keys::KeyPair::generate().read_key();
        let mut settings = NodeSettings::default();
        let stored_writer = settings.generate_writer();
        let store = Arc::new(InMemorySettingsStore::new());

        let database = try_open_database_read_only(config(settings, store.clone()), database_key)
            .await
            .unwrap();
        assert_eq!(None, database.local_read_key());

        // The stored key is kept for a later writable open.
        let settings = store.load().await.unwrap().unwrap();
        assert_eq!(Some(stored_writer.read_key()), settings.read_key);
        assert_eq!(Some(database_key), settings.hyphalink);
    }

    #[tokio::test]
    async fn rejects_illegal_options() {
        let mut config = config(NodeSettings::default(), Arc::new(InMemorySettingsStore::new()));
        config.options.max_suspect_entries = Some(0);

        let result = try_create_database(config).await;
        assert!(matches!(result, Err(CreateDatabaseError::IllegalOptions(_))));
    }
}
