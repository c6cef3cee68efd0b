use crate::keys::{DatabaseKey, KeyPair, ReadKey, WriteKey};
use async_trait::async_trait;
use std::io;
use tokio::sync::Mutex;

/// NodeSettings is what a node remembers about itself between runs.
#[derive(Clone, Debug, Default)]
pub struct NodeSettings {
    /// A database was created or opened on this node already.
    pub is_initialised_node: bool,
    /// Last known authorization of the local writer. Informational only: authorization is always
    /// recomputed from the replicated capability records.
    pub is_authorised_node: bool,
    /// The database this node belongs to.
    pub hyphalink: Option<DatabaseKey>,
    pub read_key: Option<ReadKey>,
    pub write_key: Option<WriteKey>,
}

impl NodeSettings {
    /// Returns the local writer identity, generating (and recording) one if the node has none yet.
    pub fn generate_writer(&mut self) -> KeyPair {
        if let Some(writer) = self.local_writer() {
            return writer;
        }

        let writer = KeyPair::generate();
        self.read_key = Some(writer.read_key());
        self.write_key = Some(writer.write_key().clone());
        writer
    }

    /// The stored key pair, if there is one and both halves agree.
    pub fn local_writer(&self) -> Option<KeyPair> {
        let writer = KeyPair::from_write_key(self.write_key.clone()?);
        match self.read_key {
            Some(read_key) if read_key != writer.read_key() => None,
            _ => Some(writer),
        }
    }
}

/// SettingsStore persists `NodeSettings`. The storage format is up to the implementation.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Option<NodeSettings>, io::Error>;

    async fn store(&self, settings: NodeSettings) -> Result<(), io::Error>;
}

/// Keeps settings in memory only. Mostly useful for tests.
#[derive(Default)]
pub struct InMemorySettingsStore {
    settings: Mutex<Option<NodeSettings>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load(&self) -> Result<Option<NodeSettings>, io::Error> {
        Ok(self.settings.lock().await.clone())
    }

    async fn store(&self, settings: NodeSettings) -> Result<(), io::Error> {
        *self.settings.lock().await = Some(settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_writer_is_stable() {
        let mut settings = NodeSettings::default();
        let first = settings.generate_writer();
        let second = settings.generate_writer();

        assert_eq!(first.read_key(), second.read_key());
        assert_eq!(settings.read_key, Some(first.read_key()));
    }

    #[test]
    fn mismatched_halves_are_not_a_writer() {
        let mut settings = NodeSettings::default();
        settings.generate_writer();
        settings.read_key = Some(KeyPair::generate().read_key());

        assert!(settings.local_writer().is_none());
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemorySettingsStore::new();
        assert!(store.load().await.unwrap().is_none());

        let mut settings = NodeSettings::default();
        settings.is_initialised_node = true;
        store.store(settings).await.unwrap();

        assert!(store.load().await.unwrap().unwrap().is_initialised_node);
    }
}
