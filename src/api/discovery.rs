use crate::keys::{DatabaseKey, KeyError};
use async_trait::async_trait;
use std::io;

/// Where a domain publishes the hyphalink of the database it hosts.
pub const HYPHALINK_WELL_KNOWN_PATH: &str = "/.well-known/hyphalink";

/// DiscoveryRecord is the published form of a database key: its hex read key as plain text.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DiscoveryRecord {
    database_key: DatabaseKey,
}

impl DiscoveryRecord {
    pub fn new(database_key: DatabaseKey) -> Self {
        DiscoveryRecord { database_key }
    }

    pub fn parse(text: &str) -> Result<Self, KeyError> {
        Ok(DiscoveryRecord {
            database_key: text.trim().parse()?,
        })
    }

    pub fn database_key(&self) -> DatabaseKey {
        self.database_key
    }

    /// The text to serve at `HYPHALINK_WELL_KNOWN_PATH`.
    pub fn to_record_string(&self) -> String {
        self.database_key.to_hex()
    }
}

/// DiscoveryResolver fetches a plaintext resource by domain and path. Implemented outside this
/// crate (usually over HTTPS).
#[async_trait]
pub trait DiscoveryResolver: Send + Sync {
    /// `Ok(None)` when the domain doesn't serve the path.
    async fn fetch(&self, domain: &str, path: &str) -> Result<Option<String>, io::Error>;
}

/// Looks up the database published by `domain`. `Ok(None)` means it has no long-lived replica
/// to discover yet.
pub async fn discover_database(
    resolver: &dyn DiscoveryResolver,
    domain: &str,
) -> Result<Option<DiscoveryRecord>, DiscoveryError> {
    let text = match resolver.fetch(domain, HYPHALINK_WELL_KNOWN_PATH).await? {
        Some(text) => text,
        None => return Ok(None),
    };

    Ok(Some(DiscoveryRecord::parse(&text)?))
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to fetch discovery record")]
    Fetch(#[from] io::Error),
    #[error("Discovery record is not a valid hyphalink")]
    InvalidRecord(#[from] KeyError),
}

impl DiscoveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiscoveryError::Fetch(_))
    }
}
