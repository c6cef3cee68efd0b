use std::convert::TryFrom;

#[derive(Clone, Default)]
pub struct DatabaseOptions {
    /// How many requests may queue for the database task before callers wait.
    pub actor_queue_size: Option<usize>,
    /// Largest replication frame accepted from a peer, in bytes.
    pub max_frame_length: Option<usize>,
    /// How many rejected batches a session tolerates before closing.
    pub max_suspect_entries: Option<usize>,
    /// How many ephemeral message ids are remembered for deduplication.
    pub seen_set_capacity: Option<usize>,
    /// Most entries sent in one frame during bulk sync.
    pub sync_batch_size: Option<usize>,
}

#[derive(Clone, Debug)]
pub(super) struct DatabaseOptionsValidated {
    pub actor_queue_size: usize,
    pub max_frame_length: usize,
    pub max_suspect_entries: usize,
    pub seen_set_capacity: usize,
    pub sync_batch_size: usize,
}

impl DatabaseOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.actor_queue_size == 0 {
            return Err("Actor queue size must be greater than 0");
        }
        if self.max_frame_length == 0 {
            return Err("Max frame length must be greater than 0");
        }
        if self.max_suspect_entries == 0 {
            return Err("Max suspect entries must be greater than 0");
        }
        if self.seen_set_capacity == 0 {
            return Err("Seen set capacity must be greater than 0");
        }
        if self.sync_batch_size == 0 {
            return Err("Sync batch size must be greater than 0");
        }

        Ok(())
    }
}

impl TryFrom<DatabaseOptions> for DatabaseOptionsValidated {
    type Error = &'static str;

    fn try_from(options: DatabaseOptions) -> Result<Self, Self::Error> {
        let values = DatabaseOptionsValidated {
            actor_queue_size: options.actor_queue_size.unwrap_or(64),
            max_frame_length: options.max_frame_length.unwrap_or(4 * 1024 * 1024),
            max_suspect_entries: options.max_suspect_entries.unwrap_or(3),
            seen_set_capacity: options.seen_set_capacity.unwrap_or(4096),
            sync_batch_size: options.sync_batch_size.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = DatabaseOptionsValidated::try_from(DatabaseOptions::default()).unwrap();
        assert_eq!(options.max_suspect_entries, 3);
        assert_eq!(options.max_frame_length, 4 * 1024 * 1024);
    }

    #[test]
    fn zero_values_are_rejected() {
        let options = DatabaseOptions {
            sync_batch_size: Some(0),
            ..DatabaseOptions::default()
        };
        assert!(DatabaseOptionsValidated::try_from(options).is_err());
    }
}
