use crate::ephemeral::MessageId;
use indexmap::IndexSet;

/// SeenSet remembers the ids of the most recent messages, evicting the oldest once full. A
/// message evicted and then received again is delivered again.
pub(crate) struct SeenSet {
    capacity: usize,
    ids: IndexSet<MessageId>,
}

impl SeenSet {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        SeenSet {
            capacity,
            ids: IndexSet::with_capacity(capacity),
        }
    }

    /// Returns true if `id` was not already present.
    pub(crate) fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }

        while self.ids.len() > self.capacity {
            self.ids.shift_remove_index(0);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> MessageId {
        MessageId::of_canonical_bytes(&[n])
    }

    #[test]
    fn duplicate_inserts_report_false() {
        let mut seen = SeenSet::with_capacity(4);

        assert!(seen.insert(id(1)));
        assert!(!seen.insert(id(1)));
        assert_eq!(1, seen.len());
    }

    #[test]
    fn evicts_oldest_first() {
        let mut seen = SeenSet::with_capacity(2);
        seen.insert(id(1));
        seen.insert(id(2));
        seen.insert(id(3));

        assert!(!seen.contains(&id(1)));
        assert!(seen.contains(&id(2)));
        assert!(seen.contains(&id(3)));
        assert_eq!(2, seen.len());

        // Forgotten, so it counts as new again.
        assert!(seen.insert(id(1)));
    }
}
