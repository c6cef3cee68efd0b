use crate::commitlog::Sequence;
use crate::keys::ReadKey;
use serde_json::Value;
use std::collections::HashMap;

/// One writer's latest write to one path.
#[derive(Clone, Debug)]
struct PathWrite {
    clock: u64,
    sequence: Sequence,
    value: Value,
}

/// PathIndex resolves the value at each path across all writers.
///
/// For each path, every writer's most recent write (by sequence) is a candidate. Of the
/// candidates whose writer is authorized, the winner is the greatest by
/// `(clock, sequence, read key)`: the higher logical clock wins, then the higher sequence, then the
/// lexicographically greater read key. Nothing depends on arrival order, so every node holding the
/// same entries resolves the same value.
#[derive(Default)]
pub(crate) struct PathIndex {
    paths: HashMap<String, HashMap<ReadKey, PathWrite>>,
}

impl PathIndex {
    /// Returns true if this write became `writer`'s latest write to `path`.
    pub(crate) fn record(
        &mut self,
        writer: ReadKey,
        path: &str,
        sequence: Sequence,
        clock: u64,
        value: Value,
    ) -> bool {
        let writes = self.paths.entry(path.to_string()).or_default();
        match writes.get(&writer) {
            Some(existing) if existing.sequence >= sequence => false,
            _ => {
                writes.insert(writer, PathWrite { clock, sequence, value });
                true
            }
        }
    }

    pub(crate) fn resolve<A>(&self, path: &str, is_authorized: A) -> Option<&Value>
    where
        A: Fn(&ReadKey) -> bool,
    {
        self.paths
            .get(path)?
            .iter()
            .filter(|(writer, _)| is_authorized(writer))
            .max_by(|(a_writer, a), (b_writer, b)| {
                (a.clock, a.sequence, *a_writer).cmp(&(b.clock, b.sequence, *b_writer))
            })
            .map(|(_, write)| &write.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use serde_json::json;

    fn two_writers() -> (ReadKey, ReadKey) {
        let a = KeyPair::generate().read_key();
        let b = KeyPair::generate().read_key();
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    #[test]
    fn higher_clock_wins() {
        let (low, high) = two_writers();
        let mut index = PathIndex::default();
        index.record(high, "/p", Sequence::new(9), 3, json!("old"));
        index.record(low, "/p", Sequence::new(0), 4, json!("new"));

        assert_eq!(Some(&json!("new")), index.resolve("/p", |_| true));
    }

    #[test]
    fn same_clock_falls_back_to_sequence_then_key() {
        let (low, high) = two_writers();

        let mut index = PathIndex::default();
        index.record(high, "/p", Sequence::new(3), 5, json!("b"));
        index.record(low, "/p", Sequence::new(5), 5, json!("a"));
        assert_eq!(Some(&json!("a")), index.resolve("/p", |_| true));

        let mut index = PathIndex::default();
        index.record(low, "/p", Sequence::new(4), 5, json!("low"));
        index.record(high, "/p", Sequence::new(4), 5, json!("high"));
        assert_eq!(Some(&json!("high")), index.resolve("/p", |_| true));
    }

    #[test]
    fn insertion_order_is_irrelevant() {
        let (a, b) = two_writers();
        let writes = vec![
            (a, Sequence::new(5), 6, json!({"v": 1})),
            (b, Sequence::new(3), 6, json!({"v": 2})),
            (a, Sequence::new(2), 3, json!({"v": 0})),
        ];

        let mut forwards = PathIndex::default();
        for (w, s, c, v) in writes.iter().cloned() {
            forwards.record(w, "/p", s, c, v);
        }
        let mut backwards = PathIndex::default();
        for (w, s, c, v) in writes.iter().rev().cloned() {
            backwards.record(w, "/p", s, c, v);
        }

        assert_eq!(Some(&json!({"v": 1})), forwards.resolve("/p", |_| true));
        assert_eq!(forwards.resolve("/p", |_| true), backwards.resolve("/p", |_| true));
    }

    #[test]
    fn unauthorized_writers_are_ignored() {
        let (a, b) = two_writers();
        let mut index = PathIndex::default();
        index.record(a, "/p", Sequence::new(0), 1, json!("a"));
        index.record(b, "/p", Sequence::new(0), 2, json!("b"));

        assert_eq!(Some(&json!("a")), index.resolve("/p", |w| *w == a));
        assert_eq!(None, index.resolve("/p", |_| false));
        assert_eq!(None, index.resolve("/missing", |_| true));
    }
}
