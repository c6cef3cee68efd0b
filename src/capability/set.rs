use crate::capability::{CapabilityChange, CapabilityRecord, CapabilityState, Grant};
use crate::commitlog::Sequence;
use crate::keys::ReadKey;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Where a record sits in the deterministic causal order. Ordering is lexicographic over the
/// fields, in declaration order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CausalPosition {
    clock: u64,
    authorizer: ReadKey,
    sequence: Sequence,
}

/// CapabilitySet tracks which writers may contribute to a database.
///
/// Authorization is never patched incrementally. Every applied record is kept, and the derived
/// state is recomputed by replaying all of them in causal order from genesis (where only the
/// origin is authorized). Two nodes holding the same records therefore agree, no matter in which
/// order the records arrived.
pub(crate) struct CapabilitySet {
    origin: ReadKey,
    history: BTreeMap<CausalPosition, CapabilityRecord>,
    // Derived from `history`.
    grants: HashMap<ReadKey, Grant>,
}

impl CapabilitySet {
    pub(crate) fn new(origin: ReadKey) -> Self {
        CapabilitySet {
            origin,
            history: BTreeMap::new(),
            grants: HashMap::new(),
        }
    }

    pub(crate) fn is_authorized(&self, read_key: &ReadKey) -> bool {
        self.state(read_key) == Some(CapabilityState::Authorized)
    }

    pub(crate) fn state(&self, read_key: &ReadKey) -> Option<CapabilityState> {
        if *read_key == self.origin {
            return Some(CapabilityState::Authorized);
        }

        self.grants.get(read_key).map(|grant| grant.state)
    }

    #[cfg(test)]
    pub(crate) fn grant(&self, read_key: &ReadKey) -> Option<Grant> {
        if *read_key == self.origin {
            return Some(Grant {
                state: CapabilityState::Authorized,
                authorizer: self.origin,
            });
        }

        self.grants.get(read_key).copied()
    }

    pub(crate) fn authorized_writers(&self) -> impl Iterator<Item = &ReadKey> + '_ {
        std::iter::once(&self.origin).chain(
            self.grants
                .iter()
                .filter(|(_, grant)| grant.state == CapabilityState::Authorized)
                .map(|(read_key, _)| read_key),
        )
    }

    /// Builds the record `authorizer` would append to grant `subject` the given state. Fails if
    /// the authorizer can't grant anything right now.
    pub(crate) fn new_record(
        &self,
        subject: ReadKey,
        state: CapabilityState,
        authorizer: ReadKey,
        clock: u64,
    ) -> Result<CapabilityRecord, CapabilityError> {
        if !self.is_authorized(&authorizer) {
            return Err(CapabilityError::Unauthorized(authorizer));
        }
        if subject == self.origin && state != CapabilityState::Authorized {
            return Err(CapabilityError::OriginIsPermanent);
        }

        Ok(CapabilityRecord {
            subject,
            state,
            authorizer,
            clock,
        })
    }

    /// Applies a record found at `sequence` in `writer`'s log, and returns every subject whose
    /// derived state changed as a result. Applying the same record twice is a no-op.
    pub(crate) fn apply_record(
        &mut self,
        writer: ReadKey,
        sequence: Sequence,
        record: CapabilityRecord,
    ) -> Result<Vec<CapabilityChange>, CapabilityError> {
        if record.authorizer != writer {
            return Err(CapabilityError::ForgedAuthorizer {
                claimed: record.authorizer,
                writer,
            });
        }

        let position = CausalPosition {
            clock: record.clock,
            authorizer: writer,
            sequence,
        };
        if self.history.insert(position, record).is_some() {
            return Ok(vec![]);
        }

        let recomputed = self.recompute();
        let previous = std::mem::replace(&mut self.grants, recomputed);
        Ok(self.diff(&previous))
    }

    fn recompute(&self) -> HashMap<ReadKey, Grant> {
        let mut grants: HashMap<ReadKey, Grant> = HashMap::new();

        for record in self.history.values() {
            let authorizer_ok = record.authorizer == self.origin
                || matches!(
                    grants.get(&record.authorizer),
                    Some(Grant {
                        state: CapabilityState::Authorized,
                        ..
                    })
                );
            if !authorizer_ok || record.subject == self.origin {
                continue;
            }

            grants.insert(
                record.subject,
                Grant {
                    state: record.state,
                    authorizer: record.authorizer,
                },
            );
        }

        grants
    }

    fn diff(&self, previous: &HashMap<ReadKey, Grant>) -> Vec<CapabilityChange> {
        let subjects: HashSet<&ReadKey> = previous.keys().chain(self.grants.keys()).collect();

        let mut changes: Vec<CapabilityChange> = subjects
            .into_iter()
            .filter_map(|subject| {
                let before = previous.get(subject).map(|grant| grant.state);
                let after = self.grants.get(subject).map(|grant| grant.state);
                if before == after {
                    return None;
                }
                Some(CapabilityChange {
                    subject: *subject,
                    previous: before,
                    current: after,
                })
            })
            .collect();

        changes.sort_by(|a, b| a.subject.cmp(&b.subject));
        changes
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub(crate) enum CapabilityError {
    #[error("{0:?} is not currently authorized")]
    Unauthorized(ReadKey),
    #[error("The origin writer's authorization can't be changed")]
    OriginIsPermanent,
    #[error("Record claims authorizer {claimed:?} but was written by {writer:?}")]
    ForgedAuthorizer { claimed: ReadKey, writer: ReadKey },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn key() -> ReadKey {
        KeyPair::generate().read_key()
    }

    fn record(subject: ReadKey, state: CapabilityState, authorizer: ReadKey, clock: u64) -> CapabilityRecord {
        CapabilityRecord {
            subject,
            state,
            authorizer,
            clock,
        }
    }

    #[test]
    fn only_origin_is_authorized_at_genesis() {
        let origin = key();
        let stranger = key();
        let set = CapabilitySet::new(origin);

        assert!(set.is_authorized(&origin));
        assert!(!set.is_authorized(&stranger));
        assert_eq!(None, set.state(&stranger));
        assert_eq!(vec![&origin], set.authorized_writers().collect::<Vec<_>>());
    }

    #[test]
    fn unauthorized_writer_cannot_build_records() {
        let origin = key();
        let stranger = key();
        let set = CapabilitySet::new(origin);

        assert_eq!(
            Err(CapabilityError::Unauthorized(stranger)),
            set.new_record(key(), CapabilityState::Authorized, stranger, 1)
        );
        assert_eq!(
            Err(CapabilityError::OriginIsPermanent),
            set.new_record(origin, CapabilityState::Revoked, origin, 1)
        );
    }

    #[test]
    fn authorization_reports_changes_once() {
        let origin = key();
        let bob = key();
        let mut set = CapabilitySet::new(origin);

        let grant = record(bob, CapabilityState::Authorized, origin, 1);
        let changes = set.apply_record(origin, Sequence::new(0), grant.clone()).unwrap();
        assert_eq!(
            vec![CapabilityChange {
                subject: bob,
                previous: None,
                current: Some(CapabilityState::Authorized),
            }],
            changes
        );
        assert!(set.is_authorized(&bob));

        // Same record again, e.g. from a replayed sync.
        assert!(set.apply_record(origin, Sequence::new(0), grant).unwrap().is_empty());
    }

    #[test]
    fn record_from_unauthorized_authorizer_has_no_effect_until_it_is_authorized() {
        let origin = key();
        let bob = key();
        let carol = key();
        let mut set = CapabilitySet::new(origin);

        // Bob's grant to Carol arrives before Origin's grant to Bob, even though it happened after.
        set.apply_record(bob, Sequence::new(0), record(carol, CapabilityState::Authorized, bob, 2))
            .unwrap();
        assert!(!set.is_authorized(&carol));

        let changes = set
            .apply_record(origin, Sequence::new(0), record(bob, CapabilityState::Authorized, origin, 1))
            .unwrap();
        assert_eq!(2, changes.len());
        assert!(set.is_authorized(&bob));
        assert!(set.is_authorized(&carol));
    }

    #[test]
    fn arrival_order_does_not_change_the_outcome() {
        let origin = key();
        let bob = key();
        let carol = key();

        let records = vec![
            (origin, 0, record(bob, CapabilityState::Authorized, origin, 1)),
            (origin, 1, record(carol, CapabilityState::Authorized, origin, 2)),
            (bob, 0, record(carol, CapabilityState::Revoked, bob, 3)),
        ];

        let mut forwards = CapabilitySet::new(origin);
        for (writer, seq, r) in records.iter().cloned() {
            forwards.apply_record(writer, Sequence::new(seq), r).unwrap();
        }
        let mut backwards = CapabilitySet::new(origin);
        for (writer, seq, r) in records.iter().rev().cloned() {
            backwards.apply_record(writer, Sequence::new(seq), r).unwrap();
        }

        for subject in [bob, carol].iter() {
            assert_eq!(forwards.state(subject), backwards.state(subject));
        }
        assert_eq!(Some(CapabilityState::Revoked), forwards.state(&carol));
        assert_eq!(Some(bob), forwards.grant(&carol).map(|g| g.authorizer));
    }

    #[test]
    fn revoked_writer_loses_authority_over_later_records() {
        let origin = key();
        let bob = key();
        let carol = key();
        let mut set = CapabilitySet::new(origin);

        set.apply_record(origin, Sequence::new(0), record(bob, CapabilityState::Authorized, origin, 1))
            .unwrap();
        set.apply_record(origin, Sequence::new(1), record(bob, CapabilityState::Revoked, origin, 2))
            .unwrap();
        set.apply_record(bob, Sequence::new(0), record(carol, CapabilityState::Authorized, bob, 3))
            .unwrap();

        assert_eq!(Some(CapabilityState::Revoked), set.state(&bob));
        assert!(!set.is_authorized(&carol));
    }

    #[test]
    fn forged_authorizer_is_rejected() {
        let origin = key();
        let mallory = key();
        let mut set = CapabilitySet::new(origin);

        let forged = record(mallory, CapabilityState::Authorized, origin, 1);
        assert!(matches!(
            set.apply_record(mallory, Sequence::new(0), forged),
            Err(CapabilityError::ForgedAuthorizer { .. })
        ));
        assert!(!set.is_authorized(&mallory));
    }
}
