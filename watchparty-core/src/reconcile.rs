//! Optimistic state that merges tentative local changes with authoritative remote ones.
//!
//! The visible state is always `pending` folded over `confirmed`. Confirmed state is
//! only ever replaced by remote events, store reads or confirmed local writes, so a
//! local change can never erase what the store already committed.

use std::fmt::Debug;

/// A pure description of how deltas fold into a state.
pub trait Reducer {
    type State: Clone;
    type Delta: Clone;
    /// Identifies a delta, so that a confirmed copy of a local delta is not applied twice
    type Key: PartialEq + Clone + Debug;

    fn fold(state: Self::State, delta: &Self::Delta) -> Self::State;

    fn key(delta: &Self::Delta) -> Self::Key;

    /// Returns true if the state already contains the effect of the delta.
    /// Pending deltas that are settled are dropped on rebase.
    fn is_settled(_state: &Self::State, _delta: &Self::Delta) -> bool {
        false
    }

    /// Returns what is left of a pending local delta after a remote delta was folded.
    /// By default, a remote delta with the same key replaces the pending one.
    fn supersede(pending: &Self::Delta, remote: &Self::Delta) -> Option<Self::Delta> {
        if Self::key(pending) == Self::key(remote) {
            None
        } else {
            Some(pending.clone())
        }
    }
}

/// Confirmed state plus the local deltas that are not confirmed yet.
pub struct Optimistic<R>
where
    R: Reducer,
{
    confirmed: R::State,
    pending: Vec<R::Delta>,
    /// The last error of a local write, for the slice this state backs
    error: Option<String>,
}

impl<R> Optimistic<R>
where
    R: Reducer,
{
    pub fn new(confirmed: R::State) -> Self {
        Self {
            confirmed,
            pending: vec![],
            error: None,
        }
    }

    /// Applies a local delta immediately, before it is confirmed.
    /// Returns the key used to confirm, fail or reset it later.
    pub fn apply_local(&mut self, delta: R::Delta) -> R::Key {
        let key = R::key(&delta);

        self.error = None;
        self.pending.push(delta);

        key
    }

    /// Folds an event received from another participant or the store.
    pub fn apply_remote(&mut self, delta: R::Delta) {
        self.confirmed = R::fold(self.confirmed.clone(), &delta);
        self.pending = self
            .pending
            .iter()
            .filter_map(|p| R::supersede(p, &delta))
            .collect();
    }

    /// Moves a pending delta into the confirmed state.
    /// Returns false if no pending delta has the key.
    pub fn confirm(&mut self, key: &R::Key) -> bool {
        match self.take_pending(key) {
            Some(delta) => {
                self.confirmed = R::fold(self.confirmed.clone(), &delta);
                true
            }
            None => false,
        }
    }

    /// Drops a pending delta because the store returned the state that contains it.
    pub fn settle(&mut self, key: &R::Key, confirmed: R::State) {
        self.take_pending(key);
        self.rebase(confirmed);
    }

    /// Records that the write of a pending delta failed.
    /// The delta stays visible until it is explicitly reset.
    pub fn fail(&mut self, key: &R::Key, error: impl ToString) {
        if self.pending.iter().any(|p| &R::key(p) == key) {
            self.error = Some(error.to_string());
        }
    }

    /// Removes a pending delta without applying it.
    pub fn reset(&mut self, key: &R::Key) -> Option<R::Delta> {
        let removed = self.take_pending(key);

        if self.pending.is_empty() {
            self.error = None;
        }

        removed
    }

    /// Replaces the confirmed state with a fresh read from the store.
    pub fn rebase(&mut self, confirmed: R::State) {
        self.confirmed = confirmed;

        let confirmed = &self.confirmed;
        self.pending.retain(|p| !R::is_settled(confirmed, p));
    }

    /// The state as it should be displayed.
    pub fn visible(&self) -> R::State {
        self.pending
            .iter()
            .fold(self.confirmed.clone(), |state, delta| R::fold(state, delta))
    }

    pub fn confirmed(&self) -> &R::State {
        &self.confirmed
    }

    pub fn pending(&self) -> &[R::Delta] {
        &self.pending
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    fn take_pending(&mut self, key: &R::Key) -> Option<R::Delta> {
        let index = self.pending.iter().position(|p| &R::key(p) == key)?;
        Some(self.pending.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    /// An append-only log ordered by (timestamp, id)
    struct Log;

    impl Reducer for Log {
        type State = Vec<(u32, u32)>;
        type Delta = (u32, u32);
        type Key = u32;

        fn fold(mut state: Self::State, delta: &Self::Delta) -> Self::State {
            if state.iter().all(|(_, id)| *id != delta.1) {
                let index = state.partition_point(|entry| entry < delta);
                state.insert(index, *delta);
            }

            state
        }

        fn key(delta: &Self::Delta) -> Self::Key {
            delta.1
        }

        fn is_settled(state: &Self::State, delta: &Self::Delta) -> bool {
            state.iter().any(|(_, id)| *id == delta.1)
        }
    }

    /// Scalar fields, overwritten by whoever wrote last
    struct Fields;

    #[derive(Debug, Clone)]
    struct Patch {
        id: u32,
        fields: BTreeMap<u8, u32>,
    }

    impl Reducer for Fields {
        type State = BTreeMap<u8, u32>;
        type Delta = Patch;
        type Key = u32;

        fn fold(mut state: Self::State, delta: &Self::Delta) -> Self::State {
            state.extend(delta.fields.iter().map(|(k, v)| (*k, *v)));
            state
        }

        fn key(delta: &Self::Delta) -> Self::Key {
            delta.id
        }

        fn supersede(pending: &Self::Delta, remote: &Self::Delta) -> Option<Self::Delta> {
            let fields: BTreeMap<_, _> = pending
                .fields
                .iter()
                .filter(|(k, _)| !remote.fields.contains_key(k))
                .map(|(k, v)| (*k, *v))
                .collect();

            (pending.id != remote.id && !fields.is_empty()).then(|| Patch {
                id: pending.id,
                fields,
            })
        }
    }

    fn unique_entries() -> impl Strategy<Value = Vec<(u32, u32)>> {
        prop::collection::btree_map(any::<u32>(), 0u32..1000, 0..20)
            .prop_map(|m| m.into_iter().map(|(id, ts)| (ts, id)).collect())
    }

    fn patches() -> impl Strategy<Value = Vec<Patch>> {
        prop::collection::vec(prop::collection::btree_map(0u8..4, any::<u32>(), 1..4), 1..12)
            .prop_map(|all| {
                all.into_iter()
                    .enumerate()
                    .map(|(id, fields)| Patch {
                        id: id as u32,
                        fields,
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn local_appends_and_their_echoes_show_once(
            entries in unique_entries(),
            seed in any::<u64>(),
        ) {
            let mut state = Optimistic::<Log>::new(vec![]);

            for entry in &entries {
                state.apply_local(*entry);
            }

            // Echoes arrive in any order
            let mut echoes = entries.clone();
            let len = echoes.len().max(1);
            echoes.rotate_left((seed as usize) % len);

            for echo in echoes {
                state.apply_remote(echo);
            }

            let visible = state.visible();
            let mut expected = entries.clone();
            expected.sort();

            prop_assert_eq!(visible, expected);
            prop_assert!(state.pending().is_empty());
        }

        #[test]
        fn remote_appends_are_idempotent(entries in unique_entries()) {
            let mut once = Optimistic::<Log>::new(vec![]);
            let mut twice = Optimistic::<Log>::new(vec![]);

            for entry in &entries {
                once.apply_remote(*entry);
                twice.apply_remote(*entry);
                twice.apply_remote(*entry);
            }

            prop_assert_eq!(once.visible(), twice.visible());
        }

        #[test]
        fn remote_appends_commute(entries in unique_entries()) {
            let mut forward = Optimistic::<Log>::new(vec![]);
            let mut backward = Optimistic::<Log>::new(vec![]);

            for entry in &entries {
                forward.apply_remote(*entry);
            }

            for entry in entries.iter().rev() {
                backward.apply_remote(*entry);
            }

            prop_assert_eq!(forward.visible(), backward.visible());
        }

        #[test]
        fn last_remote_writer_wins(patches in patches()) {
            let mut state = Optimistic::<Fields>::new(BTreeMap::new());

            for patch in &patches {
                state.apply_remote(patch.clone());
            }

            let visible = state.visible();

            for (field, value) in visible {
                let last = patches
                    .iter()
                    .rev()
                    .find_map(|p| p.fields.get(&field))
                    .copied();

                prop_assert_eq!(Some(value), last);
            }
        }

        #[test]
        fn remote_write_overrides_pending_local_field(
            local in any::<u32>(),
            remote in any::<u32>(),
        ) {
            let mut state = Optimistic::<Fields>::new(BTreeMap::new());

            state.apply_local(Patch { id: 1, fields: BTreeMap::from([(0, local), (1, local)]) });
            state.apply_remote(Patch { id: 2, fields: BTreeMap::from([(0, remote)]) });

            let visible = state.visible();

            prop_assert_eq!(visible.get(&0), Some(&remote));
            prop_assert_eq!(visible.get(&1), Some(&local), "untouched fields stay pending");
        }
    }

    #[test]
    fn test_failed_local_write_is_retained_until_reset() {
        let mut state = Optimistic::<Log>::new(vec![(1, 1)]);

        let key = state.apply_local((2, 2));
        state.fail(&key, "an error occured, please try again");

        assert_eq!(state.visible(), vec![(1, 1), (2, 2)]);
        assert_eq!(state.error(), Some("an error occured, please try again"));

        state.reset(&key);

        assert_eq!(state.visible(), vec![(1, 1)]);
        assert_eq!(state.error(), None);
    }

    #[test]
    fn test_new_local_write_clears_error() {
        let mut state = Optimistic::<Log>::new(vec![]);

        let key = state.apply_local((1, 1));
        state.fail(&key, "failed");
        state.apply_local((2, 2));

        assert_eq!(state.error(), None);
    }

    #[test]
    fn test_confirm_moves_pending_into_confirmed() {
        let mut state = Optimistic::<Log>::new(vec![]);

        let key = state.apply_local((5, 9));
        assert!(state.confirmed().is_empty());

        assert!(state.confirm(&key));
        assert_eq!(state.confirmed(), &vec![(5, 9)]);
        assert!(!state.confirm(&key), "a delta is only confirmed once");
    }

    #[test]
    fn test_rebase_drops_settled_pending_deltas() {
        let mut state = Optimistic::<Log>::new(vec![]);

        state.apply_local((1, 1));
        state.apply_local((2, 2));

        // A store read that only contains the first entry
        state.rebase(vec![(1, 1), (3, 3)]);

        assert_eq!(state.pending(), &[(2, 2)]);
        assert_eq!(state.visible(), vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_settle_replaces_confirmed_state() {
        let mut state = Optimistic::<Fields>::new(BTreeMap::from([(0, 1)]));

        let key = state.apply_local(Patch {
            id: 7,
            fields: BTreeMap::from([(0, 2)]),
        });

        state.settle(&key, BTreeMap::from([(0, 3)]));

        assert!(state.pending().is_empty());
        assert_eq!(state.visible(), BTreeMap::from([(0, 3)]));
    }
}
