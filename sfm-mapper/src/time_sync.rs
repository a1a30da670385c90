//! Association of measurement timestamps with platform states.

use sfm_core::{StateKey, Timestamp};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("there is no platform state to associate the measurement with")]
    NoAssociableState,
}

/// Platform states ordered by the timestamp of the odometry delta that created them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeKeyMap {
    states: BTreeMap<Timestamp, StateKey>,
}

impl TimeKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new state. Timestamps must be strictly increasing, otherwise nothing is recorded
    /// and `false` is returned.
    pub fn insert(&mut self, timestamp: Timestamp, key: StateKey) -> bool {
        match self.latest() {
            Some((latest, _)) if timestamp <= latest => false,
            _ => {
                self.states.insert(timestamp, key);
                true
            }
        }
    }

    pub fn get(&self, timestamp: Timestamp) -> Option<StateKey> {
        self.states.get(&timestamp).copied()
    }

    pub fn latest(&self) -> Option<(Timestamp, StateKey)> {
        self.states
            .iter()
            .next_back()
            .map(|(&timestamp, &key)| (timestamp, key))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, StateKey)> + '_ {
        self.states.iter().map(|(&timestamp, &key)| (timestamp, key))
    }

    /// Appends every entry of `other`, which must all be later than the entries already present.
    pub fn append(&mut self, other: TimeKeyMap) {
        for (timestamp, key) in other.states {
            self.insert(timestamp, key);
        }
    }

    /// The state whose timestamp is closest to `timestamp`. Ties go to the earlier state.
    pub fn nearest(&self, timestamp: Timestamp) -> Result<(Timestamp, StateKey), SyncError> {
        nearest_state(&[self], timestamp)
    }

    /// The entries that could be closest to `timestamp`.
    fn neighbors(&self, timestamp: Timestamp) -> impl Iterator<Item = (Timestamp, StateKey)> + '_ {
        let before = self.states.range(..=timestamp).next_back();
        let after = self.states.range(timestamp..).next();
        before
            .into_iter()
            .chain(after)
            .map(|(&timestamp, &key)| (timestamp, key))
    }
}

/// Finds the state closest in time to `timestamp` across several maps, with ties going to the
/// earlier state.
pub fn nearest_state(
    maps: &[&TimeKeyMap],
    timestamp: Timestamp,
) -> Result<(Timestamp, StateKey), SyncError> {
    maps.iter()
        .flat_map(|map| map.neighbors(timestamp))
        .min_by_key(|&(candidate, _)| (candidate.abs_diff(timestamp), candidate))
        .ok_or(SyncError::NoAssociableState)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(timestamps: &[Timestamp]) -> TimeKeyMap {
        let mut map = TimeKeyMap::new();
        for (ix, &timestamp) in timestamps.iter().enumerate() {
            assert!(map.insert(timestamp, StateKey(ix as u64)));
        }
        map
    }

    #[test]
    fn picks_closest_state() {
        let map = map(&[10, 20, 35]);
        assert_eq!(map.nearest(22), Ok((20, StateKey(1))));
        assert_eq!(map.nearest(30), Ok((35, StateKey(2))));
        assert_eq!(map.nearest(-100), Ok((10, StateKey(0))));
        assert_eq!(map.nearest(1000), Ok((35, StateKey(2))));
        assert_eq!(map.nearest(20), Ok((20, StateKey(1))));
    }

    #[test]
    fn ties_go_to_earlier_state() {
        let map = map(&[10, 20]);
        assert_eq!(map.nearest(15), Ok((10, StateKey(0))));
    }

    #[test]
    fn empty_map_has_no_state() {
        assert_eq!(
            TimeKeyMap::new().nearest(0),
            Err(SyncError::NoAssociableState)
        );
    }

    #[test]
    fn searches_across_maps() {
        let committed = map(&[10, 20]);
        let mut staged = TimeKeyMap::new();
        staged.insert(40, StateKey(2));
        assert_eq!(
            nearest_state(&[&committed, &staged], 31),
            Ok((40, StateKey(2)))
        );
        assert_eq!(
            nearest_state(&[&committed, &staged], 30),
            Ok((20, StateKey(1)))
        );
    }

    #[test]
    fn rejects_timestamps_out_of_order() {
        let mut map = map(&[10, 20]);
        assert!(!map.insert(20, StateKey(5)));
        assert!(!map.insert(15, StateKey(5)));
        assert_eq!(map.len(), 2);
        assert_eq!(map.latest(), Some((20, StateKey(1))));
    }
}
