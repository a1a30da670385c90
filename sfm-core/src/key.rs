use crate::{LandmarkId, Pose3D};
use core::fmt;
use derive_more::{From, Into};
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Identifies one platform motion state. Keys are handed out in increasing order as odometry arrives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct StateKey(pub u64);

impl StateKey {
    /// The key that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Names an estimated quantity in the factor graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum VariableKey {
    /// The platform pose at one motion state.
    State(StateKey),
    /// The pose of a landmark. Every sighting of the same id maps to the same key.
    Landmark(LandmarkId),
}

impl VariableKey {
    pub fn state(self) -> Option<StateKey> {
        match self {
            Self::State(key) => Some(key),
            Self::Landmark(_) => None,
        }
    }

    pub fn landmark(self) -> Option<LandmarkId> {
        match self {
            Self::State(_) => None,
            Self::Landmark(id) => Some(id),
        }
    }
}

impl From<StateKey> for VariableKey {
    fn from(key: StateKey) -> Self {
        Self::State(key)
    }
}

impl From<LandmarkId> for VariableKey {
    fn from(id: LandmarkId) -> Self {
        Self::Landmark(id)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(key) => fmt::Display::fmt(key, f),
            Self::Landmark(LandmarkId(id)) => write!(f, "l{}", id),
        }
    }
}

/// A value for every variable, ordered by key.
pub type Values = BTreeMap<VariableKey, Pose3D>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmark_keys_are_derived_from_id() {
        assert_eq!(
            VariableKey::from(LandmarkId(4)),
            VariableKey::Landmark(LandmarkId(4))
        );
        assert_eq!(VariableKey::from(LandmarkId(4)).to_string(), "l4");
        assert_eq!(VariableKey::from(StateKey(0).next()).to_string(), "x1");
    }
}
