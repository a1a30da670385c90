use sfm_core::{CameraIndex, LandmarkId, Pose3D, StateKey, Timestamp};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// How far the estimator has come.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorStatus {
    /// No platform state exists yet.
    Empty,
    /// Platform motion has been submitted but no solve has succeeded yet.
    Initialized,
    /// The last solve succeeded.
    Converged,
}

impl Default for EstimatorStatus {
    fn default() -> Self {
        Self::Empty
    }
}

#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub key: StateKey,
    /// Timestamp of the odometry delta that created the state.
    pub timestamp: Timestamp,
    pub pose: Pose3D,
}

#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkEstimate {
    pub id: LandmarkId,
    pub pose: Pose3D,
}

/// A snapshot of everything the mapper believes.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapEstimate {
    pub status: EstimatorStatus,
    /// Whether any keyframe has contributed landmark observations so far.
    pub has_vision: bool,
    /// Platform states in time order.
    pub trajectory: Vec<TrajectoryPoint>,
    /// Landmarks in id order.
    pub landmarks: Vec<LandmarkEstimate>,
}

impl MapEstimate {
    /// The most recent platform pose.
    pub fn latest_pose(&self) -> Option<Pose3D> {
        self.trajectory.last().map(|point| point.pose)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<Pose3D> {
        self.landmarks
            .binary_search_by_key(&id, |landmark| landmark.id)
            .ok()
            .map(|ix| self.landmarks[ix].pose)
    }
}

/// Why a measurement did not make it into the graph.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The delta is not later than the latest platform state.
    OutOfOrderOdometry,
    /// The keyframe names a camera without calibration.
    UnknownCamera(CameraIndex),
    /// The landmark is neither in the layout nor allowed to be placed from vision.
    UnmappedLandmark(LandmarkId),
    /// Placing an unmapped landmark from its detection failed.
    BackProjectionFailed(LandmarkId),
    /// Too many keyframes were waiting for odometry; the oldest was discarded.
    RetainedOverflow,
}

#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedInput {
    /// Timestamp of the delta or keyframe the measurement came from.
    pub timestamp: Timestamp,
    pub reason: DropReason,
}

/// What happened to the measurements of one batch.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub dropped: Vec<DroppedInput>,
    /// Keyframes still waiting for a platform state.
    pub retained_keyframes: usize,
    pub new_states: usize,
    pub new_factors: usize,
    /// Whether the solver ran for this batch.
    pub solved: bool,
}

/// The result of one successful [`crate::SfmMapper::optimize`] call.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperOutput {
    pub estimate: MapEstimate,
    pub report: RoundReport,
}
