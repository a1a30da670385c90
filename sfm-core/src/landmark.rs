use crate::Pose3D;
use derive_more::{Display, From, Into};
use nalgebra::{Point2, Point3, Vector3};
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Side length of a 6 inch fiducial tag in meters.
pub const DEFAULT_LANDMARK_SIZE: f64 = 0.1524;

/// The unique id of a fixed visual landmark (the decoded fiducial id).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct LandmarkId(pub i32);

/// One landmark seen in an image: its id and its four corners in pixel coordinates.
///
/// The corners must be in the same order as [`corner_offsets`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct LandmarkDetection {
    pub id: LandmarkId,
    pub corners: [Point2<f64>; 4],
}

impl LandmarkDetection {
    pub fn new(id: impl Into<LandmarkId>, corners: [Point2<f64>; 4]) -> Self {
        Self {
            id: id.into(),
            corners,
        }
    }
}

/// The corners of a square landmark of side `size` in the landmark's own frame.
///
/// The landmark face points along its +X axis, so all corners have `x = 0`. The order is
/// `(-y, -z)`, `(+y, -z)`, `(+y, +z)`, `(-y, +z)`.
pub fn corner_offsets(size: f64) -> [Vector3<f64>; 4] {
    let half = 0.5 * size;
    [
        Vector3::new(0.0, -half, -half),
        Vector3::new(0.0, half, -half),
        Vector3::new(0.0, half, half),
        Vector3::new(0.0, -half, half),
    ]
}

/// The world positions of the corners of a landmark at `pose`.
pub fn landmark_corners(pose: &Pose3D, size: f64) -> [Point3<f64>; 4] {
    corner_offsets(size).map(|offset| pose.transform_point(&offset.into()))
}

/// Prior knowledge about where landmarks are in the world.
pub trait LandmarkLayout {
    /// The pose of a landmark, if the layout knows about it.
    fn landmark_pose(&self, id: LandmarkId) -> Option<Pose3D>;

    /// The side length of every landmark in meters.
    fn landmark_size(&self) -> f64 {
        DEFAULT_LANDMARK_SIZE
    }

    /// The world positions of the corners of a landmark, in detection order.
    fn landmark_corners(&self, id: LandmarkId) -> Option<[Point3<f64>; 4]> {
        self.landmark_pose(id)
            .map(|pose| landmark_corners(&pose, self.landmark_size()))
    }
}

impl<L> LandmarkLayout for &L
where
    L: LandmarkLayout + ?Sized,
{
    fn landmark_pose(&self, id: LandmarkId) -> Option<Pose3D> {
        (**self).landmark_pose(id)
    }

    fn landmark_size(&self) -> f64 {
        (**self).landmark_size()
    }
}

/// A map of landmark poses, all sharing one size.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FieldLayout {
    pub landmark_size: f64,
    pub landmarks: BTreeMap<LandmarkId, Pose3D>,
}

impl FieldLayout {
    pub fn new(landmark_size: f64) -> Self {
        Self {
            landmark_size,
            landmarks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_landmark(mut self, id: impl Into<LandmarkId>, pose: Pose3D) -> Self {
        self.insert(id, pose);
        self
    }

    pub fn insert(&mut self, id: impl Into<LandmarkId>, pose: Pose3D) -> Option<Pose3D> {
        self.landmarks.insert(id.into(), pose)
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LandmarkId, Pose3D)> + '_ {
        self.landmarks.iter().map(|(&id, &pose)| (id, pose))
    }
}

impl Default for FieldLayout {
    fn default() -> Self {
        Self::new(DEFAULT_LANDMARK_SIZE)
    }
}

impl LandmarkLayout for FieldLayout {
    fn landmark_pose(&self, id: LandmarkId) -> Option<Pose3D> {
        self.landmarks.get(&id).copied()
    }

    fn landmark_size(&self) -> f64 {
        self.landmark_size
    }
}
