use crate::{LandmarkDetection, Pose3D};
use derive_more::{Display, From, Into};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Time of a measurement in microseconds on the platform clock.
pub type Timestamp = i64;

/// Index of a camera on the platform.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIndex(pub usize);

/// Platform motion since the previous odometry measurement, expressed in the previous platform frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct OdometryDelta {
    pub timestamp: Timestamp,
    pub delta: Pose3D,
}

/// All landmarks one camera saw in one image.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Keyframe {
    pub timestamp: Timestamp,
    pub camera: CameraIndex,
    pub detections: Vec<LandmarkDetection>,
}

/// Everything that arrived since the last call into the mapper.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct InputBatch {
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub odometry: Vec<OdometryDelta>,
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub keyframes: Vec<Keyframe>,
}

impl InputBatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_odometry(mut self, timestamp: Timestamp, delta: Pose3D) -> Self {
        self.odometry.push(OdometryDelta { timestamp, delta });
        self
    }

    #[must_use]
    pub fn with_keyframe(
        mut self,
        timestamp: Timestamp,
        camera: impl Into<CameraIndex>,
        detections: Vec<LandmarkDetection>,
    ) -> Self {
        self.keyframes.push(Keyframe {
            timestamp,
            camera: camera.into(),
            detections,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.odometry.is_empty() && self.keyframes.is_empty()
    }
}
