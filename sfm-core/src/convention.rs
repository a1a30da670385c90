//! Conversions between the canonical frame (X forward, Y left, Z up) and the camera optical frame
//! (X right, Y down, Z forward).
//!
//! A point seen by a camera maps into the optical frame as `(x, y, z) -> (-y, -z, x)`. Every other
//! conversion in this module is built from that one permutation so the two directions can never
//! disagree.

use crate::Pose3D;
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Matrix3, Point3, Rotation3, Translation3, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Rotation that takes canonical camera coordinates into optical coordinates.
#[rustfmt::skip]
pub fn optical_from_canonical() -> Rotation3<f64> {
    Rotation3::from_matrix_unchecked(Matrix3::new(
        0.0, -1.0,  0.0,
        0.0,  0.0, -1.0,
        1.0,  0.0,  0.0,
    ))
}

/// `newX = -y, newY = -z, newZ = x`
pub fn to_optical(v: Vector3<f64>) -> Vector3<f64> {
    Vector3::new(-v.y, -v.z, v.x)
}

/// `newX = z, newY = -x, newZ = -y`
pub fn from_optical(v: Vector3<f64>) -> Vector3<f64> {
    Vector3::new(v.z, -v.x, -v.y)
}

/// Re-expresses a transform whose output is in optical axes so that its output is in canonical
/// camera axes. The input frame is left untouched.
pub fn camera_from_optical(optical_from_object: IsometryMatrix3<f64>) -> Pose3D {
    let canonical_from_optical =
        IsometryMatrix3::from_parts(Translation3::identity(), optical_from_canonical().inverse());
    Pose3D(canonical_from_optical * optical_from_object)
}

/// A transform from world coordinates (canonical axes) into the optical frame of a camera.
///
/// This is what perspective solvers naturally produce, since the pinhole projection divides by the
/// optical `z`. Use [`WorldToOptical::camera_pose`] to get the pose of the camera in the world.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToOptical(pub IsometryMatrix3<f64>);

impl WorldToOptical {
    /// Builds the transform from a canonical camera pose in the world.
    pub fn from_camera_pose(camera_pose: Pose3D) -> Self {
        let optical_to_camera =
            IsometryMatrix3::from_parts(Translation3::identity(), optical_from_canonical().inverse());
        Self((camera_pose.0 * optical_to_camera).inverse())
    }

    /// The pose of the camera in the world, with canonical camera axes.
    ///
    /// The inverse of the transform gives the optical frame in the world; its translation is the
    /// camera center and its rotation is re-expressed through [`optical_from_canonical`].
    pub fn camera_pose(self) -> Pose3D {
        let camera_to_optical =
            IsometryMatrix3::from_parts(Translation3::identity(), optical_from_canonical());
        Pose3D(self.0.inverse() * camera_to_optical)
    }

    /// Maps a world point into the optical frame.
    pub fn transform(&self, point: &Point3<f64>) -> Point3<f64> {
        self.0 * point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck_macros::quickcheck;

    #[test]
    fn rotation_is_proper() {
        assert_relative_eq!(optical_from_canonical().matrix().determinant(), 1.0);
    }

    #[test]
    fn forward_is_optical_z() {
        let forward = to_optical(Vector3::x());
        assert_relative_eq!(forward, Vector3::z());
        let left = to_optical(Vector3::y());
        assert_relative_eq!(left, -Vector3::x());
        let up = to_optical(Vector3::z());
        assert_relative_eq!(up, -Vector3::y());
    }

    #[quickcheck]
    fn permutation_matches_rotation(x: i16, y: i16, z: i16) -> bool {
        let v = Vector3::new(x as f64, y as f64, z as f64);
        let rotated = optical_from_canonical() * v;
        to_optical(v) == rotated && from_optical(to_optical(v)) == v
    }

    #[test]
    fn camera_pose_round_trip_is_exact() {
        let pose = Pose3D::from_translation_rpy(Vector3::new(2.0, -1.0, 0.7), 0.1, -0.3, 2.4);
        let world_to_optical = WorldToOptical::from_camera_pose(pose);
        assert_relative_eq!(world_to_optical.camera_pose().0, pose.0, epsilon = 1e-12);
    }

    #[test]
    fn point_ahead_of_camera_has_positive_depth() {
        // Camera at (1, 0, 0) looking down +Y (yaw of 90 degrees).
        let pose = Pose3D::from_translation_rpy(
            Vector3::new(1.0, 0.0, 0.0),
            0.0,
            0.0,
            core::f64::consts::FRAC_PI_2,
        );
        let optical = WorldToOptical::from_camera_pose(pose).transform(&Point3::new(1.0, 3.0, 0.5));
        assert_relative_eq!(optical.coords, Vector3::new(0.0, -0.5, 3.0), epsilon = 1e-12);
    }
}
