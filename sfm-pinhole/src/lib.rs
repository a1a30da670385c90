//! This crate provides the pinhole camera model used by the mapper: linear intrinsics, OpenCV
//! style lens distortion, and the extrinsic offset of the camera on the platform.
//!
//! Pixel coordinates have their origin at the top left of the image with X right and Y down. The
//! projection works on points in the optical frame (see [`sfm_core::convention`]).

mod distortion;

pub use distortion::*;

use sfm_core::nalgebra::{Matrix3, Point2, Point3, Unit, Vector2, Vector3};
use sfm_core::{CameraIndex, Pose3D, WorldToOptical};
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Points closer to the optical center than this (along the optical axis) are not projected.
pub const MIN_DEPTH: f64 = 1e-6;

/// This contains intrinsic camera parameters as per
/// [this Wikipedia page](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic matrix.
    /// This would imply that the pixel positions have an origin at `0,0`,
    /// the pixel distance unit is the focal length, pixels are square,
    /// and there is no skew.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            skew: 0.0,
            principal_point: Point2::new(0.0, 0.0),
        }
    }

    #[must_use]
    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    #[must_use]
    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    #[must_use]
    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    #[must_use]
    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }

    /// Takes in a point from an image in pixel coordinates and converts it to normalized image
    /// coordinates (still distorted).
    ///
    /// ```
    /// use sfm_core::nalgebra::{Point2, Vector2};
    /// use sfm_pinhole::CameraIntrinsics;
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = Point2::new(471.0, 322.0);
    /// let nkp = intrinsics.calibrate(kp);
    /// let distance = (kp.to_homogeneous() - intrinsics.matrix() * nkp.to_homogeneous()).norm();
    /// assert!(distance < 0.1);
    /// ```
    pub fn calibrate(&self, pixel: Point2<f64>) -> Point2<f64> {
        let centered = pixel - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        Point2::new(x, y)
    }

    /// Converts normalized image coordinates back into pixel coordinates.
    ///
    /// ```
    /// use sfm_core::nalgebra::{Point2, Vector2};
    /// use sfm_pinhole::CameraIntrinsics;
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = Point2::new(471.0, 322.0);
    /// let ukp = intrinsics.uncalibrate(intrinsics.calibrate(kp));
    /// assert!((kp - ukp).norm() < 1e-6);
    /// ```
    pub fn uncalibrate(&self, normalized: Point2<f64>) -> Point2<f64> {
        let y = normalized.y * self.focals.y;
        let x = normalized.x * self.focals.x + self.skew * normalized.y;
        Point2::new(x, y) + self.principal_point.coords
    }
}

/// Everything needed to take a world point seen by one camera of the platform into pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub distortion: Distortion,
    /// Pose of the camera (canonical axes) in the platform frame.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub robot_to_camera: Pose3D,
}

impl CameraModel {
    /// A distortion-free camera sitting at the platform origin.
    pub fn new(intrinsics: CameraIntrinsics) -> Self {
        Self {
            intrinsics,
            distortion: Distortion::none(),
            robot_to_camera: Pose3D::identity(),
        }
    }

    #[must_use]
    pub fn with_distortion(self, distortion: Distortion) -> Self {
        Self { distortion, ..self }
    }

    #[must_use]
    pub fn with_robot_to_camera(self, robot_to_camera: Pose3D) -> Self {
        Self {
            robot_to_camera,
            ..self
        }
    }

    /// Projects a point in the optical frame into pixels.
    ///
    /// Returns `None` when the point is not in front of the camera.
    pub fn project(&self, optical: &Point3<f64>) -> Option<Point2<f64>> {
        if !(optical.z > MIN_DEPTH) {
            return None;
        }
        Some(self.project_clamped(optical, MIN_DEPTH))
    }

    /// Projects a point in the optical frame into pixels, treating anything closer than
    /// `min_depth` as if it were at `min_depth`.
    ///
    /// Optimizers use this so that the residual stays defined (and very large) for a point that
    /// has wandered behind the camera.
    pub fn project_clamped(&self, optical: &Point3<f64>, min_depth: f64) -> Point2<f64> {
        let depth = optical.z.max(min_depth);
        let normalized = Point2::new(optical.x / depth, optical.y / depth);
        self.intrinsics
            .uncalibrate(self.distortion.distort(normalized))
    }

    /// Converts a pixel into undistorted normalized image coordinates.
    pub fn normalize(&self, pixel: Point2<f64>) -> Point2<f64> {
        self.distortion.undistort(self.intrinsics.calibrate(pixel))
    }

    /// The unit ray in the optical frame that passes through a pixel.
    pub fn bearing(&self, pixel: Point2<f64>) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.normalize(pixel).coords.push(1.0))
    }

    /// The pose of this camera in the world given the platform pose.
    pub fn camera_pose(&self, body_pose: Pose3D) -> Pose3D {
        body_pose * self.robot_to_camera
    }

    /// The platform pose in the world that puts this camera at `camera_pose`.
    pub fn body_pose(&self, camera_pose: Pose3D) -> Pose3D {
        camera_pose * self.robot_to_camera.inverse()
    }

    /// The transform from world coordinates into this camera's optical frame.
    pub fn world_to_optical(&self, body_pose: Pose3D) -> WorldToOptical {
        WorldToOptical::from_camera_pose(self.camera_pose(body_pose))
    }

    /// Projects a world point seen from the platform at `body_pose`.
    pub fn project_world(&self, body_pose: Pose3D, point: &Point3<f64>) -> Option<Point2<f64>> {
        self.project(&self.world_to_optical(body_pose).transform(point))
    }
}

/// Looks up the calibration of each camera on the platform.
pub trait CameraCalibration {
    fn camera(&self, index: CameraIndex) -> Option<CameraModel>;
}

impl CameraCalibration for BTreeMap<CameraIndex, CameraModel> {
    fn camera(&self, index: CameraIndex) -> Option<CameraModel> {
        self.get(&index).copied()
    }
}

impl CameraCalibration for Vec<CameraModel> {
    fn camera(&self, index: CameraIndex) -> Option<CameraModel> {
        self.get(index.0).copied()
    }
}

impl<C> CameraCalibration for &C
where
    C: CameraCalibration + ?Sized,
{
    fn camera(&self, index: CameraIndex) -> Option<CameraModel> {
        (**self).camera(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(
            CameraIntrinsics::identity()
                .focal(600.0)
                .principal_point(Point2::new(320.0, 240.0)),
        )
        .with_distortion(Distortion::from_opencv([0.08, -0.03, 0.0005, 0.0002, 0.0]))
        .with_robot_to_camera(Pose3D::from_translation_rpy(
            Vector3::new(0.2, 0.1, 0.5),
            0.0,
            -0.2,
            0.3,
        ))
    }

    #[test]
    fn normalize_inverts_projection() {
        let camera = camera();
        let optical = Point3::new(0.3, -0.2, 2.0);
        let pixel = camera.project(&optical).unwrap();
        let normalized = camera.normalize(pixel);
        assert_relative_eq!(normalized.x, 0.15, epsilon = 1e-9);
        assert_relative_eq!(normalized.y, -0.1, epsilon = 1e-9);
    }

    #[test]
    fn points_behind_are_not_projected() {
        assert!(camera().project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera().project(&Point3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn point_straight_ahead_hits_principal_point() {
        let camera = camera();
        let body = Pose3D::from_translation_rpy(Vector3::new(1.0, 2.0, 0.0), 0.0, 0.0, 0.5);
        let camera_pose = camera.camera_pose(body);
        let ahead = camera_pose.transform_point(&Point3::new(4.0, 0.0, 0.0));
        let pixel = camera.project_world(body, &ahead).unwrap();
        assert_relative_eq!(pixel, Point2::new(320.0, 240.0), epsilon = 1e-9);
        assert_relative_eq!(camera.body_pose(camera_pose).0, body.0, epsilon = 1e-12);
    }

    #[test]
    fn calibration_lookup() {
        let cameras = vec![camera()];
        assert!(cameras.camera(CameraIndex(0)).is_some());
        assert!(cameras.camera(CameraIndex(1)).is_none());
    }
}
