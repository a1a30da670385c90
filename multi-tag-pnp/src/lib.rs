//! This crate estimates the pose of a camera from detections of square fiducial landmarks whose
//! poses in the world are known.
//!
//! This problem is a version of ["Perspective-n-Point" (PnP)][pnp] where the points come in
//! groups of four coplanar corners. The solver works in three steps:
//!
//!  1. Every landmark the layout knows about gives a pose candidate from the homography between its
//!     face and its corners in the image, decomposed and projected onto SO(3).
//!  2. Each candidate is scored by the total reprojection error over all corners of all landmarks
//!     and the best one is kept.
//!  3. The best candidate is refined with Levenberg-Marquardt over all corners.
//!
//! Poses are returned in the canonical frame (X forward, Y left, Z up). See
//! [`sfm_core::convention`] for how the optical frame relates to it.
//!
//! [pnp]: https://en.wikipedia.org/wiki/Perspective-n-Point

mod error;
mod homography;
mod refine;

pub use error::*;
pub use homography::{decompose, landmark_to_optical, plane_homography};

use float_ord::FloatOrd;
use log::{debug, trace};
use sfm_core::convention::camera_from_optical;
use sfm_core::nalgebra::{IsometryMatrix3, Point2, Point3};
use sfm_core::{
    corner_offsets, LandmarkDetection, LandmarkId, LandmarkLayout, Pose3D, WorldToOptical,
};
use sfm_pinhole::CameraModel;
use std::collections::BTreeSet;

/// The fewest distinct landmarks the multi-landmark solve accepts.
pub const MIN_LANDMARKS: usize = 2;

/// A world point paired with the pixel it was observed at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub world: Point3<f64>,
    pub pixel: Point2<f64>,
}

/// Expands every detection of a landmark the layout knows into four corner correspondences.
///
/// Unknown landmarks are skipped. The ids that contributed are returned in ascending order.
pub fn correspondences<L>(
    detections: &[LandmarkDetection],
    layout: &L,
) -> (Vec<Correspondence>, Vec<LandmarkId>)
where
    L: LandmarkLayout + ?Sized,
{
    let mut ids = BTreeSet::new();
    let mut out = Vec::with_capacity(4 * detections.len());
    for detection in detections {
        if let Some(corners) = layout.landmark_corners(detection.id) {
            ids.insert(detection.id);
            out.extend(
                corners
                    .iter()
                    .zip(&detection.corners)
                    .map(|(&world, &pixel)| Correspondence { world, pixel }),
            );
        }
    }
    (out, ids.into_iter().collect())
}

/// A camera pose recovered from several landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiTagEstimate {
    /// Pose of the camera in the world with canonical axes.
    pub camera_pose: Pose3D,
    pub world_to_optical: WorldToOptical,
    /// Root mean square corner reprojection error in pixels.
    pub rms_error: f64,
    /// The landmarks that took part in the solve.
    pub landmarks: Vec<LandmarkId>,
}

/// The pose of one landmark relative to the camera that saw it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleTagEstimate {
    /// Pose of the landmark in the camera frame with canonical axes.
    pub camera_to_landmark: Pose3D,
    /// Root mean square corner reprojection error in pixels.
    pub rms_error: f64,
}

/// Solves for a camera pose from landmark corner detections.
///
/// This struct is marked as `#[non_exhaustive]` to allow the backwards-compatible addition of new fields.
#[derive(Copy, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct MultiTagSolver {
    /// Patience handed to Levenberg-Marquardt during refinement.
    pub patience: usize,
    /// Solutions with a larger root mean square reprojection error (in pixels) are rejected.
    pub max_rms_error: f64,
}

impl MultiTagSolver {
    /// Creates a solver with a patience of 100 and a 5 pixel error bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the [`MultiTagSolver::patience`].
    #[must_use]
    pub fn patience(self, patience: usize) -> Self {
        Self { patience, ..self }
    }

    /// Sets the [`MultiTagSolver::max_rms_error`].
    #[must_use]
    pub fn max_rms_error(self, max_rms_error: f64) -> Self {
        Self {
            max_rms_error,
            ..self
        }
    }

    /// Estimates the pose of the camera in the world from detections of at least
    /// [`MIN_LANDMARKS`] landmarks that `layout` knows about.
    pub fn solve<L>(
        &self,
        detections: &[LandmarkDetection],
        layout: &L,
        camera: Option<&CameraModel>,
    ) -> Result<MultiTagEstimate, PnpError>
    where
        L: LandmarkLayout + ?Sized,
    {
        let (matches, landmarks) = correspondences(detections, layout);
        let camera = match camera {
            Some(camera) if landmarks.len() >= MIN_LANDMARKS => camera,
            _ => {
                return Err(PnpError::InsufficientCorrespondences {
                    correspondences: matches.len(),
                    required: 4 * MIN_LANDMARKS,
                })
            }
        };

        let size = layout.landmark_size();
        let candidates = detections.iter().filter_map(|detection| {
            let landmark_pose = layout.landmark_pose(detection.id)?;
            let normalized = detection.corners.map(|pixel| camera.normalize(pixel));
            let optical_from_landmark = landmark_to_optical(&normalized, size)?;
            Some(optical_from_landmark * landmark_pose.inverse().isometry())
        });
        let initial = candidates
            .filter_map(|candidate| {
                let cost = total_squared_error(&candidate, &matches, camera)?;
                trace!("candidate cost {}", cost);
                Some((candidate, cost))
            })
            .min_by_key(|&(_, cost)| FloatOrd(cost))
            .map(|(candidate, _)| candidate)
            .ok_or(PerspectiveFailure::Degenerate)?;

        let pose = refine::refine(initial, &matches, camera, self.patience)?;
        let rms_error = self.check_error(&pose, &matches, camera)?;
        let world_to_optical = WorldToOptical(pose);
        debug!(
            "solved camera pose from {} landmarks with {:.3} px rms error",
            landmarks.len(),
            rms_error
        );
        Ok(MultiTagEstimate {
            camera_pose: world_to_optical.camera_pose(),
            world_to_optical,
            rms_error,
            landmarks,
        })
    }

    /// Estimates the pose of a single landmark of side `landmark_size` relative to the camera.
    ///
    /// A single planar square can be ambiguous under weak perspective; callers should prefer
    /// [`MultiTagSolver::solve`] whenever two or more landmarks are visible.
    pub fn solve_single(
        &self,
        detection: &LandmarkDetection,
        landmark_size: f64,
        camera: &CameraModel,
    ) -> Result<SingleTagEstimate, PnpError> {
        let normalized = detection.corners.map(|pixel| camera.normalize(pixel));
        let initial =
            landmark_to_optical(&normalized, landmark_size).ok_or(PerspectiveFailure::Degenerate)?;
        let matches: Vec<Correspondence> = corner_offsets(landmark_size)
            .iter()
            .zip(&detection.corners)
            .map(|(offset, &pixel)| Correspondence {
                world: Point3::from(*offset),
                pixel,
            })
            .collect();
        let pose = refine::refine(initial, &matches, camera, self.patience)?;
        let rms_error = self.check_error(&pose, &matches, camera)?;
        Ok(SingleTagEstimate {
            camera_to_landmark: camera_from_optical(pose),
            rms_error,
        })
    }

    fn check_error(
        &self,
        pose: &IsometryMatrix3<f64>,
        matches: &[Correspondence],
        camera: &CameraModel,
    ) -> Result<f64, PerspectiveFailure> {
        let rms = refine::rms_error(pose, matches, camera).ok_or(PerspectiveFailure::BehindCamera)?;
        if !rms.is_finite() {
            return Err(PerspectiveFailure::NonFinite);
        }
        if rms > self.max_rms_error {
            return Err(PerspectiveFailure::ReprojectionError {
                rms,
                max: self.max_rms_error,
            });
        }
        Ok(rms)
    }
}

impl Default for MultiTagSolver {
    fn default() -> Self {
        Self {
            patience: 100,
            max_rms_error: 5.0,
        }
    }
}

fn total_squared_error(
    world_to_optical: &IsometryMatrix3<f64>,
    matches: &[Correspondence],
    camera: &CameraModel,
) -> Option<f64> {
    matches.iter().try_fold(0.0, |sum, c| {
        let projected = camera.project(&(world_to_optical * c.world))?;
        Some(sum + (projected - c.pixel).norm_squared())
    })
}
