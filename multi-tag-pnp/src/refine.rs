use crate::{Correspondence, PerspectiveFailure};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use sfm_core::nalgebra::{
    dimension::{Const, Dynamic, U1, U6},
    storage::Owned,
    DVector, IsometryMatrix3, OMatrix, VecStorage, Vector6,
};
use sfm_core::Se3TangentSpace;
use sfm_pinhole::{CameraModel, MIN_DEPTH};

/// Step used for the central difference Jacobian.
const JACOBIAN_STEP: f64 = 1e-6;

/// Pixel reprojection error of a world-to-optical transform perturbed in its own frame.
#[derive(Clone)]
pub(crate) struct ReprojectionProblem<'a> {
    base: IsometryMatrix3<f64>,
    delta: Vector6<f64>,
    correspondences: &'a [Correspondence],
    camera: &'a CameraModel,
}

impl<'a> ReprojectionProblem<'a> {
    pub(crate) fn new(
        base: IsometryMatrix3<f64>,
        correspondences: &'a [Correspondence],
        camera: &'a CameraModel,
    ) -> Self {
        Self {
            base,
            delta: Vector6::zeros(),
            correspondences,
            camera,
        }
    }

    fn pose_at(&self, delta: &Vector6<f64>) -> IsometryMatrix3<f64> {
        self.base * Se3TangentSpace::from_vector(delta).isometry()
    }

    /// The current world-to-optical transform.
    pub(crate) fn pose(&self) -> IsometryMatrix3<f64> {
        self.pose_at(&self.delta)
    }

    fn residuals_at(&self, delta: &Vector6<f64>) -> DVector<f64> {
        let pose = self.pose_at(delta);
        DVector::from_iterator(
            2 * self.correspondences.len(),
            self.correspondences.iter().flat_map(|c| {
                let projected = self
                    .camera
                    .project_clamped(&(pose * c.world), MIN_DEPTH);
                let error = projected - c.pixel;
                [error.x, error.y]
            }),
        )
    }
}

impl<'a> LeastSquaresProblem<f64, Dynamic, U6> for ReprojectionProblem<'a> {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = Owned<f64, Dynamic, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.delta = *x;
    }

    fn params(&self) -> Vector6<f64> {
        self.delta
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.delta))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U6>> {
        let rows = Dynamic::new(2 * self.correspondences.len());
        let mut jacobian = OMatrix::<f64, Dynamic, U6>::zeros_generic(rows, Const::<6>);
        for j in 0..6 {
            let mut forward = self.delta;
            let mut backward = self.delta;
            forward[j] += JACOBIAN_STEP;
            backward[j] -= JACOBIAN_STEP;
            let column = (self.residuals_at(&forward) - self.residuals_at(&backward))
                / (2.0 * JACOBIAN_STEP);
            jacobian.set_column(j, &column);
        }
        Some(jacobian)
    }
}

/// Whether a Levenberg-Marquardt run ended at a usable minimum.
///
/// Running out of tolerance headroom still leaves the best point found, so it is accepted here and
/// the caller's finiteness and error checks decide.
pub(crate) fn terminated_usefully(termination: &TerminationReason) -> bool {
    termination.was_successful() || matches!(termination, TerminationReason::NoImprovementPossible(_))
}

/// Root mean square pixel distance between the observed and projected corners.
pub(crate) fn rms_error(
    pose: &IsometryMatrix3<f64>,
    correspondences: &[Correspondence],
    camera: &CameraModel,
) -> Option<f64> {
    let mut sum = 0.0;
    for c in correspondences {
        let projected = camera.project(&(pose * c.world))?;
        sum += (projected - c.pixel).norm_squared();
    }
    Some((sum / correspondences.len() as f64).sqrt())
}

/// Refines a world-to-optical transform against every correspondence.
pub(crate) fn refine(
    initial: IsometryMatrix3<f64>,
    correspondences: &[Correspondence],
    camera: &CameraModel,
    patience: usize,
) -> Result<IsometryMatrix3<f64>, PerspectiveFailure> {
    let problem = ReprojectionProblem::new(initial, correspondences, camera);
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(patience)
        .minimize(problem);
    if !terminated_usefully(&report.termination) {
        log::debug!(
            "refinement ended with {:?} after {} evaluations",
            report.termination,
            report.number_of_evaluations
        );
        return Err(PerspectiveFailure::NotConverged);
    }
    let pose = problem.pose();
    let finite = pose.translation.vector.iter().all(|n| n.is_finite())
        && pose.rotation.matrix().iter().all(|n| n.is_finite());
    if !finite {
        return Err(PerspectiveFailure::NonFinite);
    }
    if correspondences
        .iter()
        .any(|c| !((pose * c.world).z > MIN_DEPTH))
    {
        return Err(PerspectiveFailure::BehindCamera);
    }
    Ok(pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::nalgebra::{Point2, Point3, Translation3, UnitQuaternion, Vector3};
    use sfm_pinhole::CameraIntrinsics;

    fn camera() -> CameraModel {
        CameraModel::new(
            CameraIntrinsics::identity()
                .focal(500.0)
                .principal_point(Point2::new(320.0, 240.0)),
        )
    }

    fn correspondences(truth: &IsometryMatrix3<f64>, camera: &CameraModel) -> Vec<Correspondence> {
        [(-0.2, -0.2), (0.2, -0.2), (0.2, 0.2), (-0.2, 0.2), (0.0, 0.1)]
            .iter()
            .map(|&(x, y)| {
                let world = Point3::new(x, y, 0.1 * x);
                let pixel = camera.project(&(truth * world)).unwrap();
                Correspondence { world, pixel }
            })
            .collect()
    }

    #[test]
    fn jacobian_has_a_row_pair_per_correspondence() {
        let camera = camera();
        let truth = IsometryMatrix3::from_parts(
            Translation3::new(0.05, -0.02, 2.0),
            UnitQuaternion::from_euler_angles(0.1, -0.05, 0.2).to_rotation_matrix(),
        );
        let correspondences = correspondences(&truth, &camera);
        let problem = ReprojectionProblem::new(truth, &correspondences, &camera);
        let jacobian = problem.jacobian().unwrap();
        assert_eq!(jacobian.shape(), (10, 6));
        assert!(jacobian.iter().all(|n| n.is_finite()));
        assert!(problem.residuals().unwrap().norm() < 1e-9);
    }

    #[test]
    fn refine_recovers_perturbed_pose() {
        let camera = camera();
        let truth = IsometryMatrix3::from_parts(
            Translation3::new(0.05, -0.02, 2.0),
            UnitQuaternion::from_euler_angles(0.1, -0.05, 0.2).to_rotation_matrix(),
        );
        let correspondences = correspondences(&truth, &camera);
        let guess = IsometryMatrix3::from_parts(
            Translation3::from(truth.translation.vector + Vector3::new(0.03, 0.02, -0.1)),
            truth.rotation * UnitQuaternion::from_euler_angles(0.02, 0.0, -0.03).to_rotation_matrix(),
        );
        let refined = refine(guess, &correspondences, &camera, 100).unwrap();
        assert!((refined.translation.vector - truth.translation.vector).norm() < 1e-6);
        assert!(refined.rotation.angle_to(&truth.rotation) < 1e-6);
        assert!(rms_error(&refined, &correspondences, &camera).unwrap() < 1e-6);
    }
}
