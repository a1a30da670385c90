use approx::assert_relative_eq;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use sfm_core::nalgebra::{Point2, Vector3};
use sfm_core::{corner_offsets, LandmarkId, Pose3D, StateKey, VariableKey};
use sfm_optimize::{
    Factor, GraphUpdate, IncrementalSolver, LmSmoother, PoseNoise, SmootherSettings,
};
use sfm_pinhole::{CameraIntrinsics, CameraModel};
use std::f64::consts::PI;

const SIZE: f64 = 0.1524;

fn camera() -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::identity()
            .focal(600.0)
            .principal_point(Point2::new(320.0, 240.0)),
    )
    .with_robot_to_camera(Pose3D::from_translation_rpy(
        Vector3::new(0.2, 0.0, 0.3),
        0.0,
        0.0,
        0.0,
    ))
}

fn landmark(y: f64) -> Pose3D {
    Pose3D::from_translation_rpy(Vector3::new(3.0, y, 0.5), 0.0, 0.0, PI)
}

fn observe(update: &mut GraphUpdate, state: StateKey, truth: Pose3D, id: i32, pose: Pose3D) {
    let camera = camera();
    for offset in corner_offsets(SIZE) {
        let world = pose.transform_point(&offset.into());
        let pixel = camera.project_world(truth, &world).unwrap();
        update.add_factor(Factor::projection(
            state,
            LandmarkId(id),
            offset,
            camera,
            pixel,
            1.0,
        ));
    }
}

#[test]
fn fixed_landmarks_locate_state() {
    let mut rng = SmallRng::seed_from_u64(0);
    for _ in 0..5 {
        let truth = Pose3D::from_translation_rpy(
            Vector3::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5), 0.0),
            0.0,
            0.0,
            rng.gen_range(-0.2..0.2),
        );
        let mut smoother = LmSmoother::new(SmootherSettings::default());
        let mut update = GraphUpdate::new();
        for (id, y) in [(1, -0.6), (2, 0.6)] {
            update.insert_value(LandmarkId(id), landmark(y));
            update.fix(LandmarkId(id));
            observe(&mut update, StateKey(0), truth, id, landmark(y));
        }
        // Odometry-like seed that is off by a few centimeters and degrees.
        let seed = truth
            * Pose3D::from_translation_rpy(Vector3::new(0.05, -0.04, 0.0), 0.0, 0.0, 0.03);
        update.insert_value(StateKey(0), seed);
        update.add_factor(Factor::prior(StateKey(0), seed, PoseNoise::isotropic(100.0)));
        smoother.update(update).unwrap();

        let estimate = smoother.value(StateKey(0).into()).unwrap();
        assert_relative_eq!(estimate.translation(), truth.translation(), epsilon = 1e-4);
        assert_relative_eq!(estimate.rotation(), truth.rotation(), epsilon = 1e-4);
        assert_eq!(
            smoother.value(VariableKey::from(LandmarkId(1))),
            Some(landmark(-0.6))
        );
    }
}

#[test]
fn free_landmark_is_refined() {
    let mut smoother = LmSmoother::new(SmootherSettings::default());
    let truth = Pose3D::identity();
    let mut update = GraphUpdate::new();
    update.insert_value(StateKey(0), truth);
    update.fix(StateKey(0));
    update.insert_value(LandmarkId(1), landmark(-0.6));
    update.fix(LandmarkId(1));
    observe(&mut update, StateKey(0), truth, 1, landmark(-0.6));
    // Landmark 2 starts 10 cm away from where it really is.
    let guess = landmark(0.6)
        * Pose3D::from_translation_rpy(Vector3::new(0.0, 0.1, 0.0), 0.0, 0.0, 0.0);
    update.insert_value(LandmarkId(2), guess);
    observe(&mut update, StateKey(0), truth, 2, landmark(0.6));
    let report = smoother.update(update).unwrap();
    assert_eq!(report.variables, 1);
    let estimate = smoother.value(LandmarkId(2).into()).unwrap();
    assert_relative_eq!(
        estimate.translation(),
        landmark(0.6).translation(),
        epsilon = 1e-4
    );
    assert!(report.final_error < report.initial_error);
}
