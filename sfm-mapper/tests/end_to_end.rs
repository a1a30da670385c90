use approx::assert_relative_eq;
use sfm_core::nalgebra::{Point2, Vector3};
use sfm_core::{
    landmark_corners, CameraIndex, FieldLayout, InputBatch, LandmarkDetection, LandmarkId, Pose3D,
    StateKey, Values, VariableKey,
};
use sfm_mapper::{
    DropReason, DroppedInput, EstimatorStatus, MapperError, MapperSettings, SfmMapper, SyncError,
};
use sfm_optimize::{
    GraphUpdate, IncrementalSolver, LmSmoother, SmootherSettings, SolverError, UpdateReport,
};
use sfm_pinhole::{CameraIntrinsics, CameraModel};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::rc::Rc;

const SIZE: f64 = 0.3;

fn camera() -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::identity()
            .focal(600.0)
            .principal_point(Point2::new(320.0, 240.0)),
    )
    .with_robot_to_camera(Pose3D::from_translation_rpy(
        Vector3::new(0.0, 0.0, 0.5),
        0.0,
        0.0,
        0.0,
    ))
}

fn cameras() -> BTreeMap<CameraIndex, CameraModel> {
    [(CameraIndex(0), camera())].into_iter().collect()
}

/// A landmark on a wall three meters ahead, facing back towards the origin.
fn wall(y: f64) -> Pose3D {
    Pose3D::from_translation_rpy(Vector3::new(3.0, y, 0.5), 0.0, 0.0, PI)
}

fn layout() -> FieldLayout {
    FieldLayout::new(SIZE)
        .with_landmark(1, wall(-0.5))
        .with_landmark(2, wall(0.5))
}

fn anchored() -> MapperSettings {
    MapperSettings {
        fixed_landmarks: vec![LandmarkId(1)],
        ..MapperSettings::default()
    }
}

fn detect(body: Pose3D, id: i32, landmark: Pose3D) -> LandmarkDetection {
    let camera = camera();
    let corners = landmark_corners(&landmark, SIZE).map(|corner| {
        camera
            .project_world(body, &corner)
            .expect("corner must be in front of the camera")
    });
    LandmarkDetection::new(id, corners)
}

fn forward(meters: f64) -> Pose3D {
    Pose3D::from_translation_rpy(Vector3::new(meters, 0.0, 0.0), 0.0, 0.0, 0.0)
}

fn truth() -> Pose3D {
    Pose3D::from_translation_rpy(Vector3::new(0.1, -0.2, 0.0), 0.0, 0.0, 0.1)
}

#[test]
fn anchor_sighting_locates_first_state() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    let batch = InputBatch::new()
        .with_odometry(0, Pose3D::identity())
        .with_keyframe(0, CameraIndex(0), vec![detect(truth(), 1, wall(-0.5))]);
    let output = mapper.optimize(&batch).unwrap();

    assert!(output.report.solved);
    assert!(output.report.dropped.is_empty());
    assert_eq!(output.report.new_states, 1);
    // A weak prior on the first state, the anchor prior and four corner projections.
    assert_eq!(output.report.new_factors, 6);
    assert_eq!(output.estimate.status, EstimatorStatus::Converged);
    assert!(output.estimate.has_vision);

    let pose = output.estimate.latest_pose().unwrap();
    assert_relative_eq!(pose.translation(), truth().translation(), epsilon = 1e-3);
    assert_relative_eq!(pose.rotation(), truth().rotation(), epsilon = 1e-3);
    assert_eq!(output.estimate.landmark(LandmarkId(1)), Some(wall(-0.5)));
}

#[test]
fn anchor_never_moves() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, Pose3D::identity())
                .with_keyframe(0, CameraIndex(0), vec![detect(truth(), 1, wall(-0.5))]),
        )
        .unwrap();

    // A detection that disagrees with the first one by a few pixels.
    let mut shifted = detect(truth() * forward(0.1), 1, wall(-0.5));
    for corner in &mut shifted.corners {
        corner.x += 3.0;
    }
    let output = mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(10, forward(0.1))
                .with_keyframe(10, CameraIndex(0), vec![shifted]),
        )
        .unwrap();
    assert_eq!(output.estimate.landmark(LandmarkId(1)), Some(wall(-0.5)));
    assert_eq!(mapper.layout().landmarks[&LandmarkId(1)], wall(-0.5));
}

#[test]
fn free_layout_landmark_is_corrected() {
    // The layout believes landmark 2 is 5 cm off from where it really is.
    let guess = wall(0.55);
    let layout = FieldLayout::new(SIZE)
        .with_landmark(1, wall(-0.5))
        .with_landmark(2, guess);
    let mut mapper = SfmMapper::new(anchored(), layout, cameras());
    let mut body = truth();
    for step in 0..3 {
        let delta = if step == 0 { Pose3D::identity() } else { forward(0.2) };
        body = body * delta;
        let batch = InputBatch::new()
            .with_odometry(step * 10, delta)
            .with_keyframe(
                step * 10,
                CameraIndex(0),
                vec![detect(body, 1, wall(-0.5)), detect(body, 2, wall(0.5))],
            );
        mapper.optimize(&batch).unwrap();
    }

    let estimate = mapper.estimate();
    let landmark = estimate.landmark(LandmarkId(2)).unwrap();
    assert!((landmark.translation() - wall(0.5).translation()).norm() < 0.01);
    assert_relative_eq!(
        estimate.latest_pose().unwrap().translation(),
        body.translation(),
        epsilon = 1e-2
    );
    assert_eq!(estimate.trajectory.len(), 3);
}

#[test]
fn odometry_alone_integrates_deltas() {
    let mut mapper = SfmMapper::new(MapperSettings::default(), layout(), cameras());
    let output = mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, forward(1.0))
                .with_odometry(1, forward(1.0))
                .with_odometry(2, forward(1.0)),
        )
        .unwrap();
    assert!(!output.estimate.has_vision);
    let xs: Vec<f64> = output
        .estimate
        .trajectory
        .iter()
        .map(|point| point.pose.translation().x)
        .collect();
    assert_eq!(xs.len(), 3);
    for (x, expected) in xs.into_iter().zip([1.0, 2.0, 3.0]) {
        assert_relative_eq!(x, expected, epsilon = 1e-6);
    }
}

#[test]
fn keyframes_use_nearest_state() {
    let mut mapper = SfmMapper::new(MapperSettings::default(), layout(), cameras());
    mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(10, forward(1.0))
                .with_odometry(20, forward(1.0))
                .with_odometry(35, forward(1.0)),
        )
        .unwrap();
    let trajectory = mapper.estimate().trajectory;
    assert_eq!(mapper.pose_at(22), Ok(trajectory[1].pose));
    assert_eq!(mapper.pose_at(15), Ok(trajectory[0].pose));
    assert_eq!(mapper.data().times().nearest(22), Ok((20, StateKey(1))));
}

#[test]
fn empty_map_has_no_pose() {
    let mapper = SfmMapper::new(MapperSettings::default(), layout(), cameras());
    assert_eq!(
        mapper.pose_at(0),
        Err(MapperError::Sync(SyncError::NoAssociableState))
    );
    assert_eq!(mapper.status(), EstimatorStatus::Empty);
}

#[test]
fn empty_batches_change_nothing() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, Pose3D::identity())
                .with_keyframe(0, CameraIndex(0), vec![detect(truth(), 1, wall(-0.5))]),
        )
        .unwrap();
    let before = mapper.estimate();
    let first = mapper.optimize(&InputBatch::new()).unwrap();
    let second = mapper.optimize(&InputBatch::new()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.estimate, before);
    assert!(!first.report.solved);
}

#[test]
fn states_are_never_forgotten() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    let mut seen = BTreeSet::new();
    let mut body = truth();
    for step in 0..4 {
        body = body * forward(0.1);
        let batch = InputBatch::new()
            .with_odometry(step, forward(0.1))
            .with_keyframe(step, CameraIndex(0), vec![detect(body, 1, wall(-0.5))]);
        let output = mapper.optimize(&batch).unwrap();
        let keys: BTreeSet<StateKey> = output
            .estimate
            .trajectory
            .iter()
            .map(|point| point.key)
            .collect();
        assert!(seen.is_subset(&keys));
        assert_eq!(keys.len(), seen.len() + 1);
        seen = keys;
    }
}

#[test]
fn keyframe_waits_for_odometry() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    let output = mapper
        .optimize(&InputBatch::new().with_keyframe(
            5,
            CameraIndex(0),
            vec![detect(truth(), 1, wall(-0.5))],
        ))
        .unwrap();
    assert_eq!(output.report.retained_keyframes, 1);
    assert!(!output.report.solved);
    assert_eq!(output.estimate.status, EstimatorStatus::Empty);

    let output = mapper
        .optimize(&InputBatch::new().with_odometry(0, Pose3D::identity()))
        .unwrap();
    assert_eq!(output.report.retained_keyframes, 0);
    assert!(output.estimate.has_vision);
    let pose = output.estimate.latest_pose().unwrap();
    assert_relative_eq!(pose.translation(), truth().translation(), epsilon = 1e-3);
}

#[test]
fn too_many_waiting_keyframes_drop_the_oldest() {
    let settings = MapperSettings {
        max_retained_keyframes: 2,
        ..anchored()
    };
    let mut mapper = SfmMapper::new(settings, layout(), cameras());
    let detection = detect(truth(), 1, wall(-0.5));
    let batch = (1..=3).fold(InputBatch::new(), |batch, t| {
        batch.with_keyframe(t, CameraIndex(0), vec![detection.clone()])
    });
    let output = mapper.optimize(&batch).unwrap();
    assert_eq!(output.report.retained_keyframes, 2);
    assert_eq!(
        output.report.dropped,
        vec![DroppedInput {
            timestamp: 1,
            reason: DropReason::RetainedOverflow,
        }]
    );
    assert_eq!(mapper.data().retained()[0].timestamp, 2);
}

#[test]
fn unmapped_landmark_is_reported() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    let stranger = Pose3D::from_translation_rpy(Vector3::new(3.0, 0.0, 1.0), 0.0, 0.0, PI);
    let output = mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, Pose3D::identity())
                .with_keyframe(
                    0,
                    CameraIndex(0),
                    vec![detect(truth(), 1, wall(-0.5)), detect(truth(), 99, stranger)],
                ),
        )
        .unwrap();
    assert_eq!(
        output.report.dropped,
        vec![DroppedInput {
            timestamp: 0,
            reason: DropReason::UnmappedLandmark(LandmarkId(99)),
        }]
    );
    assert_eq!(output.estimate.landmark(LandmarkId(99)), None);
    assert!(output.estimate.has_vision);
}

#[test]
fn unmapped_landmark_is_placed_when_allowed() {
    let settings = MapperSettings {
        allow_unmapped_landmarks: true,
        ..anchored()
    };
    let mut mapper = SfmMapper::new(settings, layout(), cameras());
    let stranger = Pose3D::from_translation_rpy(Vector3::new(3.0, 0.0, 1.0), 0.0, 0.0, PI);
    let output = mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, Pose3D::identity())
                .with_keyframe(
                    0,
                    CameraIndex(0),
                    vec![detect(truth(), 1, wall(-0.5)), detect(truth(), 9, stranger)],
                ),
        )
        .unwrap();
    assert!(output.report.dropped.is_empty());
    let placed = output.estimate.landmark(LandmarkId(9)).unwrap();
    assert_relative_eq!(placed.translation(), stranger.translation(), epsilon = 1e-3);
    assert!(mapper.layout().landmarks.contains_key(&LandmarkId(9)));
}

#[test]
fn out_of_order_odometry_is_reported() {
    let mut mapper = SfmMapper::new(MapperSettings::default(), layout(), cameras());
    let output = mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(10, forward(1.0))
                .with_odometry(5, forward(1.0))
                .with_odometry(10, forward(1.0)),
        )
        .unwrap();
    assert_eq!(output.estimate.trajectory.len(), 1);
    assert_eq!(output.report.dropped.len(), 2);
    assert!(output
        .report
        .dropped
        .iter()
        .all(|dropped| dropped.reason == DropReason::OutOfOrderOdometry));
}

#[test]
fn unknown_camera_is_reported() {
    let mut mapper = SfmMapper::new(anchored(), layout(), cameras());
    let output = mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, Pose3D::identity())
                .with_keyframe(0, CameraIndex(3), vec![detect(truth(), 1, wall(-0.5))]),
        )
        .unwrap();
    assert_eq!(
        output.report.dropped,
        vec![DroppedInput {
            timestamp: 0,
            reason: DropReason::UnknownCamera(CameraIndex(3)),
        }]
    );
    assert!(!output.estimate.has_vision);
}

/// An [`LmSmoother`] that can be told to reject updates.
struct FlakySolver {
    inner: LmSmoother,
    fail: Rc<Cell<bool>>,
}

impl IncrementalSolver for FlakySolver {
    fn update(&mut self, update: GraphUpdate) -> Result<UpdateReport, SolverError> {
        if self.fail.get() {
            return Err(SolverError::NotConverged("forced failure".to_string()));
        }
        self.inner.update(update)
    }

    fn value(&self, key: VariableKey) -> Option<Pose3D> {
        self.inner.value(key)
    }

    fn values(&self) -> Values {
        self.inner.values()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[test]
fn failed_solve_keeps_last_good_state() {
    let fail = Rc::new(Cell::new(false));
    let solver = FlakySolver {
        inner: LmSmoother::new(SmootherSettings::default()),
        fail: fail.clone(),
    };
    let mut mapper = SfmMapper::with_solver(anchored(), layout(), cameras(), solver);
    mapper
        .optimize(
            &InputBatch::new()
                .with_odometry(0, Pose3D::identity())
                .with_keyframe(0, CameraIndex(0), vec![detect(truth(), 1, wall(-0.5))]),
        )
        .unwrap();
    let before = mapper.estimate();

    let next = InputBatch::new()
        .with_odometry(10, forward(0.1))
        .with_keyframe(
            10,
            CameraIndex(0),
            vec![detect(truth() * forward(0.1), 1, wall(-0.5))],
        );
    fail.set(true);
    assert!(matches!(
        mapper.optimize(&next),
        Err(MapperError::SolverDivergence(SolverError::NotConverged(_)))
    ));
    assert_eq!(mapper.estimate(), before);
    assert_eq!(mapper.data().times().len(), 1);

    fail.set(false);
    let output = mapper.optimize(&next).unwrap();
    assert_eq!(output.estimate.trajectory.len(), 2);
    assert_eq!(output.estimate.trajectory[1].key, StateKey(1));
}

#[test]
fn failed_first_solve_reports_initialized() {
    let fail = Rc::new(Cell::new(true));
    let solver = FlakySolver {
        inner: LmSmoother::new(SmootherSettings::default()),
        fail: fail.clone(),
    };
    let mut mapper = SfmMapper::with_solver(anchored(), layout(), cameras(), solver);
    let first = InputBatch::new()
        .with_odometry(0, Pose3D::identity())
        .with_keyframe(0, CameraIndex(0), vec![detect(truth(), 1, wall(-0.5))]);
    assert!(mapper.optimize(&first).is_err());
    assert_eq!(mapper.status(), EstimatorStatus::Initialized);
    assert!(mapper.estimate().trajectory.is_empty());

    fail.set(false);
    let output = mapper.optimize(&first).unwrap();
    assert_eq!(output.estimate.status, EstimatorStatus::Converged);
    assert_eq!(output.estimate.trajectory[0].key, StateKey(0));
}

