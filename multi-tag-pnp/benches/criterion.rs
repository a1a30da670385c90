use criterion::{black_box, criterion_group, criterion_main, Criterion};
use multi_tag_pnp::MultiTagSolver;
use sfm_core::nalgebra::{Point2, Vector3};
use sfm_core::{FieldLayout, LandmarkDetection, LandmarkLayout, Pose3D};
use sfm_pinhole::{CameraIntrinsics, CameraModel};
use std::f64::consts::PI;

fn scene() -> (FieldLayout, CameraModel, Vec<LandmarkDetection>) {
    let layout = (0..4).fold(FieldLayout::default(), |layout, ix| {
        layout.with_landmark(
            ix,
            Pose3D::from_translation_rpy(
                Vector3::new(4.0, ix as f64 - 1.5, 1.0),
                0.0,
                0.0,
                PI,
            ),
        )
    });
    let camera = CameraModel::new(
        CameraIntrinsics::identity()
            .focal(700.0)
            .principal_point(Point2::new(640.0, 360.0)),
    );
    let pose = Pose3D::from_translation_rpy(Vector3::new(0.2, -0.1, 0.9), 0.0, 0.02, 0.1);
    let detections = layout
        .iter()
        .filter_map(|(id, _)| {
            let corners = layout.landmark_corners(id)?;
            let pixels = [
                camera.project_world(pose, &corners[0])?,
                camera.project_world(pose, &corners[1])?,
                camera.project_world(pose, &corners[2])?,
                camera.project_world(pose, &corners[3])?,
            ];
            Some(LandmarkDetection::new(id, pixels))
        })
        .collect();
    (layout, camera, detections)
}

fn solve(c: &mut Criterion) {
    let (layout, camera, detections) = scene();
    let solver = MultiTagSolver::new();
    c.bench_function("solve_four_tags", |b| {
        b.iter(|| solver.solve(black_box(&detections), &layout, Some(&camera)))
    });
    c.bench_function("solve_single_tag", |b| {
        b.iter(|| solver.solve_single(black_box(&detections[0]), layout.landmark_size, &camera))
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = solve
);
criterion_main!(benches);
