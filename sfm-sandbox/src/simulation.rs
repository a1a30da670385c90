//! A platform driving in a circle inside a ring of landmarks.

use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::nalgebra::{Point2, Vector2, Vector3};
use sfm_core::{
    CameraIndex, FieldLayout, InputBatch, LandmarkDetection, LandmarkLayout, Pose3D, Timestamp,
};
use sfm_pinhole::CameraModel;
use std::f64::consts::PI;

/// Landmarks evenly spread on a circle of `radius`, all facing its center.
pub fn ring_layout(count: usize, radius: f64, height: f64, size: f64) -> FieldLayout {
    let mut layout = FieldLayout::new(size);
    for ix in 0..count {
        let angle = 2.0 * PI * ix as f64 / count as f64;
        layout.insert(
            ix as i32 + 1,
            Pose3D::from_translation_rpy(
                Vector3::new(radius * angle.cos(), radius * angle.sin(), height),
                0.0,
                0.0,
                angle + PI,
            ),
        );
    }
    layout
}

pub struct Simulation {
    pub layout: FieldLayout,
    pub camera: CameraModel,
    /// Width and height of the image in pixels.
    pub resolution: Vector2<f64>,
    /// Radius of the driven circle.
    pub radius: f64,
    /// Angle driven per step.
    pub step_angle: f64,
    /// Every odometry component is perturbed uniformly by up to this much per step.
    pub odometry_noise: f64,
    /// Every corner is perturbed uniformly by up to this many pixels.
    pub pixel_noise: f64,
    /// Microseconds between steps.
    pub period: Timestamp,
    /// Only every this many steps is the camera looked at.
    pub keyframe_interval: usize,
    angle: f64,
    step: usize,
    rng: Xoshiro256PlusPlus,
}

impl Simulation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: FieldLayout,
        camera: CameraModel,
        resolution: Vector2<f64>,
        radius: f64,
        step_angle: f64,
        odometry_noise: f64,
        pixel_noise: f64,
        rng: Xoshiro256PlusPlus,
    ) -> Self {
        Self {
            layout,
            camera,
            resolution,
            radius,
            step_angle,
            odometry_noise,
            pixel_noise,
            period: 20_000,
            keyframe_interval: 1,
            angle: 0.0,
            step: 0,
            rng,
        }
    }

    fn pose_at(&self, angle: f64) -> Pose3D {
        Pose3D::from_translation_rpy(
            Vector3::new(self.radius * angle.cos(), self.radius * angle.sin(), 0.0),
            0.0,
            0.0,
            angle + PI / 2.0,
        )
    }

    /// The true platform pose.
    pub fn pose(&self) -> Pose3D {
        self.pose_at(self.angle)
    }

    /// Moves the platform one step and returns what its sensors saw on the way.
    ///
    /// The first step does not move and reports an identity delta.
    pub fn step(&mut self) -> InputBatch {
        let timestamp = self.step as Timestamp * self.period;
        let keyframe = self.step % self.keyframe_interval.max(1) == 0;
        let before = self.pose();
        if self.step > 0 {
            self.angle += self.step_angle;
        }
        self.step += 1;
        let after = self.pose();

        let delta = before.inverse() * after;
        let noise = self.odometry_noise;
        let mut jitter = || self.rng.gen_range(-noise..=noise);
        let error = Pose3D::from_translation_rpy(
            Vector3::new(jitter(), jitter(), 0.0),
            0.0,
            0.0,
            jitter(),
        );
        let mut batch = InputBatch::new().with_odometry(timestamp, delta * error);

        if !keyframe {
            return batch;
        }
        let detections = self.detect(after);
        if !detections.is_empty() {
            batch = batch.with_keyframe(timestamp, CameraIndex(0), detections);
        }
        batch
    }

    fn detect(&mut self, body: Pose3D) -> Vec<LandmarkDetection> {
        let camera_position = self.camera.camera_pose(body).translation();
        let mut detections = vec![];
        for (id, pose) in self.layout.iter() {
            let normal = pose.rotation() * Vector3::x();
            if normal.dot(&(camera_position - pose.translation())) <= 0.0 {
                continue;
            }
            let projected = match self.layout.landmark_corners(id) {
                Some(corners) => corners.map(|corner| self.camera.project_world(body, &corner)),
                None => continue,
            };
            let mut corners = [Point2::origin(); 4];
            let mut visible = true;
            for (corner, pixel) in corners.iter_mut().zip(projected) {
                match pixel {
                    Some(pixel)
                        if (0.0..self.resolution.x).contains(&pixel.x)
                            && (0.0..self.resolution.y).contains(&pixel.y) =>
                    {
                        *corner = pixel;
                    }
                    _ => visible = false,
                }
            }
            if !visible {
                continue;
            }
            if self.pixel_noise > 0.0 {
                for corner in &mut corners {
                    corner.x += self.rng.gen_range(-self.pixel_noise..=self.pixel_noise);
                    corner.y += self.rng.gen_range(-self.pixel_noise..=self.pixel_noise);
                }
            }
            detections.push(LandmarkDetection::new(id, corners));
        }
        detections
    }
}
