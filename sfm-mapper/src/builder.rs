//! Turns one batch of measurements into a [`GraphUpdate`] without touching the estimator.

use crate::{time_sync, DropReason, DroppedInput, MapperSettings, TimeKeyMap};
use log::{debug, info, warn};
use multi_tag_pnp::{MultiTagSolver, MIN_LANDMARKS};
use sfm_core::{
    corner_offsets, Keyframe, LandmarkDetection, LandmarkId, LandmarkLayout, OdometryDelta, Pose3D,
    StateKey, Timestamp, VariableKey,
};
use sfm_optimize::{Factor, GraphUpdate, IncrementalSolver, PoseNoise};
use sfm_pinhole::{CameraCalibration, CameraModel};
use std::collections::BTreeSet;

/// Everything staged by one batch.
#[derive(Debug, Clone, Default)]
pub struct Round {
    pub update: GraphUpdate,
    /// Timestamps of the states created by this round.
    pub times: TimeKeyMap,
    /// The newest state and its seed, which may have been committed by an earlier round.
    pub latest: Option<(StateKey, Pose3D)>,
    pub next_key: StateKey,
    /// Keyframes that found no state and must wait for odometry.
    pub retained: Vec<Keyframe>,
    pub dropped: Vec<DroppedInput>,
    /// Keyframes that contributed at least one projection factor.
    pub accepted_keyframes: usize,
    pub new_states: usize,
    vision_seeded: BTreeSet<StateKey>,
}

/// Reads the committed estimate and stages one round on top of it.
pub struct GraphBuilder<'a, L: ?Sized, C: ?Sized, S> {
    settings: &'a MapperSettings,
    layout: &'a L,
    cameras: &'a C,
    solver: &'a S,
    times: &'a TimeKeyMap,
    pnp: MultiTagSolver,
    round: Round,
}

impl<'a, L, C, S> GraphBuilder<'a, L, C, S>
where
    L: LandmarkLayout + ?Sized,
    C: CameraCalibration + ?Sized,
    S: IncrementalSolver,
{
    pub fn new(
        settings: &'a MapperSettings,
        layout: &'a L,
        cameras: &'a C,
        solver: &'a S,
        times: &'a TimeKeyMap,
        next_key: StateKey,
    ) -> Self {
        let latest = times
            .latest()
            .and_then(|(_, key)| solver.value(key.into()).map(|pose| (key, pose)));
        Self {
            settings,
            layout,
            cameras,
            solver,
            times,
            pnp: MultiTagSolver::new()
                .patience(settings.pnp_patience)
                .max_rms_error(settings.pnp_max_rms),
            round: Round {
                latest,
                next_key,
                ..Round::default()
            },
        }
    }

    /// Stages all odometry of the batch first, then the keyframes that were waiting and finally
    /// the keyframes of the batch.
    pub fn build(
        mut self,
        odometry: &[OdometryDelta],
        retained: &[Keyframe],
        keyframes: &[Keyframe],
    ) -> Round {
        for delta in odometry {
            self.add_odometry(delta);
        }
        for keyframe in retained.iter().chain(keyframes) {
            self.add_keyframe(keyframe);
        }
        self.trim_retained();
        self.round
    }

    fn drop_input(&mut self, timestamp: Timestamp, reason: DropReason) {
        self.round.dropped.push(DroppedInput { timestamp, reason });
    }

    fn latest_timestamp(&self) -> Option<Timestamp> {
        self.round
            .times
            .latest()
            .or_else(|| self.times.latest())
            .map(|(timestamp, _)| timestamp)
    }

    fn staged_or_committed(&self, key: VariableKey) -> Option<Pose3D> {
        self.round
            .update
            .value(key)
            .or_else(|| self.solver.value(key))
    }

    fn add_odometry(&mut self, odometry: &OdometryDelta) {
        if let Some(latest) = self.latest_timestamp() {
            if odometry.timestamp <= latest {
                warn!(
                    "dropping odometry at {} since the latest state is at {}",
                    odometry.timestamp, latest
                );
                self.drop_input(odometry.timestamp, DropReason::OutOfOrderOdometry);
                return;
            }
        }

        let key = self.round.next_key;
        self.round.next_key = key.next();
        let seed = match self.round.latest {
            Some((previous, pose)) => {
                self.round.update.add_factor(Factor::between(
                    previous,
                    key,
                    odometry.delta,
                    PoseNoise::from_sigmas(self.settings.odometry_sigmas),
                ));
                pose * odometry.delta
            }
            None => {
                let seed = self.settings.initial_pose * odometry.delta;
                self.round.update.add_factor(Factor::prior(
                    key,
                    seed,
                    PoseNoise::from_sigmas(self.settings.initial_state_sigmas),
                ));
                seed
            }
        };
        self.round.update.insert_value(key, seed);
        self.round.times.insert(odometry.timestamp, key);
        self.round.latest = Some((key, seed));
        self.round.new_states += 1;
    }

    fn add_keyframe(&mut self, keyframe: &Keyframe) {
        let state =
            match time_sync::nearest_state(&[self.times, &self.round.times], keyframe.timestamp) {
                Ok((_, state)) => state,
                Err(_) => {
                    debug!("keyframe at {} waits for odometry", keyframe.timestamp);
                    self.round.retained.push(keyframe.clone());
                    return;
                }
            };
        let camera = match self.cameras.camera(keyframe.camera) {
            Some(camera) => camera,
            None => {
                warn!(
                    "dropping keyframe at {} from uncalibrated camera {}",
                    keyframe.timestamp, keyframe.camera
                );
                self.drop_input(keyframe.timestamp, DropReason::UnknownCamera(keyframe.camera));
                return;
            }
        };

        // Only states of this round are re-seeded. Committed states already have an estimate.
        let staged = self.round.update.values.contains_key(&state.into());
        if self.settings.vision_seeding && staged && !self.round.vision_seeded.contains(&state) {
            self.seed_from_vision(state, &camera, &keyframe.detections);
        }

        let corners = corner_offsets(self.layout.landmark_size());
        let mut accepted = false;
        for detection in &keyframe.detections {
            if !self.ensure_landmark(state, &camera, detection, keyframe.timestamp) {
                continue;
            }
            for (offset, &pixel) in corners.iter().zip(&detection.corners) {
                self.round.update.add_factor(Factor::projection(
                    state,
                    detection.id,
                    *offset,
                    camera,
                    pixel,
                    self.settings.pixel_sigma,
                ));
            }
            accepted = true;
        }
        if accepted {
            self.round.accepted_keyframes += 1;
        }
    }

    /// Makes sure the landmark has a value, returning `false` if it can not get one.
    fn ensure_landmark(
        &mut self,
        state: StateKey,
        camera: &CameraModel,
        detection: &LandmarkDetection,
        timestamp: Timestamp,
    ) -> bool {
        let key = VariableKey::from(detection.id);
        if self.round.update.values.contains_key(&key) || self.solver.contains(key) {
            return true;
        }

        if let Some(pose) = self.layout.landmark_pose(detection.id) {
            self.round.update.insert_value(key, pose);
            if self.settings.fixed_landmarks.contains(&detection.id) {
                info!("anchoring landmark {}", detection.id);
                self.round.update.add_factor(Factor::prior(
                    key,
                    pose,
                    PoseNoise::isotropic(self.settings.anchor_sigma),
                ));
                self.round.update.fix(key);
            } else if let Some(sigmas) = self.settings.layout_prior_sigmas {
                self.round.update.add_factor(Factor::prior(
                    key,
                    pose,
                    PoseNoise::from_sigmas(sigmas),
                ));
            }
            return true;
        }

        if !self.settings.allow_unmapped_landmarks {
            warn!(
                "landmark {} seen at {} is not in the layout",
                detection.id, timestamp
            );
            self.drop_input(timestamp, DropReason::UnmappedLandmark(detection.id));
            return false;
        }

        let body = match self.staged_or_committed(state.into()) {
            Some(body) => body,
            None => return false,
        };
        match self
            .pnp
            .solve_single(detection, self.layout.landmark_size(), camera)
        {
            Ok(estimate) => {
                let pose = camera.camera_pose(body) * estimate.camera_to_landmark;
                info!(
                    "placed unmapped landmark {} at {:?}",
                    detection.id,
                    pose.translation()
                );
                self.round.update.insert_value(key, pose);
                true
            }
            Err(e) => {
                warn!("could not place landmark {}: {}", detection.id, e);
                self.drop_input(timestamp, DropReason::BackProjectionFailed(detection.id));
                false
            }
        }
    }

    /// Replaces the odometry seed of `state` with a pose recovered from the landmarks in view.
    fn seed_from_vision(
        &mut self,
        state: StateKey,
        camera: &CameraModel,
        detections: &[LandmarkDetection],
    ) {
        let view = EstimatedLayout {
            layout: self.layout,
            staged: &self.round.update,
            solver: self.solver,
        };
        let known: BTreeSet<LandmarkId> = detections
            .iter()
            .map(|detection| detection.id)
            .filter(|&id| view.landmark_pose(id).is_some())
            .collect();

        let camera_pose = if known.len() >= MIN_LANDMARKS {
            self.pnp
                .solve(detections, &view, Some(camera))
                .map(|estimate| estimate.camera_pose)
        } else {
            let single = detections.iter().find_map(|detection| {
                view.landmark_pose(detection.id)
                    .map(|landmark| (detection, landmark))
            });
            match single {
                Some((detection, landmark)) => self
                    .pnp
                    .solve_single(detection, view.landmark_size(), camera)
                    .map(|estimate| landmark * estimate.camera_to_landmark.inverse()),
                None => return,
            }
        };

        match camera_pose {
            Ok(camera_pose) => self.apply_seed(state, camera.body_pose(camera_pose)),
            Err(e) => debug!("keeping odometry seed of {}: {}", state, e),
        }
    }

    /// Moves `state` to `body` and carries every later state of this round along rigidly.
    fn apply_seed(&mut self, state: StateKey, body: Pose3D) {
        let old = match self.round.update.value(state.into()) {
            Some(old) => old,
            None => return,
        };
        let correction = body * old.inverse();
        for (key, value) in self.round.update.values.range_mut(VariableKey::State(state)..) {
            if key.state().is_some() {
                *value = correction * *value;
            }
        }
        if let Some((latest, pose)) = &mut self.round.latest {
            if *latest >= state {
                *pose = correction * *pose;
            }
        }
        self.round.vision_seeded.insert(state);
        debug!("seeded {} from vision at {:?}", state, body.translation());
    }

    fn trim_retained(&mut self) {
        let max = self.settings.max_retained_keyframes;
        if self.round.retained.len() > max {
            let overflow = self.round.retained.len() - max;
            for keyframe in self.round.retained.drain(..overflow) {
                warn!("discarding keyframe at {} waiting for odometry", keyframe.timestamp);
                self.round.dropped.push(DroppedInput {
                    timestamp: keyframe.timestamp,
                    reason: DropReason::RetainedOverflow,
                });
            }
        }
    }
}

/// Landmark poses as currently believed: staged values first, then the estimate, then the layout.
struct EstimatedLayout<'b, L: ?Sized, S> {
    layout: &'b L,
    staged: &'b GraphUpdate,
    solver: &'b S,
}

impl<'b, L, S> LandmarkLayout for EstimatedLayout<'b, L, S>
where
    L: LandmarkLayout + ?Sized,
    S: IncrementalSolver,
{
    fn landmark_pose(&self, id: LandmarkId) -> Option<Pose3D> {
        let key = VariableKey::from(id);
        self.staged
            .value(key)
            .or_else(|| self.solver.value(key))
            .or_else(|| self.layout.landmark_pose(id))
    }

    fn landmark_size(&self) -> f64 {
        self.layout.landmark_size()
    }
}
