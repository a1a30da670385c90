//! Incremental landmark mapping from platform odometry and fiducial detections.
//!
//! Every call to [`SfmMapper::optimize`] stages one batch of measurements: odometry deltas become
//! new platform states chained by between factors, and keyframes are associated with the state
//! nearest in time and contribute one projection factor per detected landmark corner. The staged
//! round is then handed to an [`IncrementalSolver`]. Nothing is committed unless the solve
//! succeeds, so a failed round leaves the mapper exactly as it was.
//!
//! The world frame is defined by the anchor landmarks listed in
//! [`MapperSettings::fixed_landmarks`], which are held at their layout pose.

mod builder;
mod error;
mod estimate;
mod estimator;
mod settings;
mod time_sync;

pub use builder::*;
pub use error::*;
pub use estimate::*;
pub use estimator::*;
pub use settings::*;
pub use time_sync::*;

use log::*;
use sfm_core::{
    CameraIndex, FieldLayout, InputBatch, Keyframe, LandmarkLayout, Pose3D, StateKey, Timestamp,
    VariableKey,
};
use sfm_optimize::{IncrementalSolver, LmSmoother};
use sfm_pinhole::{CameraCalibration, CameraModel};
use std::collections::BTreeMap;

/// Everything the mapper has committed so far.
#[derive(Debug, Clone)]
pub struct MapperState<S = LmSmoother> {
    estimator: IncrementalEstimator<S>,
    /// Timestamps of every committed platform state.
    times: TimeKeyMap,
    next_key: StateKey,
    /// Keyframes that arrived before any platform state existed.
    retained: Vec<Keyframe>,
    has_vision: bool,
}

impl<S> MapperState<S>
where
    S: IncrementalSolver,
{
    pub fn new(solver: S) -> Self {
        Self {
            estimator: IncrementalEstimator::new(solver),
            times: TimeKeyMap::new(),
            next_key: StateKey(0),
            retained: vec![],
            has_vision: false,
        }
    }

    pub fn estimator(&self) -> &IncrementalEstimator<S> {
        &self.estimator
    }

    pub fn times(&self) -> &TimeKeyMap {
        &self.times
    }

    pub fn retained(&self) -> &[Keyframe] {
        &self.retained
    }

    pub fn has_vision(&self) -> bool {
        self.has_vision
    }
}

/// Fuses odometry and landmark detections into an estimate of the platform trajectory and the
/// landmark map.
pub struct SfmMapper<L = FieldLayout, C = BTreeMap<CameraIndex, CameraModel>, S = LmSmoother> {
    /// Committed mapping data
    data: MapperState<S>,
    /// Settings variables
    settings: MapperSettings,
    /// The prior guess of where landmarks are
    layout: L,
    /// Calibration of every camera keyframes may come from
    cameras: C,
}

impl<L, C> SfmMapper<L, C, LmSmoother>
where
    L: LandmarkLayout,
    C: CameraCalibration,
{
    /// Creates a mapper using the [`LmSmoother`] configured by [`MapperSettings::smoother`].
    pub fn new(settings: MapperSettings, layout: L, cameras: C) -> Self {
        let solver = LmSmoother::new(settings.smoother);
        Self::with_solver(settings, layout, cameras, solver)
    }
}

impl<L, C, S> SfmMapper<L, C, S>
where
    L: LandmarkLayout,
    C: CameraCalibration,
    S: IncrementalSolver,
{
    pub fn with_solver(settings: MapperSettings, layout: L, cameras: C, solver: S) -> Self {
        Self {
            data: MapperState::new(solver),
            settings,
            layout,
            cameras,
        }
    }

    pub fn settings(&self) -> &MapperSettings {
        &self.settings
    }

    pub fn data(&self) -> &MapperState<S> {
        &self.data
    }

    /// The layout the mapper was created with.
    pub fn prior_layout(&self) -> &L {
        &self.layout
    }

    pub fn status(&self) -> EstimatorStatus {
        self.data.estimator.status()
    }

    /// Adds one batch of measurements and re-estimates the map.
    ///
    /// Measurements that can not be used are reported in [`RoundReport::dropped`] rather than
    /// failing the call. If the solver rejects the round an error is returned and nothing the
    /// batch contained is kept.
    pub fn optimize(&mut self, batch: &InputBatch) -> Result<MapperOutput, MapperError> {
        if batch.is_empty() && self.data.retained.is_empty() {
            trace!("empty batch");
            return Ok(MapperOutput {
                estimate: self.estimate(),
                report: RoundReport::default(),
            });
        }

        let round = GraphBuilder::new(
            &self.settings,
            &self.layout,
            &self.cameras,
            self.data.estimator.solver(),
            &self.data.times,
            self.data.next_key,
        )
        .build(&batch.odometry, &self.data.retained, &batch.keyframes);

        let new_factors = round.update.factors.len();
        let adds_state = round.new_states > 0;
        let solve = match self.data.estimator.submit(round.update, adds_state) {
            Ok(solve) => solve,
            Err(e) => {
                error!("round rejected, keeping the previous estimate: {}", e);
                return Err(e.into());
            }
        };
        if let Some(report) = &solve {
            debug!(
                "round solved {} variables, error {:.6} -> {:.6}",
                report.variables, report.initial_error, report.final_error
            );
        }

        // Without a solve nothing staged may be kept, only the keyframes that are still waiting.
        if solve.is_some() {
            self.data.times.append(round.times);
            self.data.next_key = round.next_key;
            self.data.has_vision |= round.accepted_keyframes > 0;
        }
        self.data.retained = round.retained;

        Ok(MapperOutput {
            estimate: self.estimate(),
            report: RoundReport {
                dropped: round.dropped,
                retained_keyframes: self.data.retained.len(),
                new_states: if solve.is_some() { round.new_states } else { 0 },
                new_factors: if solve.is_some() { new_factors } else { 0 },
                solved: solve.is_some(),
            },
        })
    }

    /// A snapshot of the current trajectory and landmark estimates.
    pub fn estimate(&self) -> MapEstimate {
        let estimator = &self.data.estimator;
        let trajectory = self
            .data
            .times
            .iter()
            .filter_map(|(timestamp, key)| {
                estimator.value(key.into()).map(|pose| TrajectoryPoint {
                    key,
                    timestamp,
                    pose,
                })
            })
            .collect();
        let landmarks = estimator
            .values()
            .into_iter()
            .filter_map(|(key, pose)| key.landmark().map(|id| LandmarkEstimate { id, pose }))
            .collect();
        MapEstimate {
            status: estimator.status(),
            has_vision: self.data.has_vision,
            trajectory,
            landmarks,
        }
    }

    /// The estimated landmark poses as a layout, in the world frame of the anchors.
    pub fn layout(&self) -> FieldLayout {
        let mut layout = FieldLayout::new(self.layout.landmark_size());
        for (key, pose) in self.data.estimator.values() {
            if let Some(id) = key.landmark() {
                layout.insert(id, pose);
            }
        }
        layout
    }

    /// The estimated platform pose at the state nearest in time to `timestamp`.
    pub fn pose_at(&self, timestamp: Timestamp) -> Result<Pose3D, MapperError> {
        let (_, key) = self.data.times.nearest(timestamp)?;
        self.data
            .estimator
            .value(VariableKey::from(key))
            .ok_or(MapperError::Sync(SyncError::NoAssociableState))
    }
}
