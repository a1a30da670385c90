use crate::EstimatorStatus;
use log::{debug, info};
use sfm_core::{Pose3D, Values, VariableKey};
use sfm_optimize::{GraphUpdate, IncrementalSolver, LmSmoother, SolverError, UpdateReport};

/// Wraps an [`IncrementalSolver`] and tracks how far estimation has come.
#[derive(Debug, Clone)]
pub struct IncrementalEstimator<S = LmSmoother> {
    solver: S,
    status: EstimatorStatus,
}

impl<S> IncrementalEstimator<S>
where
    S: IncrementalSolver,
{
    pub fn new(solver: S) -> Self {
        Self {
            solver,
            status: EstimatorStatus::Empty,
        }
    }

    pub fn status(&self) -> EstimatorStatus {
        self.status
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn value(&self, key: VariableKey) -> Option<Pose3D> {
        self.solver.value(key)
    }

    pub fn contains(&self, key: VariableKey) -> bool {
        self.solver.contains(key)
    }

    pub fn values(&self) -> Values {
        self.solver.values()
    }

    /// Hands one round of new factors and values to the solver.
    ///
    /// Returns `Ok(None)` without touching the solver when there is nothing to solve: either the
    /// update is empty or no platform state exists yet and the round adds none.
    ///
    /// The first round that adds a state moves the status out of `Empty` for good. A failed solve
    /// leaves the solver as it was and the status at `Initialized` until a solve succeeds.
    pub fn submit(
        &mut self,
        update: GraphUpdate,
        adds_state: bool,
    ) -> Result<Option<UpdateReport>, SolverError> {
        if self.status == EstimatorStatus::Empty && !adds_state {
            debug!("no platform state yet, nothing to estimate");
            return Ok(None);
        }
        if update.is_empty() {
            return Ok(None);
        }
        if self.status == EstimatorStatus::Empty {
            info!("initializing estimate");
            self.status = EstimatorStatus::Initialized;
        }
        let report = self.solver.update(update)?;
        self.status = EstimatorStatus::Converged;
        Ok(Some(report))
    }
}
