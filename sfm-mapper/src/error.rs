use crate::SyncError;
use sfm_optimize::SolverError;
use thiserror::Error;

/// Errors that make a whole call to [`crate::SfmMapper::optimize`] fail.
///
/// The mapper keeps its last good state when one is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapperError {
    #[error("the solver rejected the update: {0}")]
    SolverDivergence(#[from] SolverError),
    #[error("time synchronization failed: {0}")]
    Sync(#[from] SyncError),
}
