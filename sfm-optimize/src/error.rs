use sfm_core::VariableKey;
use thiserror::Error;

/// Reasons an incremental update was refused. The solver state is unchanged when one is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("variable {0} is referenced but has no value")]
    UnknownVariable(VariableKey),
    #[error("variable {0} was given an initial value more than once")]
    DuplicateVariable(VariableKey),
    #[error("optimization did not converge: {0}")]
    NotConverged(String),
    #[error("the optimized value of {0} is not finite")]
    NonFinite(VariableKey),
    #[error("a corner of landmark {landmark} ended up behind the camera of {state}")]
    BehindCamera {
        state: VariableKey,
        landmark: VariableKey,
    },
}
