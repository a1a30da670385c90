use thiserror::Error;

/// Why a perspective solve that had enough data still produced no pose.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PerspectiveFailure {
    #[error("the corners do not define a usable plane-to-image mapping")]
    Degenerate,
    #[error("refinement did not converge")]
    NotConverged,
    #[error("the pose is not finite")]
    NonFinite,
    #[error("a landmark corner is behind the camera")]
    BehindCamera,
    #[error("reprojection error of {rms} px is above the bound of {max} px")]
    ReprojectionError { rms: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PnpError {
    #[error("{correspondences} corner correspondences available but {required} are needed")]
    InsufficientCorrespondences {
        correspondences: usize,
        required: usize,
    },
    #[error("perspective solve failed: {0}")]
    PerspectiveSolveFailed(#[from] PerspectiveFailure),
}
