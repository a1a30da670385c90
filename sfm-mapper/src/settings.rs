use sfm_core::{LandmarkId, Pose3D};
use sfm_optimize::SmootherSettings;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for the mapping process.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct MapperSettings {
    /// Standard deviations of one odometry delta as x, y, z (meters) then roll, pitch, yaw (radians).
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_odometry_sigmas")
    )]
    pub odometry_sigmas: [f64; 6],
    /// Standard deviation of a detected corner in pixels.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pixel_sigma"))]
    pub pixel_sigma: f64,
    /// Standard deviation of the prior that holds an anchor landmark at its layout pose.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_anchor_sigma"))]
    pub anchor_sigma: f64,
    /// When set, every other layout landmark is pulled towards its layout pose with these deviations.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub layout_prior_sigmas: Option<[f64; 6]>,
    /// Standard deviations of the weak prior on the very first platform state.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_state_sigmas")
    )]
    pub initial_state_sigmas: [f64; 6],
    /// The pose the first odometry delta is applied to.
    #[cfg_attr(feature = "serde-serialize", serde(default = "Pose3D::identity"))]
    pub initial_pose: Pose3D,
    /// Landmarks held fixed at their layout pose. These define the world frame.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub fixed_landmarks: Vec<LandmarkId>,
    /// Landmarks missing from the layout are placed by back-projecting their first detection
    /// instead of being dropped.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub allow_unmapped_landmarks: bool,
    /// Re-seed new platform states from the landmarks their keyframes see.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_vision_seeding")
    )]
    pub vision_seeding: bool,
    /// The number of keyframes that may wait for an odometry state before the oldest are dropped.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_retained_keyframes")
    )]
    pub max_retained_keyframes: usize,
    /// Vision seeds with a larger root mean square reprojection error (in pixels) are ignored.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pnp_max_rms"))]
    pub pnp_max_rms: f64,
    /// The maximum iterations to refine one vision seed.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pnp_patience"))]
    pub pnp_patience: usize,
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub smoother: SmootherSettings,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            odometry_sigmas: default_odometry_sigmas(),
            pixel_sigma: default_pixel_sigma(),
            anchor_sigma: default_anchor_sigma(),
            layout_prior_sigmas: None,
            initial_state_sigmas: default_initial_state_sigmas(),
            initial_pose: Pose3D::identity(),
            fixed_landmarks: vec![],
            allow_unmapped_landmarks: false,
            vision_seeding: default_vision_seeding(),
            max_retained_keyframes: default_max_retained_keyframes(),
            pnp_max_rms: default_pnp_max_rms(),
            pnp_patience: default_pnp_patience(),
            smoother: SmootherSettings::default(),
        }
    }
}

fn default_odometry_sigmas() -> [f64; 6] {
    [0.02, 0.02, 0.02, 0.01, 0.01, 0.01]
}

fn default_pixel_sigma() -> f64 {
    1.0
}

fn default_anchor_sigma() -> f64 {
    1e-6
}

fn default_initial_state_sigmas() -> [f64; 6] {
    [100.0; 6]
}

fn default_vision_seeding() -> bool {
    true
}

fn default_max_retained_keyframes() -> usize {
    64
}

fn default_pnp_max_rms() -> f64 {
    5.0
}

fn default_pnp_patience() -> usize {
    100
}
