use arrayvec::ArrayVec;
use sfm_core::nalgebra::{Point2, Point3, Vector3, Vector6};
use sfm_core::{Pose3D, VariableKey};
use sfm_pinhole::CameraModel;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Depth at which a projection factor clamps points that fall behind the camera.
pub const PROJECTION_MIN_DEPTH: f64 = 1e-3;

/// Whitened residual block of one factor.
pub type Residual = ArrayVec<f64, 6>;

/// Diagonal Gaussian noise on a pose, as standard deviations in `[tx, ty, tz, rx, ry, rz]` order.
///
/// Translations are in meters and rotations in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PoseNoise(pub [f64; 6]);

impl PoseNoise {
    pub fn from_sigmas(sigmas: [f64; 6]) -> Self {
        Self(sigmas)
    }

    pub fn isotropic(sigma: f64) -> Self {
        Self([sigma; 6])
    }

    /// Separate sigmas for the translation and rotation parts.
    pub fn translation_rotation(translation: f64, rotation: f64) -> Self {
        Self([
            translation,
            translation,
            translation,
            rotation,
            rotation,
            rotation,
        ])
    }

    fn whiten(&self, error: Vector6<f64>) -> Residual {
        error
            .iter()
            .zip(&self.0)
            .map(|(e, sigma)| e / sigma)
            .collect()
    }
}

/// A measurement constraining one or two variables.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum Factor {
    /// The relative pose `from⁻¹ * to` was measured.
    Between {
        from: VariableKey,
        to: VariableKey,
        measured: Pose3D,
        noise: PoseNoise,
    },
    /// One landmark corner was seen at a pixel by a camera on the platform.
    Projection {
        state: VariableKey,
        landmark: VariableKey,
        /// Position of the corner in the landmark frame.
        corner: Vector3<f64>,
        camera: CameraModel,
        measured: Point2<f64>,
        pixel_sigma: f64,
    },
    /// The variable itself was measured.
    Prior {
        key: VariableKey,
        measured: Pose3D,
        noise: PoseNoise,
    },
}

impl Factor {
    pub fn between(
        from: impl Into<VariableKey>,
        to: impl Into<VariableKey>,
        measured: Pose3D,
        noise: PoseNoise,
    ) -> Self {
        Self::Between {
            from: from.into(),
            to: to.into(),
            measured,
            noise,
        }
    }

    pub fn projection(
        state: impl Into<VariableKey>,
        landmark: impl Into<VariableKey>,
        corner: Vector3<f64>,
        camera: CameraModel,
        measured: Point2<f64>,
        pixel_sigma: f64,
    ) -> Self {
        Self::Projection {
            state: state.into(),
            landmark: landmark.into(),
            corner,
            camera,
            measured,
            pixel_sigma,
        }
    }

    pub fn prior(key: impl Into<VariableKey>, measured: Pose3D, noise: PoseNoise) -> Self {
        Self::Prior {
            key: key.into(),
            measured,
            noise,
        }
    }

    /// The variables this factor depends on.
    pub fn keys(&self) -> ArrayVec<VariableKey, 2> {
        let mut keys = ArrayVec::new();
        match *self {
            Self::Between { from, to, .. } => {
                keys.push(from);
                keys.push(to);
            }
            Self::Projection {
                state, landmark, ..
            } => {
                keys.push(state);
                keys.push(landmark);
            }
            Self::Prior { key, .. } => keys.push(key),
        }
        keys
    }

    /// Number of rows this factor adds to the residual vector.
    pub fn dimension(&self) -> usize {
        match self {
            Self::Projection { .. } => 2,
            Self::Between { .. } | Self::Prior { .. } => 6,
        }
    }

    /// The residual divided by the noise, evaluated against the values `lookup` provides.
    ///
    /// Returns `None` if a variable has no value.
    pub fn whitened_error(
        &self,
        lookup: impl Fn(VariableKey) -> Option<Pose3D>,
    ) -> Option<Residual> {
        Some(match self {
            Self::Between {
                from,
                to,
                measured,
                noise,
            } => {
                let relative = lookup(*from)?.between(lookup(*to)?);
                noise.whiten(measured.local(relative).to_vector())
            }
            Self::Projection {
                state,
                landmark,
                camera,
                measured,
                pixel_sigma,
                ..
            } => {
                let optical = self.optical_corner(lookup(*state)?, lookup(*landmark)?)?;
                let projected = camera.project_clamped(&optical, PROJECTION_MIN_DEPTH);
                let error = (projected - measured) / *pixel_sigma;
                [error.x, error.y].into_iter().collect()
            }
            Self::Prior {
                key,
                measured,
                noise,
            } => noise.whiten(measured.local(lookup(*key)?).to_vector()),
        })
    }

    /// The corner of a projection factor in the camera's optical frame.
    fn optical_corner(&self, state: Pose3D, landmark: Pose3D) -> Option<Point3<f64>> {
        match self {
            Self::Projection { corner, camera, .. } => {
                let world = landmark.transform_point(&Point3::from(*corner));
                Some(camera.world_to_optical(state).transform(&world))
            }
            _ => None,
        }
    }

    /// For projection factors, whether the corner lies in front of the camera.
    ///
    /// Other factors have no such constraint and always return `Some(true)`.
    pub fn in_front(&self, lookup: impl Fn(VariableKey) -> Option<Pose3D>) -> Option<bool> {
        match *self {
            Self::Projection {
                state, landmark, ..
            } => Some(self.optical_corner(lookup(state)?, lookup(landmark)?)?.z > 0.0),
            _ => Some(true),
        }
    }
}
