use core::iter::Sum;
use core::ops::{Add, Mul};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Point3, Rotation3, Vector3, Vector6};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A rigid transform in the canonical frame.
///
/// Depending on where it is stored this is the pose of the platform in the world, the pose of a
/// landmark in the world, the pose of a camera relative to the platform, or a relative motion
/// between two platform states. Composition follows the usual convention that `a * b` applies `b`
/// first and then `a`.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Pose3D(pub IsometryMatrix3<f64>);

impl Pose3D {
    /// Creates a pose with no change in position or orientation.
    pub fn identity() -> Self {
        Self(IsometryMatrix3::identity())
    }

    /// Create the pose from translation and rotation.
    pub fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        Self(IsometryMatrix3::from_parts(translation.into(), rotation))
    }

    /// Create a pose from a translation and roll, pitch, yaw (applied as extrinsic X, Y, Z rotations).
    pub fn from_translation_rpy(translation: Vector3<f64>, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self::from_parts(translation, Rotation3::from_euler_angles(roll, pitch, yaw))
    }

    /// Retrieve the isometry.
    pub fn isometry(self) -> IsometryMatrix3<f64> {
        self.0
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.0.translation.vector
    }

    pub fn rotation(&self) -> Rotation3<f64> {
        self.0.rotation
    }

    /// Takes the inverse of the pose.
    #[must_use]
    pub fn inverse(self) -> Self {
        Self(self.0.inverse())
    }

    /// Applies `other` in the frame of `self`.
    #[must_use]
    pub fn compose(self, other: Self) -> Self {
        Self(self.0 * other.0)
    }

    /// The relative pose that takes `self` to `other`, that is `self⁻¹ * other`.
    #[must_use]
    pub fn between(self, other: Self) -> Self {
        Self(self.0.inverse() * other.0)
    }

    /// Maps a point expressed in this pose's frame into the parent frame.
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.0 * point
    }

    /// Maps a point expressed in the parent frame into this pose's frame.
    pub fn inverse_transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.0.inverse_transform_point(point)
    }

    /// Perturbs the pose in its own (body) frame: `self * exp(delta)`.
    #[must_use]
    pub fn retract(self, delta: Se3TangentSpace) -> Self {
        Self(self.0 * delta.isometry())
    }

    /// The body-frame tangent vector that [`Pose3D::retract`]s `self` onto `other`.
    pub fn local(self, other: Self) -> Se3TangentSpace {
        Se3TangentSpace::from_isometry(self.between(other).0)
    }

    /// Checks that no component of the pose is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.0.translation.vector.iter().all(|n| n.is_finite())
            && self.0.rotation.matrix().iter().all(|n| n.is_finite())
    }
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for Pose3D {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.compose(rhs)
    }
}

/// Element of se(3) with the translation part kept separate from the so(3) part.
///
/// The exponential used here is the decoupled one (`t`, `exp(ω)`), which is all the optimizers need
/// for small steps and keeps residuals cheap to evaluate.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Se3TangentSpace {
    pub translation: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

impl Se3TangentSpace {
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: Vector3::zeros(),
        }
    }

    /// Reads the tangent from `[tx, ty, tz, rx, ry, rz]`.
    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self {
            translation: Vector3::new(v[0], v[1], v[2]),
            rotation: Vector3::new(v[3], v[4], v[5]),
        }
    }

    /// Writes the tangent as `[tx, ty, tz, rx, ry, rz]`.
    pub fn to_vector(self) -> Vector6<f64> {
        let Self {
            translation: t,
            rotation: r,
        } = self;
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Gets the isometry that represents this tangent space transformation.
    #[must_use]
    pub fn isometry(self) -> IsometryMatrix3<f64> {
        IsometryMatrix3::from_parts(
            self.translation.into(),
            Rotation3::from_scaled_axis(self.rotation),
        )
    }

    /// Inverse of [`Se3TangentSpace::isometry`].
    pub fn from_isometry(isometry: IsometryMatrix3<f64>) -> Self {
        Self {
            translation: isometry.translation.vector,
            rotation: isometry.rotation.scaled_axis(),
        }
    }

    /// Scales both the rotation and the translation.
    #[must_use]
    pub fn scale(mut self, scale: f64) -> Self {
        self.translation *= scale;
        self.rotation *= scale;
        self
    }
}

impl Add for Se3TangentSpace {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            translation: self.translation + rhs.translation,
            rotation: self.rotation + rhs.rotation,
        }
    }
}

impl Sum for Se3TangentSpace {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::identity(), |a, b| a + b)
    }
}
