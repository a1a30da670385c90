use sfm_core::nalgebra::{Point2, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Maximum fixed-point iterations spent inverting the distortion.
const UNDISTORT_ITERATIONS: usize = 32;
/// Squared step length at which undistortion is considered converged.
const UNDISTORT_EPSILON: f64 = 1e-28;

/// Brown-Conrady lens distortion with the five coefficients OpenCV uses by default.
///
/// Given normalized coordinates $(x, y)$ and $r^2 = x^2 + y^2$ the distorted coordinates are
///
/// $$
/// \begin{aligned}
/// x' &= x ⋅ (1 + k_1 r^2 + k_2 r^4 + k_3 r^6) + 2 p_1 x y + p_2 (r^2 + 2 x^2) \\\\
/// y' &= y ⋅ (1 + k_1 r^2 + k_2 r^4 + k_3 r^6) + p_1 (r^2 + 2 y^2) + 2 p_2 x y
/// \end{aligned}
/// $$
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    /// No distortion at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates the distortion from coefficients in OpenCV order `[k1, k2, p1, p2, k3]`.
    pub fn from_opencv(coefficients: [f64; 5]) -> Self {
        let [k1, k2, p1, p2, k3] = coefficients;
        Self { k1, k2, p1, p2, k3 }
    }

    /// The coefficients in OpenCV order.
    pub fn to_opencv(self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_none(&self) -> bool {
        self.to_opencv().iter().all(|&c| c == 0.0)
    }

    fn radial(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    fn tangential(&self, point: Vector2<f64>, r2: f64) -> Vector2<f64> {
        let Self { p1, p2, .. } = *self;
        let (x, y) = (point.x, point.y);
        Vector2::new(
            2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Applies the lens distortion to an ideal normalized image point.
    pub fn distort(&self, point: Point2<f64>) -> Point2<f64> {
        if self.is_none() {
            return point;
        }
        let r2 = point.coords.norm_squared();
        (point.coords * self.radial(r2) + self.tangential(point.coords, r2)).into()
    }

    /// Removes the lens distortion from a distorted normalized image point.
    ///
    /// This is the same fixed-point iteration OpenCV uses, stopped early once it settles.
    pub fn undistort(&self, point: Point2<f64>) -> Point2<f64> {
        if self.is_none() {
            return point;
        }
        let distorted = point.coords;
        let mut undistorted = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = undistorted.norm_squared();
            let next =
                (distorted - self.tangential(undistorted, r2)) / self.radial(r2);
            let step = (next - undistorted).norm_squared();
            undistorted = next;
            if step < UNDISTORT_EPSILON {
                break;
            }
        }
        undistorted.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn undistort_inverts_distort() {
        let distortion = Distortion::from_opencv([0.05, -0.02, 0.001, -0.0005, 0.003]);
        for &(x, y) in &[(0.0, 0.0), (0.2, -0.1), (-0.35, 0.28), (0.4, 0.4)] {
            let ideal = Point2::new(x, y);
            let round_trip = distortion.undistort(distortion.distort(ideal));
            assert_relative_eq!(round_trip, ideal, epsilon = 1e-9);
        }
    }

    #[test]
    fn zero_distortion_is_identity() {
        let point = Point2::new(0.3, -0.7);
        assert_eq!(Distortion::none().distort(point), point);
        assert_eq!(Distortion::none().undistort(point), point);
    }
}
