//! Linear pose of one square landmark from its four corners.
//!
//! The landmark face is parametrized by plane coordinates `(u, v)` where the corners sit at
//! `(±1, ±1)`, in the same order as [`sfm_core::corner_offsets`]. A point on the face is
//! `(0, u * h, v * h)` in the landmark frame with `h` half the side length, so the plane-to-image
//! homography in normalized image coordinates is proportional to `[h r_y, h r_z, t]`.

use core::f64::consts::SQRT_2;
use sfm_core::nalgebra::{
    IsometryMatrix3, Matrix3, Point2, Rotation3, SMatrix, SVector, Translation3, Vector2,
};

/// Plane coordinates of the corners.
const PLANE_CORNERS: [[f64; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];

/// Similarity moving the points to a zero centroid with a mean distance of `√2`.
fn normalization(points: &[Point2<f64>; 4]) -> Option<Matrix3<f64>> {
    let centroid = points
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / 4.0;
    let mean_distance = points
        .iter()
        .map(|p| (p.coords - centroid).norm())
        .sum::<f64>()
        / 4.0;
    if !(mean_distance > f64::EPSILON) {
        return None;
    }
    let scale = SQRT_2 / mean_distance;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

/// The homography taking plane coordinates to the given (undistorted normalized) image points.
///
/// Four points determine it exactly, so this fixes `h33 = 1` and solves the resulting 8x8 system.
pub fn plane_homography(image: &[Point2<f64>; 4]) -> Option<Matrix3<f64>> {
    let normalize = normalization(image)?;
    let mut rows = [0.0; 64];
    let mut rhs = SVector::<f64, 8>::zeros();
    for (ix, (&[u, v], point)) in PLANE_CORNERS.iter().zip(image).enumerate() {
        let p = normalize * point.to_homogeneous();
        let (x, y) = (p.x, p.y);
        rows[16 * ix..16 * ix + 8].copy_from_slice(&[u, v, 1.0, 0.0, 0.0, 0.0, -x * u, -x * v]);
        rows[16 * ix + 8..16 * ix + 16]
            .copy_from_slice(&[0.0, 0.0, 0.0, u, v, 1.0, -y * u, -y * v]);
        rhs[2 * ix] = x;
        rhs[2 * ix + 1] = y;
    }
    let h = SMatrix::<f64, 8, 8>::from_row_slice(&rows).lu().solve(&rhs)?;
    if !h.iter().all(|n| n.is_finite()) {
        return None;
    }
    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
    Some(normalize.try_inverse()? * normalized)
}

/// The nearest proper rotation to `m` in the Frobenius sense.
fn closest_rotation(m: Matrix3<f64>) -> Option<Rotation3<f64>> {
    let svd = m.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(svd.singular_values.imin()).neg_mut();
    }
    Some(Rotation3::from_matrix_unchecked(u * v_t))
}

/// Splits a plane-to-image homography into the transform from the landmark frame into the
/// optical frame.
///
/// The scale is taken from the average length of the first two columns and its sign is chosen so
/// that the landmark lands in front of the camera.
pub fn decompose(homography: &Matrix3<f64>, half_size: f64) -> Option<IsometryMatrix3<f64>> {
    let h1 = homography.column(0).into_owned();
    let h2 = homography.column(1).into_owned();
    let h3 = homography.column(2).into_owned();
    let norms = h1.norm() + h2.norm();
    if !(norms > f64::EPSILON) || !(half_size > 0.0) {
        return None;
    }
    let mut scale = 2.0 * half_size / norms;
    if scale * h3.z < 0.0 {
        scale = -scale;
    }
    let r_y = h1 * (scale / half_size);
    let r_z = h2 * (scale / half_size);
    let r_x = r_y.cross(&r_z);
    let rotation = closest_rotation(Matrix3::from_columns(&[r_x, r_y, r_z]))?;
    let translation = h3 * scale;
    if !translation.iter().all(|n| n.is_finite()) {
        return None;
    }
    Some(IsometryMatrix3::from_parts(
        Translation3::from(translation),
        rotation,
    ))
}

/// Linear estimate of the transform from a landmark's frame into the optical frame.
pub fn landmark_to_optical(
    normalized_corners: &[Point2<f64>; 4],
    landmark_size: f64,
) -> Option<IsometryMatrix3<f64>> {
    decompose(&plane_homography(normalized_corners)?, 0.5 * landmark_size)
}
