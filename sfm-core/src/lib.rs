//! # SfM Core
//!
//! Common types shared by every crate of the landmark mapper: rigid poses and their tangent space,
//! the axis conventions used to move between the platform and the camera optical frame, landmark
//! and measurement types, and the keys that name variables in the factor graph.
//!
//! All poses in this workspace are expressed in the canonical right-handed frame where the positive
//! X axis is forward, the positive Y axis is left and the positive Z axis is up. Camera math is done
//! in the optical frame (X right, Y down, Z forward). The [`convention`] module is the only place
//! that converts between the two.
//!
//! ```text
//!          z (up)                         z (forward)
//!          |   x (forward)               /
//!          |  /                         /
//!          | /                         O------ x (right)
//!   y -----O                           |
//!  (left)                              |
//!                                      y (down)
//!      canonical                   optical
//! ```

pub mod convention;
mod key;
mod landmark;
mod measurement;
mod pose;

pub use convention::WorldToOptical;
pub use key::*;
pub use landmark::*;
pub use measurement::*;
pub use nalgebra;
pub use pose::*;
