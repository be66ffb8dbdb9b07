//! Geometry utilities: SE3 transforms, SO(3) helpers, Kabsch alignment.

pub mod kabsch;
pub mod se3;
pub mod so3;

pub use kabsch::{kabsch, PointMoments};
pub use se3::SE3;
