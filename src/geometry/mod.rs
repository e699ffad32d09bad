//! Geometry utilities: rigid-body poses.

pub mod se3;

pub use se3::SE3;
