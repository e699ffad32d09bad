//! Model store: reconstructions and the pool of models explored in a run.
//!
//! - [`Reconstruction`] - cameras, images with poses, 3D points with tracks
//! - [`ModelPool`] - ordered set of reconstructions with overlap bookkeeping

pub mod camera;
pub mod image;
pub mod point3d;
pub mod pool;
pub mod reconstruction;
pub mod types;

pub use camera::Camera;
pub use image::Image;
pub use point3d::Point3D;
pub use pool::{ModelIndex, ModelPool, OtherModels};
pub use reconstruction::{Reconstruction, ReconstructionSummary, MIN_TRACK_LENGTH};
pub use types::{CameraId, ImageId, Point3DId, TrackElement};
