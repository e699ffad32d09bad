//! Point3D - a triangulated landmark with its track.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::types::{ImageId, Point3DId, TrackElement};

/// A 3D point together with the track of 2D observations it explains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point3D {
    pub id: Point3DId,

    /// Position in world frame.
    pub xyz: Vector3<f64>,

    /// RGB color, sampled from the observing images when enabled.
    pub color: [u8; 3],

    /// Mean reprojection error in pixels, as last reported by refinement.
    pub error: f64,

    /// Observations of this point. At most one element per image.
    pub track: Vec<TrackElement>,
}

impl Point3D {
    pub fn new(id: Point3DId, xyz: Vector3<f64>, track: Vec<TrackElement>) -> Self {
        Self {
            id,
            xyz,
            color: [0, 0, 0],
            error: -1.0,
            track,
        }
    }

    pub fn track_length(&self) -> usize {
        self.track.len()
    }

    pub fn observed_by(&self, image_id: ImageId) -> bool {
        self.track.iter().any(|el| el.image_id == image_id)
    }

    /// Remove the observation made by `image_id`. Returns the removed element.
    pub(crate) fn remove_observation(&mut self, image_id: ImageId) -> Option<TrackElement> {
        let pos = self.track.iter().position(|el| el.image_id == image_id)?;
        Some(self.track.swap_remove(pos))
    }
}
