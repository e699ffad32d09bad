//! Image - a view in the reconstruction, registered or not.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

use super::types::{CameraId, ImageId, Point3DId};

/// An image known to a reconstruction.
///
/// Every image from the correspondence cache is present in every model; only
/// registered images carry a meaningful pose and may observe 3D points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,

    /// File name relative to the image directory.
    pub name: String,

    /// Camera whose intrinsics this image uses.
    pub camera_id: CameraId,

    /// Pose `T_cw` (world to camera). Only valid when `registered`.
    pub pose: SE3,

    registered: bool,

    /// Number of keypoints in the image.
    pub num_points2d: u32,

    /// Number of keypoints that have at least one correspondence.
    pub num_observations: u32,

    /// Keypoint index -> 3D point it is an observation of.
    point3d_ids: HashMap<u32, Point3DId>,
}

impl Image {
    pub fn new(id: ImageId, name: impl Into<String>, camera_id: CameraId) -> Self {
        Self {
            id,
            name: name.into(),
            camera_id,
            pose: SE3::identity(),
            registered: false,
            num_points2d: 0,
            num_observations: 0,
            point3d_ids: HashMap::new(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    /// Number of keypoints currently associated with a 3D point.
    pub fn num_points3d(&self) -> usize {
        self.point3d_ids.len()
    }

    pub fn point3d_id(&self, point2d_idx: u32) -> Option<Point3DId> {
        self.point3d_ids.get(&point2d_idx).copied()
    }

    pub fn point3d_ids(&self) -> impl Iterator<Item = (u32, Point3DId)> + '_ {
        self.point3d_ids.iter().map(|(&idx, &id)| (idx, id))
    }

    pub(crate) fn set_point3d(&mut self, point2d_idx: u32, point3d_id: Point3DId) {
        self.point3d_ids.insert(point2d_idx, point3d_id);
    }

    pub(crate) fn reset_point3d(&mut self, point2d_idx: u32) -> Option<Point3DId> {
        self.point3d_ids.remove(&point2d_idx)
    }
}
