//! Reconstruction - one evolving model hypothesis.
//!
//! The reconstruction is the central data structure every engine call
//! mutates:
//! - Cameras with shared intrinsics
//! - Images, registered (with pose) or not
//! - 3D points with their tracks
//!
//! It maintains two invariants on every mutation:
//! - every registered image has a finite pose
//! - every 3D point has at least two observations, all from distinct
//!   registered images

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, ensure, Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::io::CorrespondenceCache;

use super::camera::Camera;
use super::image::Image;
use super::point3d::Point3D;
use super::types::{CameraId, ImageId, Point3DId, TrackElement};

/// Minimum number of observations a 3D point must keep.
pub const MIN_TRACK_LENGTH: usize = 2;

/// A single reconstruction hypothesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, Image>,
    points3d: BTreeMap<Point3DId, Point3D>,

    /// Registered images in registration order.
    reg_image_ids: Vec<ImageId>,

    /// Counter for generating unique point ids.
    next_point3d_id: u64,
}

/// Counts describing a reconstruction, cheap to copy into logs and events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionSummary {
    pub num_cameras: usize,
    pub num_images: usize,
    pub num_reg_images: usize,
    pub num_points3d: usize,
    pub num_observations: usize,
    pub mean_track_length: f64,
}

impl Reconstruction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every camera and image of the correspondence cache that the
    /// reconstruction does not know yet. Existing entries (for example of a
    /// resumed model) are kept untouched.
    pub fn load(&mut self, cache: &CorrespondenceCache) {
        for camera in cache.cameras() {
            self.cameras
                .entry(camera.id)
                .or_insert_with(|| camera.clone());
        }
        for cached in cache.images() {
            self.images.entry(cached.id).or_insert_with(|| {
                let mut image = Image::new(cached.id, cached.name.clone(), cached.camera_id);
                image.num_points2d = cached.num_points2d;
                image.num_observations = cached.num_observations;
                image
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cameras and images
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_camera(&mut self, camera: Camera) {
        self.cameras.insert(camera.id, camera);
    }

    pub fn add_image(&mut self, image: Image) -> Result<()> {
        ensure!(
            self.cameras.contains_key(&image.camera_id),
            "image {} references unknown camera {}",
            image.id,
            image.camera_id
        );
        ensure!(
            !self.images.contains_key(&image.id),
            "image {} already exists",
            image.id
        );
        self.images.insert(image.id, image);
        Ok(())
    }

    pub fn camera(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(&id)
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `id` with pose `T_cw`, or update the pose of an already
    /// registered image.
    pub fn register_image(&mut self, id: ImageId, pose: SE3) -> Result<()> {
        ensure!(pose.is_finite(), "refusing non-finite pose for image {}", id);
        let image = self
            .images
            .get_mut(&id)
            .with_context(|| format!("cannot register unknown image {}", id))?;
        image.pose = pose;
        if !image.is_registered() {
            image.set_registered(true);
            self.reg_image_ids.push(id);
        }
        Ok(())
    }

    /// Deregister an image: drop all of its observations and delete the
    /// points left with fewer than two observations.
    ///
    /// Returns the number of observations removed (including those of
    /// deleted points).
    pub fn deregister_image(&mut self, id: ImageId) -> usize {
        let observed: Vec<u32> = match self.images.get(&id) {
            Some(image) if image.is_registered() => {
                image.point3d_ids().map(|(idx, _)| idx).collect()
            }
            _ => return 0,
        };

        let mut removed = 0;
        for point2d_idx in observed {
            removed += self.delete_observation(id, point2d_idx);
        }

        if let Some(image) = self.images.get_mut(&id) {
            image.set_registered(false);
        }
        self.reg_image_ids.retain(|&reg_id| reg_id != id);
        removed
    }

    pub fn is_image_registered(&self, id: ImageId) -> bool {
        self.images
            .get(&id)
            .map(|image| image.is_registered())
            .unwrap_or(false)
    }

    pub fn reg_image_ids(&self) -> &[ImageId] {
        &self.reg_image_ids
    }

    pub fn num_reg_images(&self) -> usize {
        self.reg_image_ids.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Points and tracks
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new 3D point observed by `track`.
    ///
    /// Every element must reference a distinct registered image whose
    /// keypoint is not yet associated with another point.
    pub fn add_point3d(&mut self, xyz: Vector3<f64>, track: Vec<TrackElement>) -> Result<Point3DId> {
        ensure!(
            track.len() >= MIN_TRACK_LENGTH,
            "track of length {} is too short",
            track.len()
        );
        let mut seen = HashSet::new();
        for el in &track {
            ensure!(seen.insert(el.image_id), "image {} observes the point twice", el.image_id);
            self.check_free_observation(el)?;
        }

        let id = Point3DId::new(self.next_point3d_id);
        self.next_point3d_id += 1;

        for el in &track {
            if let Some(image) = self.images.get_mut(&el.image_id) {
                image.set_point3d(el.point2d_idx, id);
            }
        }
        self.points3d.insert(id, Point3D::new(id, xyz, track));
        Ok(id)
    }

    /// Extend the track of an existing point.
    pub fn add_observation(&mut self, point3d_id: Point3DId, el: TrackElement) -> Result<()> {
        self.check_free_observation(&el)?;
        let point = self
            .points3d
            .get_mut(&point3d_id)
            .with_context(|| format!("unknown point {}", point3d_id))?;
        if point.observed_by(el.image_id) {
            bail!("point {} is already observed by image {}", point3d_id, el.image_id);
        }
        point.track.push(el);
        if let Some(image) = self.images.get_mut(&el.image_id) {
            image.set_point3d(el.point2d_idx, point3d_id);
        }
        Ok(())
    }

    /// Remove one observation. If the point is left with fewer than two
    /// observations it is deleted as well.
    ///
    /// Returns the number of observations that disappeared.
    pub fn delete_observation(&mut self, image_id: ImageId, point2d_idx: u32) -> usize {
        let point3d_id = match self
            .images
            .get_mut(&image_id)
            .and_then(|image| image.reset_point3d(point2d_idx))
        {
            Some(id) => id,
            None => return 0,
        };

        let remaining = match self.points3d.get_mut(&point3d_id) {
            Some(point) => {
                point.remove_observation(image_id);
                point.track_length()
            }
            None => return 1,
        };

        if remaining < MIN_TRACK_LENGTH {
            1 + self
                .delete_point3d(point3d_id)
                .map(|p| p.track_length())
                .unwrap_or(0)
        } else {
            1
        }
    }

    /// Delete a point and detach it from every observing image.
    pub fn delete_point3d(&mut self, id: Point3DId) -> Option<Point3D> {
        let point = self.points3d.remove(&id)?;
        for el in &point.track {
            if let Some(image) = self.images.get_mut(&el.image_id) {
                image.reset_point3d(el.point2d_idx);
            }
        }
        Some(point)
    }

    pub fn point3d(&self, id: Point3DId) -> Option<&Point3D> {
        self.points3d.get(&id)
    }

    pub fn points3d(&self) -> impl Iterator<Item = &Point3D> {
        self.points3d.values()
    }

    pub fn point3d_ids(&self) -> impl Iterator<Item = &Point3DId> {
        self.points3d.keys()
    }

    pub fn set_point_color(&mut self, id: Point3DId, color: [u8; 3]) -> bool {
        match self.points3d.get_mut(&id) {
            Some(point) => {
                point.color = color;
                true
            }
            None => false,
        }
    }

    pub fn num_points3d(&self) -> usize {
        self.points3d.len()
    }

    /// Total number of observations over all tracks.
    pub fn compute_num_observations(&self) -> usize {
        self.points3d.values().map(|p| p.track_length()).sum()
    }

    pub fn compute_mean_track_length(&self) -> f64 {
        if self.points3d.is_empty() {
            0.0
        } else {
            self.compute_num_observations() as f64 / self.points3d.len() as f64
        }
    }

    pub fn summary(&self) -> ReconstructionSummary {
        ReconstructionSummary {
            num_cameras: self.num_cameras(),
            num_images: self.num_images(),
            num_reg_images: self.num_reg_images(),
            num_points3d: self.num_points3d(),
            num_observations: self.compute_num_observations(),
            mean_track_length: self.compute_mean_track_length(),
        }
    }

    fn check_free_observation(&self, el: &TrackElement) -> Result<()> {
        let image = self
            .images
            .get(&el.image_id)
            .with_context(|| format!("unknown image {}", el.image_id))?;
        ensure!(
            image.is_registered(),
            "image {} is not registered",
            el.image_id
        );
        ensure!(
            image.point3d_id(el.point2d_idx).is_none(),
            "keypoint {} of image {} already observes a point",
            el.point2d_idx,
            el.image_id
        );
        Ok(())
    }
}
