//! Collaborator interfaces of the mapping controller.
//!
//! The controller schedules work; the numerical work itself is done by
//! engines behind these traits:
//! - `PoseRegistrar`: seed tuple search, initial and next-image registration
//! - `TrackTriangulator`: triangulation, track completion/merging, filtering
//! - `BundleAdjuster`: local and global refinement, camera calibration
//! - `ColorSampler`: per-point colors from image pixels
//!
//! Every call receives the grown model as `&mut Reconstruction` and is made
//! strictly one at a time. Engines may parallelize internally.

use std::collections::HashSet;
use std::path::Path;

use crate::config::{BundleAdjustmentOptions, RegistrationOptions, TriangulationOptions};
use crate::io::CorrespondenceCache;
use crate::model::{ImageId, Point3DId, Reconstruction};

/// Four images proposed to bootstrap a new model.
pub type SeedTuple = [ImageId; 4];

/// Observation counts reported by one local bundle adjustment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalBundleReport {
    pub num_merged_observations: usize,
    pub num_completed_observations: usize,
    pub num_filtered_observations: usize,
    pub num_adjusted_observations: usize,
}

impl LocalBundleReport {
    /// Observations touched by track maintenance during the adjustment.
    pub fn num_changed_observations(&self) -> usize {
        self.num_merged_observations + self.num_completed_observations + self.num_filtered_observations
    }
}

/// Pose estimation engine.
pub trait PoseRegistrar {
    /// Called once a model is selected for an attempt.
    fn begin_reconstruction(&mut self, _reconstruction: &Reconstruction, _cache: &CorrespondenceCache) {}

    /// Called when an attempt releases its model. With `discard` the model
    /// is about to be removed from the pool.
    fn end_reconstruction(&mut self, _reconstruction: &mut Reconstruction, _discard: bool) {}

    /// Propose up to `max_num_tuples` seed tuples, best first.
    fn find_initial_tuples(
        &mut self,
        reconstruction: &Reconstruction,
        options: &RegistrationOptions,
        max_num_tuples: usize,
    ) -> Vec<SeedTuple>;

    /// Register the four seed images and triangulate their first points.
    fn register_initial_tuple(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &RegistrationOptions,
        triangulation: &TriangulationOptions,
        tuple: &SeedTuple,
    ) -> bool;

    /// Rank unregistered images by how well they can be registered next.
    fn find_next_images(&mut self, reconstruction: &Reconstruction, options: &RegistrationOptions) -> Vec<ImageId>;

    /// Estimate the pose of `image_id` against the current model.
    fn register_next_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &RegistrationOptions,
        image_id: ImageId,
    ) -> bool;
}

/// Multi-view triangulation and track maintenance engine.
pub trait TrackTriangulator {
    /// Continue and create tracks through the observations of `image_id`.
    /// Returns the number of added observations.
    fn triangulate_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &TriangulationOptions,
        image_id: ImageId,
    ) -> usize;

    /// Re-triangulate image pairs with few common points.
    fn retriangulate(&mut self, reconstruction: &mut Reconstruction, options: &TriangulationOptions) -> usize;

    /// Add missing observations to existing tracks.
    fn complete_tracks(&mut self, reconstruction: &mut Reconstruction, options: &TriangulationOptions) -> usize;

    /// Merge tracks that observe the same point.
    fn merge_tracks(&mut self, reconstruction: &mut Reconstruction, options: &TriangulationOptions) -> usize;

    /// Remove observations with large reprojection error or small
    /// triangulation angle. Returns the number of removed observations.
    fn filter_points(&mut self, reconstruction: &mut Reconstruction, options: &RegistrationOptions) -> usize;

    /// Deregister images with implausible cameras or too few points.
    fn filter_images(&mut self, reconstruction: &mut Reconstruction, options: &RegistrationOptions) -> usize;

    /// Points created or changed since the last local refinement.
    fn modified_points(&self) -> HashSet<Point3DId>;

    fn clear_modified_points(&mut self);
}

/// Nonlinear refinement engine.
///
/// Alternate refinement strategies, such as an implicit-distortion bundle
/// adjustment, plug in here and through `calibrate_cameras`.
pub trait BundleAdjuster {
    /// Refine the neighborhood of `image_id` restricted to `point_ids`, then
    /// merge, complete and filter the touched tracks.
    fn adjust_local_bundle(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &RegistrationOptions,
        ba_options: &BundleAdjustmentOptions,
        triangulation: &TriangulationOptions,
        image_id: ImageId,
        point_ids: &HashSet<Point3DId>,
    ) -> LocalBundleReport;

    /// Refine every registered image and point. Returns false when the solve
    /// did not produce a usable result.
    fn adjust_global_bundle(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &RegistrationOptions,
        ba_options: &BundleAdjustmentOptions,
    ) -> bool;

    /// Re-estimate camera intrinsics from the current model. The default
    /// keeps the intrinsics unchanged.
    fn calibrate_cameras(
        &mut self,
        _reconstruction: &mut Reconstruction,
        _options: &RegistrationOptions,
        _triangulation: &TriangulationOptions,
    ) -> usize {
        0
    }
}

/// Everything the controller needs from its numerical backend.
pub trait MapperEngine: PoseRegistrar + TrackTriangulator + BundleAdjuster + Send {}

impl<T> MapperEngine for T where T: PoseRegistrar + TrackTriangulator + BundleAdjuster + Send {}

/// Fills point colors from the pixels of one image.
pub trait ColorSampler: Send {
    /// Returns false if the image could not be read.
    fn extract_colors(&mut self, reconstruction: &mut Reconstruction, image_id: ImageId, image_path: &Path) -> bool;
}
