//! Options of the incremental mapper.
//!
//! `MapperOptions` is the flat user-facing surface. The nested
//! `RegistrationOptions` and `TriangulationOptions` blocks are handed to the
//! engines; the accessors below copy the shared settings (focal length
//! bounds, refinement flags, threads) into them so that engines never read
//! the flat surface directly.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::io::LoadRequest;

use super::bundle::{BundleAdjustmentOptions, LossFunction, SolverOptions};

/// Strategy used by the registrar to rank next-best images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSelectionMethod {
    MaxVisiblePointsNum,
    MaxVisiblePointsRatio,
    MinUncertainty,
}

/// Options consumed by the pose registration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationOptions {
    /// Minimum number of inliers for the initial image tuple.
    pub init_min_num_inliers: usize,
    /// Maximum reprojection error (px) during initialization.
    pub init_max_error: f64,
    /// Maximum forward motion between initial images.
    pub init_max_forward_motion: f64,
    /// Minimum triangulation angle (deg) for the initial images.
    pub init_min_tri_angle: f64,
    /// Maximum number of times an image is tried as initial image.
    pub init_max_reg_trials: usize,

    /// Maximum reprojection error (px) in absolute pose estimation.
    pub abs_pose_max_error: f64,
    /// Minimum number of 2D-3D inliers for absolute pose estimation.
    pub abs_pose_min_num_inliers: usize,
    /// Minimum inlier ratio for absolute pose estimation.
    pub abs_pose_min_inlier_ratio: f64,
    pub abs_pose_refine_focal_length: bool,
    pub abs_pose_refine_extra_params: bool,

    /// Number of images optimized in local bundle adjustment.
    pub local_ba_num_images: usize,
    /// Minimum triangulation angle (deg) for local bundle adjustment images.
    pub local_ba_min_tri_angle: f64,

    pub min_focal_length_ratio: f64,
    pub max_focal_length_ratio: f64,
    pub max_extra_param: f64,

    /// Maximum reprojection error (px) of observations kept by filtering.
    pub filter_max_reproj_error: f64,
    /// Minimum triangulation angle (deg) of points kept by filtering.
    pub filter_min_tri_angle: f64,

    /// Maximum number of registration attempts per image.
    pub max_reg_trials: usize,

    /// Keep poses of already registered images fixed.
    pub fix_existing_images: bool,

    pub num_threads: i32,

    pub image_selection_method: ImageSelectionMethod,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            init_min_num_inliers: 100,
            init_max_error: 4.0,
            init_max_forward_motion: 0.95,
            init_min_tri_angle: 16.0,
            init_max_reg_trials: 2,
            abs_pose_max_error: 12.0,
            abs_pose_min_num_inliers: 30,
            abs_pose_min_inlier_ratio: 0.25,
            abs_pose_refine_focal_length: true,
            abs_pose_refine_extra_params: true,
            local_ba_num_images: 6,
            local_ba_min_tri_angle: 6.0,
            min_focal_length_ratio: 0.1,
            max_focal_length_ratio: 10.0,
            max_extra_param: 1.0,
            filter_max_reproj_error: 4.0,
            filter_min_tri_angle: 1.5,
            max_reg_trials: 3,
            fix_existing_images: false,
            num_threads: -1,
            image_selection_method: ImageSelectionMethod::MinUncertainty,
        }
    }
}

impl RegistrationOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.init_min_num_inliers > 0, "init_min_num_inliers must be > 0");
        ensure!(self.init_max_error > 0.0, "init_max_error must be > 0");
        ensure!(
            (0.0..=1.0).contains(&self.init_max_forward_motion),
            "init_max_forward_motion must lie in [0, 1]"
        );
        ensure!(self.init_min_tri_angle >= 0.0, "init_min_tri_angle must be >= 0");
        ensure!(self.init_max_reg_trials >= 1, "init_max_reg_trials must be >= 1");
        ensure!(self.abs_pose_max_error > 0.0, "abs_pose_max_error must be > 0");
        ensure!(self.abs_pose_min_num_inliers > 0, "abs_pose_min_num_inliers must be > 0");
        ensure!(
            (0.0..=1.0).contains(&self.abs_pose_min_inlier_ratio),
            "abs_pose_min_inlier_ratio must lie in [0, 1]"
        );
        ensure!(self.local_ba_num_images >= 2, "local_ba_num_images must be >= 2");
        ensure!(self.local_ba_min_tri_angle >= 0.0, "local_ba_min_tri_angle must be >= 0");
        ensure!(self.min_focal_length_ratio >= 0.0, "min_focal_length_ratio must be >= 0");
        ensure!(
            self.max_focal_length_ratio >= self.min_focal_length_ratio,
            "max_focal_length_ratio must be >= min_focal_length_ratio"
        );
        ensure!(self.max_extra_param >= 0.0, "max_extra_param must be >= 0");
        ensure!(self.filter_max_reproj_error >= 0.0, "filter_max_reproj_error must be >= 0");
        ensure!(self.filter_min_tri_angle >= 0.0, "filter_min_tri_angle must be >= 0");
        ensure!(self.max_reg_trials >= 1, "max_reg_trials must be >= 1");
        Ok(())
    }
}

/// Options consumed by the triangulation / track engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationOptions {
    /// Maximum transitivity to search for correspondences.
    pub max_transitivity: usize,
    /// Maximum angular error (deg) to create new triangulations.
    pub create_max_angle_error: f64,
    /// Maximum angular error (deg) to continue existing triangulations.
    pub continue_max_angle_error: f64,
    /// Maximum reprojection error (px) to merge triangulations.
    pub merge_max_reproj_error: f64,
    /// Maximum reprojection error (px) to complete an existing track.
    pub complete_max_reproj_error: f64,
    /// Maximum transitivity for track completion.
    pub complete_max_transitivity: usize,
    /// Maximum angular error (deg) to re-triangulate under-reconstructed pairs.
    pub re_max_angle_error: f64,
    /// Minimum ratio of common triangulations for re-triangulation.
    pub re_min_ratio: f64,
    /// Maximum number of re-triangulation trials per image pair.
    pub re_max_trials: usize,
    /// Minimum pairwise triangulation angle (deg).
    pub min_angle: f64,
    /// Skip two-view tracks for triangulation.
    pub ignore_two_view_tracks: bool,
    pub min_focal_length_ratio: f64,
    pub max_focal_length_ratio: f64,
    pub max_extra_param: f64,
    /// Registered-image count from which the standard triangulation is used.
    pub min_num_reg_images: usize,
}

impl Default for TriangulationOptions {
    fn default() -> Self {
        Self {
            max_transitivity: 1,
            create_max_angle_error: 2.0,
            continue_max_angle_error: 2.0,
            merge_max_reproj_error: 4.0,
            complete_max_reproj_error: 4.0,
            complete_max_transitivity: 5,
            re_max_angle_error: 5.0,
            re_min_ratio: 0.2,
            re_max_trials: 1,
            min_angle: 1.5,
            ignore_two_view_tracks: true,
            min_focal_length_ratio: 0.1,
            max_focal_length_ratio: 10.0,
            max_extra_param: 1.0,
            min_num_reg_images: 16,
        }
    }
}

impl TriangulationOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.create_max_angle_error > 0.0, "create_max_angle_error must be > 0");
        ensure!(self.continue_max_angle_error > 0.0, "continue_max_angle_error must be > 0");
        ensure!(self.merge_max_reproj_error > 0.0, "merge_max_reproj_error must be > 0");
        ensure!(self.complete_max_reproj_error > 0.0, "complete_max_reproj_error must be > 0");
        ensure!(self.re_max_angle_error > 0.0, "re_max_angle_error must be > 0");
        ensure!((0.0..=1.0).contains(&self.re_min_ratio), "re_min_ratio must lie in [0, 1]");
        ensure!(self.min_angle >= 0.0, "min_angle must be >= 0");
        ensure!(self.min_focal_length_ratio >= 0.0, "min_focal_length_ratio must be >= 0");
        ensure!(
            self.max_focal_length_ratio >= self.min_focal_length_ratio,
            "max_focal_length_ratio must be >= min_focal_length_ratio"
        );
        ensure!(self.max_extra_param >= 0.0, "max_extra_param must be >= 0");
        Ok(())
    }
}

/// Flat run configuration of the incremental mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperOptions {
    /// Minimum number of verified matches for an image pair to be used.
    pub min_num_matches: usize,
    /// Ignore pairs flagged as watermark matches.
    pub ignore_watermarks: bool,

    /// Keep exploring new models once the first one is finished.
    pub multiple_models: bool,
    /// Maximum number of models in the pool.
    pub max_num_models: usize,
    /// Maximum number of images shared between the grown model and the rest
    /// of the pool before growth stops.
    pub max_model_overlap: usize,
    /// Minimum number of registered images of a kept model.
    pub min_model_size: usize,

    /// Number of initialization trials (and seed tuples requested).
    pub init_num_trials: usize,
    /// Failed candidates after which a still-small model gives up on the
    /// current candidate list. The list is abandoned once this many
    /// candidates of the round have failed.
    pub init_max_reg_failures: usize,

    /// Sample point colors from the registered images.
    pub extract_colors: bool,

    pub num_threads: i32,

    pub min_focal_length_ratio: f64,
    pub max_focal_length_ratio: f64,
    pub max_extra_param: f64,

    pub ba_refine_focal_length: bool,
    pub ba_refine_principal_point: bool,
    pub ba_refine_extra_params: bool,
    pub ba_min_num_residuals_for_multi_threading: usize,

    pub ba_local_num_images: usize,
    pub ba_local_max_num_iterations: usize,
    pub ba_local_max_refinements: usize,
    pub ba_local_max_refinement_change: f64,

    /// A global pass runs when the registered images grew by this factor.
    pub ba_global_images_ratio: f64,
    /// A global pass runs when the points grew by this factor.
    pub ba_global_points_ratio: f64,
    /// A global pass runs after this many newly registered images.
    pub ba_global_images_freq: usize,
    /// A global pass runs after this many new points.
    pub ba_global_points_freq: usize,
    pub ba_global_max_num_iterations: usize,
    pub ba_global_max_refinements: usize,
    pub ba_global_max_refinement_change: f64,
    /// Below this many registered images global BA uses tighter tolerances.
    pub ba_global_min_num_reg_images_fast: usize,
    /// Extra camera parameters are refined in global BA from this many
    /// registered images on.
    pub ba_global_extra_params_min_num_reg_images: usize,

    /// Directory receiving snapshots. Required when `snapshot_images_freq > 0`.
    pub snapshot_path: Option<PathBuf>,
    /// Write a snapshot every this many registered images; 0 disables.
    pub snapshot_images_freq: usize,

    /// Restrict the run to these image names. Empty means all images.
    pub image_names: BTreeSet<String>,

    pub fix_existing_images: bool,

    pub mapper: RegistrationOptions,
    pub triangulation: TriangulationOptions,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            min_num_matches: 15,
            ignore_watermarks: false,
            multiple_models: true,
            max_num_models: 50,
            max_model_overlap: 20,
            min_model_size: 10,
            init_num_trials: 200,
            init_max_reg_failures: 30,
            extract_colors: true,
            num_threads: -1,
            min_focal_length_ratio: 0.1,
            max_focal_length_ratio: 10.0,
            max_extra_param: 1.0,
            ba_refine_focal_length: true,
            ba_refine_principal_point: false,
            ba_refine_extra_params: true,
            ba_min_num_residuals_for_multi_threading: 50_000,
            ba_local_num_images: 6,
            ba_local_max_num_iterations: 25,
            ba_local_max_refinements: 2,
            ba_local_max_refinement_change: 0.001,
            ba_global_images_ratio: 1.1,
            ba_global_points_ratio: 1.1,
            ba_global_images_freq: 500,
            ba_global_points_freq: 250_000,
            ba_global_max_num_iterations: 50,
            ba_global_max_refinements: 5,
            ba_global_max_refinement_change: 0.0005,
            ba_global_min_num_reg_images_fast: 10,
            ba_global_extra_params_min_num_reg_images: 16,
            snapshot_path: None,
            snapshot_images_freq: 0,
            image_names: BTreeSet::new(),
            fix_existing_images: false,
            mapper: RegistrationOptions::default(),
            triangulation: TriangulationOptions::default(),
        }
    }
}

impl MapperOptions {
    /// Validate every threshold. Runs once, before any I/O.
    pub fn check(&self) -> Result<()> {
        ensure!(self.min_num_matches > 0, "min_num_matches must be > 0");
        ensure!(self.max_num_models > 0, "max_num_models must be > 0");
        ensure!(self.max_model_overlap > 0, "max_model_overlap must be > 0");
        ensure!(self.init_num_trials > 0, "init_num_trials must be > 0");
        ensure!(self.init_max_reg_failures > 0, "init_max_reg_failures must be > 0");
        ensure!(self.min_focal_length_ratio > 0.0, "min_focal_length_ratio must be > 0");
        ensure!(self.max_focal_length_ratio > 0.0, "max_focal_length_ratio must be > 0");
        ensure!(self.max_extra_param >= 0.0, "max_extra_param must be >= 0");
        ensure!(self.ba_local_num_images >= 2, "ba_local_num_images must be >= 2");
        ensure!(self.ba_global_images_ratio > 1.0, "ba_global_images_ratio must be > 1");
        ensure!(self.ba_global_points_ratio > 1.0, "ba_global_points_ratio must be > 1");
        ensure!(self.ba_global_images_freq > 0, "ba_global_images_freq must be > 0");
        ensure!(self.ba_global_points_freq > 0, "ba_global_points_freq must be > 0");
        ensure!(self.ba_global_max_num_iterations > 0, "ba_global_max_num_iterations must be > 0");
        ensure!(self.ba_local_max_refinements > 0, "ba_local_max_refinements must be > 0");
        ensure!(
            self.ba_local_max_refinement_change >= 0.0,
            "ba_local_max_refinement_change must be >= 0"
        );
        ensure!(self.ba_global_max_refinements > 0, "ba_global_max_refinements must be > 0");
        ensure!(
            self.ba_global_max_refinement_change >= 0.0,
            "ba_global_max_refinement_change must be >= 0"
        );
        ensure!(
            self.snapshot_images_freq == 0 || self.snapshot_path.is_some(),
            "snapshot_images_freq > 0 requires snapshot_path"
        );
        self.mapper().check().context("invalid mapper options")?;
        self.triangulation().check().context("invalid triangulation options")?;
        Ok(())
    }

    /// Registration options with the shared settings applied.
    pub fn mapper(&self) -> RegistrationOptions {
        RegistrationOptions {
            abs_pose_refine_focal_length: self.ba_refine_focal_length,
            abs_pose_refine_extra_params: self.ba_refine_extra_params,
            min_focal_length_ratio: self.min_focal_length_ratio,
            max_focal_length_ratio: self.max_focal_length_ratio,
            max_extra_param: self.max_extra_param,
            num_threads: self.num_threads,
            local_ba_num_images: self.ba_local_num_images,
            fix_existing_images: self.fix_existing_images,
            ..self.mapper.clone()
        }
    }

    /// Triangulation options with the shared settings applied.
    pub fn triangulation(&self) -> TriangulationOptions {
        TriangulationOptions {
            min_focal_length_ratio: self.min_focal_length_ratio,
            max_focal_length_ratio: self.max_focal_length_ratio,
            max_extra_param: self.max_extra_param,
            ..self.triangulation.clone()
        }
    }

    /// Bundle adjustment options for the neighborhood of a new image.
    pub fn local_bundle_adjustment(&self) -> BundleAdjustmentOptions {
        BundleAdjustmentOptions {
            solver: SolverOptions {
                function_tolerance: 0.0,
                gradient_tolerance: 10.0,
                parameter_tolerance: 0.0,
                max_num_iterations: self.ba_local_max_num_iterations,
                max_linear_solver_iterations: 100,
                num_threads: self.num_threads,
            },
            loss_function: LossFunction::SoftL1,
            loss_function_scale: 1.0,
            refine_focal_length: self.ba_refine_focal_length,
            refine_principal_point: self.ba_refine_principal_point,
            refine_extra_params: self.ba_refine_extra_params,
            min_num_residuals_for_multi_threading: self.ba_min_num_residuals_for_multi_threading,
            min_num_reg_images: self.triangulation.min_num_reg_images,
        }
    }

    /// Bundle adjustment options for the whole model.
    pub fn global_bundle_adjustment(&self) -> BundleAdjustmentOptions {
        BundleAdjustmentOptions {
            solver: SolverOptions {
                function_tolerance: 0.0,
                gradient_tolerance: 1.0,
                parameter_tolerance: 0.0,
                max_num_iterations: self.ba_global_max_num_iterations,
                max_linear_solver_iterations: 100,
                num_threads: self.num_threads,
            },
            loss_function: LossFunction::Trivial,
            loss_function_scale: 1.0,
            refine_focal_length: self.ba_refine_focal_length,
            refine_principal_point: self.ba_refine_principal_point,
            refine_extra_params: self.ba_refine_extra_params,
            min_num_residuals_for_multi_threading: self.ba_min_num_residuals_for_multi_threading,
            min_num_reg_images: self.triangulation.min_num_reg_images,
        }
    }

    /// Correspondence load parameters.
    pub fn load_request(&self) -> LoadRequest {
        LoadRequest {
            min_num_matches: self.min_num_matches,
            ignore_watermarks: self.ignore_watermarks,
            image_names: self.image_names.clone(),
        }
    }
}
