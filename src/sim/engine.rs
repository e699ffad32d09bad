//! Synthetic engines backed by a `SyntheticScene`.
//!
//! Registration places images at their true pose, triangulation creates
//! tracks from ground-truth visibility, and filtering removes the scene's
//! outlier observations. Nothing is optimized: the adjusters only record
//! what they were asked to do in an `EngineJournal`, which tests read
//! through a shared handle after the engine has been moved into a
//! controller.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{BundleAdjustmentOptions, LossFunction, RegistrationOptions, TriangulationOptions};
use crate::engine::{
    BundleAdjuster, ColorSampler, LocalBundleReport, PoseRegistrar, SeedTuple, TrackTriangulator,
};
use crate::io::CorrespondenceCache;
use crate::model::{ImageId, Point3DId, Reconstruction, TrackElement};

use super::scene::SyntheticScene;

/// One recorded global adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalAdjustmentRecord {
    pub num_reg_images: usize,
    pub max_num_iterations: usize,
    pub refine_extra_params: bool,
}

/// Calls observed by a `SyntheticEngine`.
#[derive(Debug, Clone, Default)]
pub struct EngineJournal {
    pub num_begun: usize,
    /// `discard` flag of every `end_reconstruction`.
    pub ended: Vec<bool>,
    pub initializations: Vec<(SeedTuple, bool)>,
    pub registrations: Vec<(ImageId, bool)>,
    pub local_losses: Vec<LossFunction>,
    pub global_adjustments: Vec<GlobalAdjustmentRecord>,
    pub num_calibrations: usize,
    pub filtered_images: Vec<ImageId>,
}

impl EngineJournal {
    pub fn num_discarded(&self) -> usize {
        self.ended.iter().filter(|&&discard| discard).count()
    }

    pub fn registered_images(&self) -> Vec<ImageId> {
        self.registrations
            .iter()
            .filter(|(_, success)| *success)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Registrar, triangulator and adjuster in one, driven by ground truth.
pub struct SyntheticEngine {
    scene: Arc<SyntheticScene>,
    journal: Arc<Mutex<EngineJournal>>,
    modified_points: HashSet<Point3DId>,
    reg_trials: HashMap<ImageId, usize>,
    /// Number of models each image is registered in.
    num_registrations: HashMap<ImageId, usize>,
}

impl SyntheticEngine {
    pub fn new(scene: Arc<SyntheticScene>) -> Self {
        Self {
            scene,
            journal: Arc::new(Mutex::new(EngineJournal::default())),
            modified_points: HashSet::new(),
            reg_trials: HashMap::new(),
            num_registrations: HashMap::new(),
        }
    }

    /// Shared handle on the journal.
    pub fn journal(&self) -> Arc<Mutex<EngineJournal>> {
        Arc::clone(&self.journal)
    }

    pub fn scene(&self) -> &SyntheticScene {
        &self.scene
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ground-truth helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Point a landmark was triangulated as, if any.
    fn landmark_point(&self, reconstruction: &Reconstruction, landmark: usize) -> Option<Point3DId> {
        let landmark_data = self.scene.landmark(landmark)?;
        landmark_data.observers.iter().find_map(|&observer| {
            reconstruction
                .image(observer)
                .filter(|image| image.is_registered())
                .and_then(|image| image.point3d_id(landmark as u32))
        })
    }

    /// Number of triangulated landmarks `image_id` sees.
    fn num_visible_points(&self, reconstruction: &Reconstruction, image_id: ImageId) -> usize {
        self.scene
            .image(image_id)
            .map(|image| {
                image
                    .landmarks
                    .iter()
                    .filter(|&&landmark| self.landmark_point(reconstruction, landmark).is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    fn is_free(reconstruction: &Reconstruction, image_id: ImageId, landmark: usize) -> bool {
        reconstruction
            .image(image_id)
            .map(|image| image.is_registered() && image.point3d_id(landmark as u32).is_none())
            .unwrap_or(false)
    }

    /// Add observations of `image_id` to existing tracks.
    fn continue_tracks(&mut self, reconstruction: &mut Reconstruction, image_id: ImageId, with_outliers: bool) -> usize {
        let Some(image) = self.scene.image(image_id) else {
            return 0;
        };
        let mut num_added = 0;
        for &landmark in &image.landmarks {
            if !with_outliers && self.scene.is_outlier(image_id, landmark) {
                continue;
            }
            if !Self::is_free(reconstruction, image_id, landmark) {
                continue;
            }
            if let Some(point_id) = self.landmark_point(reconstruction, landmark) {
                let el = TrackElement::new(image_id, landmark as u32);
                if reconstruction.add_observation(point_id, el).is_ok() {
                    self.modified_points.insert(point_id);
                    num_added += 1;
                }
            }
        }
        num_added
    }

    /// Create tracks for landmarks of `image_id` that no point represents
    /// yet and that another registered image also sees.
    fn create_tracks(&mut self, reconstruction: &mut Reconstruction, image_id: ImageId) -> usize {
        let Some(image) = self.scene.image(image_id) else {
            return 0;
        };
        let mut num_added = 0;
        for &landmark in &image.landmarks {
            if self.scene.is_outlier(image_id, landmark) || !Self::is_free(reconstruction, image_id, landmark) {
                continue;
            }
            if self.landmark_point(reconstruction, landmark).is_some() {
                continue;
            }
            let Some(landmark_data) = self.scene.landmark(landmark) else {
                continue;
            };
            let track: Vec<TrackElement> = landmark_data
                .observers
                .iter()
                .filter(|&&observer| {
                    observer == image_id
                        || (!self.scene.is_outlier(observer, landmark)
                            && Self::is_free(reconstruction, observer, landmark))
                })
                .map(|&observer| TrackElement::new(observer, landmark as u32))
                .collect();
            if track.len() < 2 {
                continue;
            }
            let track_length = track.len();
            if let Ok(point_id) = reconstruction.add_point3d(landmark_data.xyz, track) {
                self.modified_points.insert(point_id);
                num_added += track_length;
            }
        }
        num_added
    }

    /// Remove outlier observations of `point_ids`.
    fn remove_outliers(&self, reconstruction: &mut Reconstruction, point_ids: &[Point3DId]) -> usize {
        let outliers: Vec<TrackElement> = point_ids
            .iter()
            .filter_map(|&id| reconstruction.point3d(id))
            .flat_map(|point| point.track.iter().copied())
            .filter(|el| self.scene.is_outlier(el.image_id, el.point2d_idx as usize))
            .collect();
        outliers
            .into_iter()
            .map(|el| reconstruction.delete_observation(el.image_id, el.point2d_idx))
            .sum()
    }

    fn is_registered_elsewhere(&self, image_id: ImageId) -> bool {
        self.num_registrations.get(&image_id).copied().unwrap_or(0) > 0
    }

    fn add_registration(&mut self, image_id: ImageId) {
        *self.num_registrations.entry(image_id).or_insert(0) += 1;
    }

    fn remove_registration(&mut self, image_id: ImageId) {
        if let Some(count) = self.num_registrations.get_mut(&image_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn all_point_ids(reconstruction: &Reconstruction) -> Vec<Point3DId> {
        reconstruction.point3d_ids().copied().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

impl PoseRegistrar for SyntheticEngine {
    fn begin_reconstruction(&mut self, reconstruction: &Reconstruction, _cache: &CorrespondenceCache) {
        self.reg_trials.clear();
        self.modified_points.clear();
        for &image_id in reconstruction.reg_image_ids() {
            self.add_registration(image_id);
        }
        self.journal.lock().num_begun += 1;
        debug!(
            "[SimEngine] begin with {} registered images",
            reconstruction.num_reg_images()
        );
    }

    fn end_reconstruction(&mut self, reconstruction: &mut Reconstruction, discard: bool) {
        if discard {
            let reg_image_ids = reconstruction.reg_image_ids().to_vec();
            for image_id in reg_image_ids {
                reconstruction.deregister_image(image_id);
                self.remove_registration(image_id);
            }
        }
        self.modified_points.clear();
        self.journal.lock().ended.push(discard);
    }

    fn find_initial_tuples(
        &mut self,
        reconstruction: &Reconstruction,
        _options: &RegistrationOptions,
        max_num_tuples: usize,
    ) -> Vec<SeedTuple> {
        let exclusive = self.scene.config.exclusive_seeds;
        self.scene
            .seed_tuples()
            .into_iter()
            .filter(|tuple| tuple.iter().all(|&id| reconstruction.image(id).is_some()))
            .filter(|tuple| !exclusive || !tuple.iter().any(|&id| self.is_registered_elsewhere(id)))
            .take(max_num_tuples)
            .collect()
    }

    fn register_initial_tuple(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &RegistrationOptions,
        _triangulation: &TriangulationOptions,
        tuple: &SeedTuple,
    ) -> bool {
        let config = &self.scene.config;
        let strong_enough = config.init_num_inliers >= options.init_min_num_inliers
            && config.init_tri_angle >= options.init_min_tri_angle;
        let usable = tuple.iter().all(|&id| {
            !config.failing_images.contains(&id)
                && !(config.exclusive_seeds && self.is_registered_elsewhere(id))
                && self.scene.image(id).is_some()
                && reconstruction
                    .image(id)
                    .map(|image| !image.is_registered())
                    .unwrap_or(false)
        });

        let success = strong_enough && usable && {
            let registered = tuple.iter().all(|&id| match self.scene.image(id) {
                Some(image) => reconstruction.register_image(id, image.pose.clone()).is_ok(),
                None => false,
            });
            registered && {
                for &id in tuple {
                    self.add_registration(id);
                }
                for &id in tuple {
                    self.create_tracks(reconstruction, id);
                }
                reconstruction.num_points3d() > 0
            }
        };

        trace!("[SimEngine] initialize {:?}: {}", tuple, success);
        self.journal.lock().initializations.push((*tuple, success));
        success
    }

    fn find_next_images(&mut self, reconstruction: &Reconstruction, options: &RegistrationOptions) -> Vec<ImageId> {
        let mut ranked: Vec<(usize, ImageId)> = reconstruction
            .images()
            .filter(|image| !image.is_registered())
            .filter(|image| self.reg_trials.get(&image.id).copied().unwrap_or(0) < options.max_reg_trials)
            .map(|image| (self.num_visible_points(reconstruction, image.id), image.id))
            .filter(|(num_visible, _)| *num_visible > 0)
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    fn register_next_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        options: &RegistrationOptions,
        image_id: ImageId,
    ) -> bool {
        *self.reg_trials.entry(image_id).or_insert(0) += 1;

        let num_visible = self.num_visible_points(reconstruction, image_id);
        let success = !self.scene.config.failing_images.contains(&image_id)
            && num_visible >= options.abs_pose_min_num_inliers
            && match self.scene.image(image_id) {
                Some(image) => reconstruction.register_image(image_id, image.pose.clone()).is_ok(),
                None => false,
            };

        if success {
            self.add_registration(image_id);
            self.continue_tracks(reconstruction, image_id, true);
        }
        trace!(
            "[SimEngine] register {} with {} visible points: {}",
            image_id,
            num_visible,
            success
        );
        self.journal.lock().registrations.push((image_id, success));
        success
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Triangulation
// ─────────────────────────────────────────────────────────────────────────────

impl TrackTriangulator for SyntheticEngine {
    fn triangulate_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        _options: &TriangulationOptions,
        image_id: ImageId,
    ) -> usize {
        self.continue_tracks(reconstruction, image_id, false) + self.create_tracks(reconstruction, image_id)
    }

    fn retriangulate(&mut self, reconstruction: &mut Reconstruction, _options: &TriangulationOptions) -> usize {
        let reg_image_ids = reconstruction.reg_image_ids().to_vec();
        reg_image_ids
            .into_iter()
            .map(|id| self.create_tracks(reconstruction, id))
            .sum()
    }

    fn complete_tracks(&mut self, reconstruction: &mut Reconstruction, _options: &TriangulationOptions) -> usize {
        let reg_image_ids = reconstruction.reg_image_ids().to_vec();
        reg_image_ids
            .into_iter()
            .map(|id| self.continue_tracks(reconstruction, id, false))
            .sum()
    }

    fn merge_tracks(&mut self, _reconstruction: &mut Reconstruction, _options: &TriangulationOptions) -> usize {
        // Tracks are keyed by landmark, so there is never a duplicate.
        0
    }

    fn filter_points(&mut self, reconstruction: &mut Reconstruction, _options: &RegistrationOptions) -> usize {
        let point_ids = Self::all_point_ids(reconstruction);
        self.remove_outliers(reconstruction, &point_ids)
    }

    fn filter_images(&mut self, reconstruction: &mut Reconstruction, options: &RegistrationOptions) -> usize {
        let bogus: Vec<ImageId> = reconstruction
            .reg_image_ids()
            .iter()
            .copied()
            .filter(|&id| {
                reconstruction
                    .image(id)
                    .and_then(|image| reconstruction.camera(image.camera_id))
                    .map(|camera| {
                        camera.has_bogus_focal_length(options.min_focal_length_ratio, options.max_focal_length_ratio)
                    })
                    .unwrap_or(true)
            })
            .collect();

        for &id in &bogus {
            reconstruction.deregister_image(id);
            self.remove_registration(id);
        }
        self.journal.lock().filtered_images.extend(bogus.iter().copied());
        bogus.len()
    }

    fn modified_points(&self) -> HashSet<Point3DId> {
        self.modified_points.clone()
    }

    fn clear_modified_points(&mut self) {
        self.modified_points.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adjustment
// ─────────────────────────────────────────────────────────────────────────────

impl BundleAdjuster for SyntheticEngine {
    fn adjust_local_bundle(
        &mut self,
        reconstruction: &mut Reconstruction,
        _options: &RegistrationOptions,
        ba_options: &BundleAdjustmentOptions,
        _triangulation: &TriangulationOptions,
        image_id: ImageId,
        point_ids: &HashSet<Point3DId>,
    ) -> LocalBundleReport {
        self.journal.lock().local_losses.push(ba_options.loss_function);

        let mut point_ids: Vec<Point3DId> = point_ids.iter().copied().collect();
        point_ids.sort();

        let num_adjusted_observations = point_ids
            .iter()
            .filter_map(|&id| reconstruction.point3d(id))
            .map(|point| point.track_length())
            .sum();

        // Complete the touched tracks from every registered observer.
        let mut num_completed_observations = 0;
        for &point_id in &point_ids {
            let Some(landmark) = reconstruction
                .point3d(point_id)
                .and_then(|point| point.track.first())
                .map(|el| el.point2d_idx as usize)
            else {
                continue;
            };
            let Some(landmark_data) = self.scene.landmark(landmark) else {
                continue;
            };
            for &observer in &landmark_data.observers {
                if self.scene.is_outlier(observer, landmark) || !Self::is_free(reconstruction, observer, landmark) {
                    continue;
                }
                if reconstruction
                    .add_observation(point_id, TrackElement::new(observer, landmark as u32))
                    .is_ok()
                {
                    num_completed_observations += 1;
                }
            }
        }

        let num_filtered_observations = self.remove_outliers(reconstruction, &point_ids);

        debug!(
            "[SimEngine] local bundle around {}: {} points, {} completed, {} filtered",
            image_id,
            point_ids.len(),
            num_completed_observations,
            num_filtered_observations
        );
        LocalBundleReport {
            num_merged_observations: 0,
            num_completed_observations,
            num_filtered_observations,
            num_adjusted_observations,
        }
    }

    fn adjust_global_bundle(
        &mut self,
        reconstruction: &mut Reconstruction,
        _options: &RegistrationOptions,
        ba_options: &BundleAdjustmentOptions,
    ) -> bool {
        let num_reg_images = reconstruction.num_reg_images();
        self.journal.lock().global_adjustments.push(GlobalAdjustmentRecord {
            num_reg_images,
            max_num_iterations: ba_options.solver.max_num_iterations,
            refine_extra_params: ba_options.refine_extra_params,
        });
        num_reg_images >= 2
    }

    fn calibrate_cameras(
        &mut self,
        _reconstruction: &mut Reconstruction,
        _options: &RegistrationOptions,
        _triangulation: &TriangulationOptions,
    ) -> usize {
        self.journal.lock().num_calibrations += 1;
        0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Colors
// ─────────────────────────────────────────────────────────────────────────────

/// Colors points with their ground-truth landmark color.
pub struct SyntheticColorSampler {
    scene: Arc<SyntheticScene>,
}

impl SyntheticColorSampler {
    pub fn new(scene: Arc<SyntheticScene>) -> Self {
        Self { scene }
    }
}

impl ColorSampler for SyntheticColorSampler {
    fn extract_colors(&mut self, reconstruction: &mut Reconstruction, image_id: ImageId, _image_path: &Path) -> bool {
        if self.scene.config.unreadable_images.contains(&image_id) {
            return false;
        }
        let Some(image) = reconstruction.image(image_id) else {
            return false;
        };
        let colors: Vec<(Point3DId, [u8; 3])> = image
            .point3d_ids()
            .filter_map(|(idx, point_id)| {
                self.scene
                    .landmark(idx as usize)
                    .map(|landmark| (point_id, landmark.color))
            })
            .collect();
        for (point_id, color) in colors {
            reconstruction.set_point_color(point_id, color);
        }
        true
    }
}
