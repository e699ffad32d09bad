//! Refinement invoker and trigger policy.
//!
//! Local refinement runs after every registered image and is scoped to the
//! points touched since the previous local pass. Global refinement runs when
//! the model has grown enough since the previous global pass, when growth is
//! stuck, and once when a model is finished.

use tracing::{debug, info, warn};

use crate::config::{BundleAdjustmentOptions, LossFunction, MapperOptions};
use crate::engine::{BundleAdjuster, TrackTriangulator};
use crate::model::{ImageId, Reconstruction};

use super::tracks;

/// Outcome of one local refinement loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocalRefinementSummary {
    /// Bundle adjustments run.
    pub num_iterations: usize,
    /// Change ratio of the last iteration.
    pub last_change: f64,
    /// Observations changed over all iterations.
    pub num_changed_observations: usize,
}

/// Outcome of one global refinement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GlobalRefinementSummary {
    pub num_iterations: usize,
    pub last_change: f64,
    pub num_retriangulated: usize,
    pub num_filtered_images: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Local refinement
// ─────────────────────────────────────────────────────────────────────────────

/// Refine the neighborhood of a freshly registered image.
///
/// Runs up to `ba_local_max_refinements` local adjustments. The first one
/// uses the configured robust loss, later ones a trivial loss. Stops once
/// `(merged + completed + filtered) / (adjusted + 1)` drops below
/// `ba_local_max_refinement_change`. The modified-point set of the engine is
/// cleared afterwards.
pub fn iterative_local_refinement<E>(
    engine: &mut E,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
    image_id: ImageId,
) -> LocalRefinementSummary
where
    E: BundleAdjuster + TrackTriangulator + ?Sized,
{
    let mapper_options = options.mapper();
    let triangulation = options.triangulation();
    let mut ba_options = options.local_bundle_adjustment();
    let mut summary = LocalRefinementSummary::default();

    for _ in 0..options.ba_local_max_refinements {
        let point_ids = engine.modified_points();
        let report = engine.adjust_local_bundle(
            reconstruction,
            &mapper_options,
            &ba_options,
            &triangulation,
            image_id,
            &point_ids,
        );

        let changed = report.num_changed_observations() as f64
            / (report.num_adjusted_observations + 1) as f64;
        summary.num_iterations += 1;
        summary.last_change = changed;
        summary.num_changed_observations += report.num_changed_observations();

        debug!(
            "[LocalBA] image {}: merged {}, completed {}, filtered {}, adjusted {}, changed {:.6}",
            image_id,
            report.num_merged_observations,
            report.num_completed_observations,
            report.num_filtered_observations,
            report.num_adjusted_observations,
            changed
        );

        if changed < options.ba_local_max_refinement_change {
            break;
        }

        ba_options.loss_function = LossFunction::Trivial;
    }

    engine.clear_modified_points();
    summary
}

// ─────────────────────────────────────────────────────────────────────────────
// Global refinement
// ─────────────────────────────────────────────────────────────────────────────

/// Global adjustment options for a model with `num_reg_images` registered
/// images.
///
/// Small models get tolerances divided by 10, twice the iterations and a
/// larger linear solver budget. Extra camera parameters are only refined
/// once enough images constrain them.
pub fn global_bundle_adjustment_options(options: &MapperOptions, num_reg_images: usize) -> BundleAdjustmentOptions {
    let mut ba_options = options.global_bundle_adjustment();

    ba_options.refine_extra_params = options.ba_refine_extra_params
        && num_reg_images >= options.ba_global_extra_params_min_num_reg_images;

    if num_reg_images < options.ba_global_min_num_reg_images_fast {
        let solver = &mut ba_options.solver;
        solver.function_tolerance /= 10.0;
        solver.gradient_tolerance /= 10.0;
        solver.parameter_tolerance /= 10.0;
        solver.max_num_iterations *= 2;
        solver.max_linear_solver_iterations = 200;
    }

    ba_options
}

/// Run one global bundle adjustment with size-dependent options.
pub fn adjust_global_bundle<E: BundleAdjuster + ?Sized>(
    engine: &mut E,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
) -> bool {
    let num_reg_images = reconstruction.num_reg_images();
    let ba_options = global_bundle_adjustment_options(options, num_reg_images);

    info!(
        "[GlobalBA] {} images, {} points, max {} iterations",
        num_reg_images,
        reconstruction.num_points3d(),
        ba_options.solver.max_num_iterations
    );

    let success = engine.adjust_global_bundle(reconstruction, &options.mapper(), &ba_options);
    if !success {
        warn!("[GlobalBA] solver did not converge to a usable solution");
    }
    success
}

/// Retriangulate, then alternate global adjustment and track maintenance
/// until the observation change ratio drops below
/// `ba_global_max_refinement_change`. Filters images once at the end.
pub fn iterative_global_refinement<E>(
    engine: &mut E,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
) -> GlobalRefinementSummary
where
    E: BundleAdjuster + TrackTriangulator + ?Sized,
{
    let mut summary = GlobalRefinementSummary::default();

    tracks::complete_and_merge_tracks(engine, reconstruction, options);
    summary.num_retriangulated = tracks::retriangulate(engine, reconstruction, options);

    for _ in 0..options.ba_global_max_refinements {
        let num_observations = reconstruction.compute_num_observations();
        let mut num_changed_observations = 0;
        adjust_global_bundle(engine, reconstruction, options);
        num_changed_observations += tracks::complete_and_merge_tracks(engine, reconstruction, options);
        num_changed_observations += tracks::filter_points(engine, reconstruction, options);

        let changed = num_changed_observations as f64 / num_observations.max(1) as f64;
        summary.num_iterations += 1;
        summary.last_change = changed;
        debug!("[GlobalBA] changed observations {:.6}", changed);

        if changed < options.ba_global_max_refinement_change {
            break;
        }
    }

    summary.num_filtered_images = tracks::filter_images(engine, reconstruction, options);
    summary
}

// ─────────────────────────────────────────────────────────────────────────────
// Trigger policy
// ─────────────────────────────────────────────────────────────────────────────

/// Model size at the previous global refinement.
///
/// Owned by one attempt: every model starts its own trigger history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalRefinementTrigger {
    prev_num_reg_images: usize,
    prev_num_points: usize,
}

impl GlobalRefinementTrigger {
    pub fn new(num_reg_images: usize, num_points: usize) -> Self {
        Self {
            prev_num_reg_images: num_reg_images,
            prev_num_points: num_points,
        }
    }

    /// Start from the current size of `reconstruction`.
    pub fn from_reconstruction(reconstruction: &Reconstruction) -> Self {
        Self::new(reconstruction.num_reg_images(), reconstruction.num_points3d())
    }

    pub fn prev_num_reg_images(&self) -> usize {
        self.prev_num_reg_images
    }

    pub fn prev_num_points(&self) -> usize {
        self.prev_num_points
    }

    /// True if any of the image/point ratio or frequency conditions holds.
    pub fn should_refine(&self, options: &MapperOptions, num_reg_images: usize, num_points: usize) -> bool {
        let reg = num_reg_images as f64;
        let points = num_points as f64;
        reg >= options.ba_global_images_ratio * self.prev_num_reg_images as f64
            || num_reg_images >= options.ba_global_images_freq + self.prev_num_reg_images
            || points >= options.ba_global_points_ratio * self.prev_num_points as f64
            || num_points >= options.ba_global_points_freq + self.prev_num_points
    }

    /// Remember the model size right after a triggered global pass.
    pub fn record(&mut self, num_reg_images: usize, num_points: usize) {
        self.prev_num_reg_images = num_reg_images;
        self.prev_num_points = num_points;
    }

    /// True if both counts differ from the ones of the previous global pass.
    pub fn changed_since_last(&self, num_reg_images: usize, num_points: usize) -> bool {
        num_reg_images != self.prev_num_reg_images && num_points != self.prev_num_points
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use approx::assert_relative_eq;

    use super::*;
    use crate::config::{RegistrationOptions, TriangulationOptions};
    use crate::engine::LocalBundleReport;
    use crate::model::Point3DId;

    /// Replays scripted local reports and records the options it was given.
    #[derive(Default)]
    struct ScriptedEngine {
        local_reports: VecDeque<LocalBundleReport>,
        losses: Vec<LossFunction>,
        global_options: Vec<BundleAdjustmentOptions>,
        filtered_per_round: VecDeque<usize>,
        cleared: usize,
        image_filters: usize,
    }

    impl BundleAdjuster for ScriptedEngine {
        fn adjust_local_bundle(
            &mut self,
            _: &mut Reconstruction,
            _: &RegistrationOptions,
            ba_options: &BundleAdjustmentOptions,
            _: &TriangulationOptions,
            _: ImageId,
            _: &HashSet<Point3DId>,
        ) -> LocalBundleReport {
            self.losses.push(ba_options.loss_function);
            self.local_reports.pop_front().unwrap_or_default()
        }

        fn adjust_global_bundle(
            &mut self,
            _: &mut Reconstruction,
            _: &RegistrationOptions,
            ba_options: &BundleAdjustmentOptions,
        ) -> bool {
            self.global_options.push(ba_options.clone());
            true
        }
    }

    impl TrackTriangulator for ScriptedEngine {
        fn triangulate_image(&mut self, _: &mut Reconstruction, _: &TriangulationOptions, _: ImageId) -> usize {
            0
        }
        fn retriangulate(&mut self, _: &mut Reconstruction, _: &TriangulationOptions) -> usize {
            0
        }
        fn complete_tracks(&mut self, _: &mut Reconstruction, _: &TriangulationOptions) -> usize {
            0
        }
        fn merge_tracks(&mut self, _: &mut Reconstruction, _: &TriangulationOptions) -> usize {
            0
        }
        fn filter_points(&mut self, _: &mut Reconstruction, _: &RegistrationOptions) -> usize {
            self.filtered_per_round.pop_front().unwrap_or(0)
        }
        fn filter_images(&mut self, _: &mut Reconstruction, _: &RegistrationOptions) -> usize {
            self.image_filters += 1;
            0
        }
        fn modified_points(&self) -> HashSet<Point3DId> {
            HashSet::new()
        }
        fn clear_modified_points(&mut self) {
            self.cleared += 1;
        }
    }

    fn report(changed: usize, adjusted: usize) -> LocalBundleReport {
        LocalBundleReport {
            num_filtered_observations: changed,
            num_adjusted_observations: adjusted,
            ..Default::default()
        }
    }

    #[test]
    fn test_local_refinement_switches_to_trivial_loss() {
        let mut engine = ScriptedEngine {
            local_reports: VecDeque::from(vec![report(50, 99), report(0, 99)]),
            ..Default::default()
        };
        let mut rec = Reconstruction::new();
        let options = MapperOptions::default();

        let summary = iterative_local_refinement(&mut engine, &mut rec, &options, ImageId::new(1));

        assert_eq!(summary.num_iterations, 2);
        assert_eq!(engine.losses, vec![LossFunction::SoftL1, LossFunction::Trivial]);
        assert_relative_eq!(summary.last_change, 0.0);
        assert_eq!(engine.cleared, 1);
    }

    #[test]
    fn test_local_refinement_stops_on_convergence() {
        let mut engine = ScriptedEngine {
            local_reports: VecDeque::from(vec![report(0, 500), report(80, 500)]),
            ..Default::default()
        };
        let mut rec = Reconstruction::new();
        let options = MapperOptions::default();

        let summary = iterative_local_refinement(&mut engine, &mut rec, &options, ImageId::new(1));

        assert_eq!(summary.num_iterations, 1);
        assert_eq!(engine.losses, vec![LossFunction::SoftL1]);
    }

    #[test]
    fn test_local_refinement_bounded_by_max_refinements() {
        let mut engine = ScriptedEngine {
            local_reports: VecDeque::from(vec![report(10, 9); 10]),
            ..Default::default()
        };
        let mut rec = Reconstruction::new();
        let options = MapperOptions {
            ba_local_max_refinements: 3,
            ..Default::default()
        };

        let summary = iterative_local_refinement(&mut engine, &mut rec, &options, ImageId::new(1));

        assert_eq!(summary.num_iterations, 3);
        assert_relative_eq!(summary.last_change, 1.0);
        assert_eq!(summary.num_changed_observations, 30);
    }

    #[test]
    fn test_global_options_tightened_for_small_models() {
        let options = MapperOptions::default();

        let small = global_bundle_adjustment_options(&options, 4);
        assert_relative_eq!(small.solver.gradient_tolerance, 0.1);
        assert_eq!(small.solver.max_num_iterations, 100);
        assert_eq!(small.solver.max_linear_solver_iterations, 200);
        assert!(!small.refine_extra_params);

        let large = global_bundle_adjustment_options(&options, 20);
        assert_relative_eq!(large.solver.gradient_tolerance, 1.0);
        assert_eq!(large.solver.max_num_iterations, 50);
        assert_eq!(large.solver.max_linear_solver_iterations, 100);
        assert!(large.refine_extra_params);

        let no_extra = MapperOptions {
            ba_refine_extra_params: false,
            ..Default::default()
        };
        assert!(!global_bundle_adjustment_options(&no_extra, 20).refine_extra_params);
    }

    #[test]
    fn test_global_refinement_stops_when_change_is_small() {
        // Empty model: the change ratio divides by max(observations, 1).
        let mut engine = ScriptedEngine {
            filtered_per_round: VecDeque::from(vec![5, 5, 0]),
            ..Default::default()
        };
        let mut rec = Reconstruction::new();
        let options = MapperOptions::default();

        let summary = iterative_global_refinement(&mut engine, &mut rec, &options);

        assert_eq!(summary.num_iterations, 3);
        assert_eq!(engine.global_options.len(), 3);
        assert_eq!(engine.image_filters, 1);
        assert_relative_eq!(summary.last_change, 0.0);
    }

    #[test]
    fn test_trigger_uses_previous_trigger_counts() {
        let options = MapperOptions {
            ba_global_images_ratio: 1.5,
            ba_global_images_freq: 10,
            ba_global_points_ratio: 2.0,
            ba_global_points_freq: 1000,
            ..Default::default()
        };
        let mut trigger = GlobalRefinementTrigger::new(4, 100);

        // Nothing crossed.
        assert!(!trigger.should_refine(&options, 5, 150));
        // Image ratio only: 6 >= 1.5 * 4.
        assert!(trigger.should_refine(&options, 6, 150));
        // Point ratio only: 200 >= 2.0 * 100.
        assert!(trigger.should_refine(&options, 5, 200));

        trigger.record(40, 800);
        // Against the new baseline, 6 images are no longer a trigger.
        assert!(!trigger.should_refine(&options, 41, 900));
        // Image frequency only: 50 >= 40 + 10, while 50 < 1.5 * 40.
        assert!(trigger.should_refine(&options, 50, 900));

        trigger.record(100, 5000);
        assert!(!trigger.should_refine(&options, 101, 5999));
        // Point frequency only: 6000 >= 5000 + 1000, while 6000 < 2.0 * 5000.
        assert!(trigger.should_refine(&options, 101, 6000));
    }

    #[test]
    fn test_changed_since_last_needs_both_counts() {
        let trigger = GlobalRefinementTrigger::new(10, 500);
        assert!(trigger.changed_since_last(11, 510));
        assert!(!trigger.changed_since_last(10, 510));
        assert!(!trigger.changed_since_last(11, 500));
    }
}
