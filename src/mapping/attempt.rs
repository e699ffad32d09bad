//! Attempt state machine.
//!
//! One reconstruction pass runs a sequence of attempts. Each attempt drives
//! exactly one model through
//!
//! ```text
//! SelectModel -> Seed -> Initialize -> Grow -> Finalize -> Done
//!                  |         |
//!                  |         +-> Discard -> Done (next trial)
//!                  +-> SeedsExhausted -> Done (end of pass)
//! ```
//!
//! The seed tuples are proposed once per pass (on trial 0) and trial `t`
//! consumes tuple `t`. Trigger history for global refinement is local to the
//! attempt, so every model starts from its own baseline.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{MapperOptions, RegistrationOptions};
use crate::engine::{BundleAdjuster, ColorSampler, MapperEngine, PoseRegistrar, SeedTuple};
use crate::io::{write_snapshot, CorrespondenceCache, SnapshotWriter};
use crate::model::{ImageId, ModelIndex, ModelPool, Reconstruction, ReconstructionSummary};
use crate::system::{CallbackRegistry, LifecycleSignal, MapperEvent};

use super::refinement::{self, GlobalRefinementTrigger};
use super::{registration, tracks};

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Why a model was removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The seed tuple could not be registered.
    InitializationFailed,
    /// The seed registered but nothing survived the first refinement.
    EmptyAfterInitialization,
    /// The finished model is smaller than its size floor.
    BelowMinModelSize { num_reg_images: usize, min_model_size: usize },
    /// The finished model has no registered image left.
    NoRegisteredImages,
}

/// Why the growth loop of a model ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthTermination {
    /// No unregistered candidate left.
    NoCandidates,
    /// Two consecutive rounds registered nothing, the second one after a
    /// forced global refinement.
    RegistrationFailed,
    /// The model shares `max_model_overlap` images with other models.
    ModelOverlap,
    /// Stop requested.
    Stopped,
}

/// Final state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Kept { model_index: ModelIndex },
    Discarded(DiscardReason),
    /// Stopped mid-growth. The partial model stays in the pool.
    Stopped { model_index: ModelIndex },
    /// No seed tuple left for this trial.
    SeedsExhausted,
}

/// What the pass does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassControl {
    NextTrial,
    EndPass,
    StopRun,
}

/// Record of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub trial: usize,
    pub seed: Option<SeedTuple>,
    pub resumed: bool,
    pub outcome: AttemptOutcome,
    pub termination: Option<GrowthTermination>,
    /// Model size when the attempt ended.
    pub summary: ReconstructionSummary,
    pub num_global_refinements: usize,
}

impl AttemptReport {
    fn new(trial: usize, resumed: bool) -> Self {
        Self {
            trial,
            seed: None,
            resumed,
            outcome: AttemptOutcome::SeedsExhausted,
            termination: None,
            summary: ReconstructionSummary::default(),
            num_global_refinements: 0,
        }
    }
}

/// Record of one reconstruction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Initialization options the pass seeded with.
    pub init_min_num_inliers: usize,
    pub init_min_tri_angle: f64,
    pub attempts: Vec<AttemptReport>,
    pub stopped: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Engines and side channels used by every attempt of a run.
pub struct MapperServices {
    pub engine: Box<dyn MapperEngine>,
    pub color_sampler: Option<Box<dyn ColorSampler>>,
    pub snapshot_writer: Box<dyn SnapshotWriter>,
    /// Directory the color sampler reads images from.
    pub image_path: PathBuf,
    pub callbacks: CallbackRegistry,
}

impl MapperServices {
    fn extract_colors(&mut self, reconstruction: &mut Reconstruction, image_id: ImageId) {
        let Some(sampler) = self.color_sampler.as_mut() else {
            return;
        };
        if !sampler.extract_colors(reconstruction, image_id, &self.image_path) {
            let name = reconstruction
                .image(image_id)
                .map(|image| image.name.clone())
                .unwrap_or_default();
            warn!(
                "[Mapper] Could not read image {} ({}) at path {}",
                image_id,
                name,
                self.image_path.display()
            );
        }
    }

    fn write_snapshot(&mut self, reconstruction: &Reconstruction, root: &Path) {
        write_snapshot(self.snapshot_writer.as_mut(), reconstruction, root);
    }

    fn fire(&mut self, event: MapperEvent) {
        self.callbacks.fire(&event);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum AttemptState {
    SelectModel,
    Seed(ModelIndex),
    Initialize(ModelIndex, SeedTuple),
    Grow(ModelIndex),
    Finalize(ModelIndex, GrowthTermination),
    Discard(ModelIndex, DiscardReason),
    SeedsExhausted(ModelIndex),
    Done(PassControl),
}

/// One reconstruction pass: up to `init_num_trials` attempts seeded with
/// `init_options`.
pub struct ReconstructionPass<'a> {
    options: &'a MapperOptions,
    init_options: &'a RegistrationOptions,
    cache: &'a CorrespondenceCache,
    services: &'a mut MapperServices,
    lifecycle: &'a LifecycleSignal,
    tuples: Vec<SeedTuple>,
}

impl<'a> ReconstructionPass<'a> {
    pub fn new(
        options: &'a MapperOptions,
        init_options: &'a RegistrationOptions,
        cache: &'a CorrespondenceCache,
        services: &'a mut MapperServices,
        lifecycle: &'a LifecycleSignal,
    ) -> Self {
        Self {
            options,
            init_options,
            cache,
            services,
            lifecycle,
            tuples: Vec::new(),
        }
    }

    /// Run attempts until the pass ends. A pool holding one model on entry
    /// resumes that model in the first attempt.
    pub fn run(&mut self, pool: &mut ModelPool) -> PassReport {
        let initial_reconstruction_given = !pool.is_empty();
        let mut report = PassReport {
            init_min_num_inliers: self.init_options.init_min_num_inliers,
            init_min_tri_angle: self.init_options.init_min_tri_angle,
            ..Default::default()
        };

        for trial in 0..self.options.init_num_trials {
            self.lifecycle.block_if_paused();
            if self.lifecycle.is_stopped() {
                report.stopped = true;
                break;
            }

            let resume = initial_reconstruction_given && trial == 0;
            let (attempt, control) = self.run_attempt(pool, trial, resume, initial_reconstruction_given);
            report.attempts.push(attempt);

            match control {
                PassControl::NextTrial => {}
                PassControl::EndPass => break,
                PassControl::StopRun => {
                    report.stopped = true;
                    break;
                }
            }
        }

        report
    }

    fn run_attempt(
        &mut self,
        pool: &mut ModelPool,
        trial: usize,
        resume: bool,
        initial_reconstruction_given: bool,
    ) -> (AttemptReport, PassControl) {
        let mut report = AttemptReport::new(trial, resume);
        let mut state = AttemptState::SelectModel;

        loop {
            debug!("[Mapper] trial {}: {:?}", trial, state);
            state = match state {
                AttemptState::SelectModel => {
                    let model_idx = if resume { 0 } else { pool.add() };
                    match pool.get_mut(model_idx) {
                        Some(reconstruction) => {
                            reconstruction.load(self.cache);
                            self.services.engine.begin_reconstruction(reconstruction, self.cache);
                            AttemptState::Seed(model_idx)
                        }
                        None => AttemptState::Done(PassControl::EndPass),
                    }
                }

                AttemptState::Seed(model_idx) => self.seed(pool, model_idx, trial, &mut report),

                AttemptState::Initialize(model_idx, tuple) => self.initialize(pool, model_idx, &tuple),

                AttemptState::Grow(model_idx) => self.grow(pool, model_idx, &mut report),

                AttemptState::Finalize(model_idx, termination) => {
                    report.termination = Some(termination);
                    self.finalize(pool, model_idx, termination, initial_reconstruction_given, &mut report)
                }

                AttemptState::Discard(model_idx, reason) => {
                    self.discard(pool, model_idx, &mut report);
                    report.outcome = AttemptOutcome::Discarded(reason);
                    AttemptState::Done(PassControl::NextTrial)
                }

                AttemptState::SeedsExhausted(model_idx) => {
                    if !resume {
                        self.discard(pool, model_idx, &mut report);
                    }
                    report.outcome = AttemptOutcome::SeedsExhausted;
                    AttemptState::Done(PassControl::EndPass)
                }

                AttemptState::Done(control) => return (report, control),
            };
        }
    }

    // ── Seed ────────────────────────────────────────────────────────────────

    fn seed(
        &mut self,
        pool: &mut ModelPool,
        model_idx: ModelIndex,
        trial: usize,
        report: &mut AttemptReport,
    ) -> AttemptState {
        let Some(reconstruction) = pool.get(model_idx) else {
            return AttemptState::Done(PassControl::EndPass);
        };

        if trial == 0 {
            self.tuples = registration::find_seed_tuples(
                self.services.engine.as_mut(),
                reconstruction,
                self.options,
                self.init_options,
            );
        }

        if reconstruction.num_reg_images() > 0 {
            // Resumed model: nothing to initialize.
            return AttemptState::Grow(model_idx);
        }

        match self.tuples.get(trial) {
            Some(&tuple) => {
                report.seed = Some(tuple);
                AttemptState::Initialize(model_idx, tuple)
            }
            None => {
                info!(
                    "[Mapper] no seed tuple left for trial {} ({} proposed)",
                    trial,
                    self.tuples.len()
                );
                AttemptState::SeedsExhausted(model_idx)
            }
        }
    }

    // ── Initialize ──────────────────────────────────────────────────────────

    fn initialize(&mut self, pool: &mut ModelPool, model_idx: ModelIndex, tuple: &SeedTuple) -> AttemptState {
        let Some(reconstruction) = pool.get_mut(model_idx) else {
            return AttemptState::Done(PassControl::EndPass);
        };
        let engine = self.services.engine.as_mut();

        if !registration::register_initial_tuple(engine, reconstruction, self.options, self.init_options, tuple) {
            return AttemptState::Discard(model_idx, DiscardReason::InitializationFailed);
        }

        refinement::adjust_global_bundle(engine, reconstruction, self.options);
        tracks::filter_points(engine, reconstruction, self.options);
        tracks::filter_images(engine, reconstruction, self.options);

        if reconstruction.num_reg_images() == 0 || reconstruction.num_points3d() == 0 {
            info!("[Mapper] initial images did not survive refinement");
            return AttemptState::Discard(model_idx, DiscardReason::EmptyAfterInitialization);
        }

        if self.options.extract_colors {
            for &image_id in tuple {
                self.services.extract_colors(reconstruction, image_id);
            }
        }

        info!(
            "[Mapper] initialized model {} with {} images and {} points",
            model_idx,
            reconstruction.num_reg_images(),
            reconstruction.num_points3d()
        );
        AttemptState::Grow(model_idx)
    }

    // ── Grow ────────────────────────────────────────────────────────────────

    fn grow(&mut self, pool: &mut ModelPool, model_idx: ModelIndex, report: &mut AttemptReport) -> AttemptState {
        let options = self.options;
        let Some((reconstruction, others)) = pool.split_mut(model_idx) else {
            return AttemptState::Done(PassControl::EndPass);
        };

        self.services.fire(MapperEvent::InitialImagePairRegistered {
            model_index: model_idx,
            seed: report.seed,
            summary: reconstruction.summary(),
        });

        let mut trigger = GlobalRefinementTrigger::from_reconstruction(reconstruction);
        let mut snapshot_prev_num_reg_images = reconstruction.num_reg_images();

        {
            let engine = self.services.engine.as_mut();
            tracks::filter_images(engine, reconstruction, options);
            engine.calibrate_cameras(reconstruction, &options.mapper(), &options.triangulation());
        }

        let mut reg_next_success = true;
        let mut prev_reg_next_success = true;

        while reg_next_success {
            self.lifecycle.block_if_paused();
            if self.lifecycle.is_stopped() {
                return AttemptState::Finalize(model_idx, GrowthTermination::Stopped);
            }

            reg_next_success = false;

            let candidates =
                registration::find_next_images(self.services.engine.as_mut(), reconstruction, options);
            if candidates.is_empty() {
                return self.finish_growth(reconstruction, model_idx, trigger, report, GrowthTermination::NoCandidates);
            }

            for (reg_trial, &image_id) in candidates.iter().enumerate() {
                let engine = self.services.engine.as_mut();
                if registration::register_next_image(engine, reconstruction, options, image_id) {
                    self.integrate_image(reconstruction, image_id, &mut trigger, report);

                    if options.snapshot_images_freq > 0
                        && reconstruction.num_reg_images()
                            >= options.snapshot_images_freq + snapshot_prev_num_reg_images
                    {
                        snapshot_prev_num_reg_images = reconstruction.num_reg_images();
                        if let Some(root) = options.snapshot_path.as_deref() {
                            self.services.write_snapshot(reconstruction, root);
                        }
                    }

                    self.services.fire(MapperEvent::NextImageRegistered {
                        model_index: model_idx,
                        image_id,
                        summary: reconstruction.summary(),
                    });

                    reg_next_success = true;
                    break;
                }

                // A seed that cannot be extended for a long time is not
                // worth more candidates in this round.
                if reg_trial + 1 >= options.init_max_reg_failures
                    && reconstruction.num_reg_images() < options.min_model_size
                {
                    debug!(
                        "[Mapper] {} failed candidates with only {} images registered",
                        reg_trial + 1,
                        reconstruction.num_reg_images()
                    );
                    break;
                }
            }

            let num_shared = others.num_shared_reg_images(reconstruction);
            if num_shared >= options.max_model_overlap {
                info!(
                    "[Mapper] model {} shares {} images with other models, stopping growth",
                    model_idx, num_shared
                );
                return self.finish_growth(reconstruction, model_idx, trigger, report, GrowthTermination::ModelOverlap);
            }

            if !reg_next_success && prev_reg_next_success {
                info!("[Mapper] no image registered, retrying after global refinement");
                reg_next_success = true;
                prev_reg_next_success = false;
                refinement::iterative_global_refinement(self.services.engine.as_mut(), reconstruction, options);
                report.num_global_refinements += 1;
            } else {
                prev_reg_next_success = reg_next_success;
            }
        }

        self.finish_growth(
            reconstruction,
            model_idx,
            trigger,
            report,
            GrowthTermination::RegistrationFailed,
        )
    }

    /// Triangulate, refine and color a freshly registered image.
    fn integrate_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        image_id: ImageId,
        trigger: &mut GlobalRefinementTrigger,
        report: &mut AttemptReport,
    ) {
        let options = self.options;
        let engine = self.services.engine.as_mut();

        tracks::triangulate_image(engine, reconstruction, options, image_id);
        refinement::iterative_local_refinement(engine, reconstruction, options, image_id);

        if trigger.should_refine(options, reconstruction.num_reg_images(), reconstruction.num_points3d()) {
            engine.calibrate_cameras(reconstruction, &options.mapper(), &options.triangulation());
            refinement::iterative_global_refinement(engine, reconstruction, options);
            trigger.record(reconstruction.num_reg_images(), reconstruction.num_points3d());
            report.num_global_refinements += 1;
        }

        if options.extract_colors {
            self.services.extract_colors(reconstruction, image_id);
        }
    }

    /// Run the final global refinement if the last one is stale.
    fn finish_growth(
        &mut self,
        reconstruction: &mut Reconstruction,
        model_idx: ModelIndex,
        trigger: GlobalRefinementTrigger,
        report: &mut AttemptReport,
        termination: GrowthTermination,
    ) -> AttemptState {
        let num_reg_images = reconstruction.num_reg_images();
        if num_reg_images >= 2 && trigger.changed_since_last(num_reg_images, reconstruction.num_points3d()) {
            refinement::iterative_global_refinement(self.services.engine.as_mut(), reconstruction, self.options);
            report.num_global_refinements += 1;
        }
        AttemptState::Finalize(model_idx, termination)
    }

    // ── Finalize ────────────────────────────────────────────────────────────

    fn finalize(
        &mut self,
        pool: &mut ModelPool,
        model_idx: ModelIndex,
        termination: GrowthTermination,
        initial_reconstruction_given: bool,
        report: &mut AttemptReport,
    ) -> AttemptState {
        let Some(reconstruction) = pool.get_mut(model_idx) else {
            return AttemptState::Done(PassControl::EndPass);
        };

        if termination == GrowthTermination::Stopped {
            self.services.engine.end_reconstruction(reconstruction, false);
            report.summary = reconstruction.summary();
            report.outcome = AttemptOutcome::Stopped { model_index: model_idx };
            info!(
                "[Mapper] stopped, keeping partial model {} with {} images",
                model_idx, report.summary.num_reg_images
            );
            self.services.fire(MapperEvent::LastImageRegistered {
                model_index: Some(model_idx),
                summary: report.summary,
            });
            return AttemptState::Done(PassControl::StopRun);
        }

        let num_reg_images = reconstruction.num_reg_images();
        let min_model_size = self.min_model_size();
        let discard_reason = if num_reg_images == 0 {
            Some(DiscardReason::NoRegisteredImages)
        } else if num_reg_images < min_model_size {
            Some(DiscardReason::BelowMinModelSize {
                num_reg_images,
                min_model_size,
            })
        } else {
            None
        };

        let kept_index = match discard_reason {
            Some(reason) => {
                info!("[Mapper] discarding model {}: {:?}", model_idx, reason);
                self.discard(pool, model_idx, report);
                report.outcome = AttemptOutcome::Discarded(reason);
                None
            }
            None => {
                self.services.engine.end_reconstruction(reconstruction, false);
                report.summary = reconstruction.summary();
                report.outcome = AttemptOutcome::Kept { model_index: model_idx };
                info!(
                    "[Mapper] keeping model {}: {} images, {} points, mean track length {:.2}",
                    model_idx,
                    report.summary.num_reg_images,
                    report.summary.num_points3d,
                    report.summary.mean_track_length
                );
                Some(model_idx)
            }
        };

        self.services.fire(MapperEvent::LastImageRegistered {
            model_index: kept_index,
            summary: report.summary,
        });

        AttemptState::Done(self.continue_or_stop(pool, initial_reconstruction_given))
    }

    /// Size floor of a finished model. With multi-model exploration the
    /// floor is waived down to the dataset size.
    fn min_model_size(&self) -> usize {
        if self.options.multiple_models {
            self.options.min_model_size.min(self.cache.num_images())
        } else {
            self.options.min_model_size
        }
    }

    fn continue_or_stop(&self, pool: &ModelPool, initial_reconstruction_given: bool) -> PassControl {
        let num_total_reg_images = pool.num_total_reg_images();
        if initial_reconstruction_given
            || !self.options.multiple_models
            || pool.len() >= self.options.max_num_models
            || num_total_reg_images >= self.cache.num_images().saturating_sub(1)
        {
            debug!(
                "[Mapper] pass complete: {} models, {} / {} images registered",
                pool.len(),
                num_total_reg_images,
                self.cache.num_images()
            );
            PassControl::EndPass
        } else {
            PassControl::NextTrial
        }
    }

    /// Release the model with discard and remove it from the pool.
    fn discard(&mut self, pool: &mut ModelPool, model_idx: ModelIndex, report: &mut AttemptReport) {
        if let Some(reconstruction) = pool.get_mut(model_idx) {
            report.summary = reconstruction.summary();
            self.services.engine.end_reconstruction(reconstruction, true);
        }
        if let Err(e) = pool.delete(model_idx) {
            warn!("[Mapper] {:#}", e);
        }
    }
}
