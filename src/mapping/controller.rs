//! Incremental mapper controller - the session driver.
//!
//! The controller loads the correspondence data once, then runs
//! reconstruction passes over a shared model pool:
//! 1. One pass with the configured initialization thresholds
//! 2. While the pool is still empty, up to two relaxation rounds, each
//!    halving `init_min_num_inliers` and then `init_min_tri_angle`
//!
//! It owns the lifecycle signal and the callback registry that outside
//! observers use to pause, stop and follow a run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use tracing::{info, warn};

use crate::config::{MapperOptions, RegistrationOptions};
use crate::engine::{ColorSampler, MapperEngine};
use crate::io::{CorrespondenceCache, CorrespondenceSource, JsonSnapshotWriter, LoadRequest, SnapshotWriter};
use crate::model::{ModelPool, Reconstruction};
use crate::system::{CallbackRegistry, LifecycleSignal, MapperCallback, MapperEvent};

use super::attempt::{AttemptReport, MapperServices, PassReport, ReconstructionPass};

/// Number of relaxation rounds after an unsuccessful first pass.
pub const NUM_INIT_RELAXATIONS: usize = 2;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// All passes ran to their end.
    Completed,
    /// No image with matches was found; nothing was reconstructed.
    NoImages,
    /// A stop request ended the run. Partial models are kept.
    Stopped,
}

/// Summary of one `run()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    /// Images left after correspondence filtering.
    pub num_images: usize,
    pub passes: Vec<PassReport>,
    /// Models in the pool when the run ended.
    pub num_models: usize,
}

impl RunReport {
    pub fn num_passes(&self) -> usize {
        self.passes.len()
    }

    /// Every attempt of every pass, in execution order.
    pub fn attempts(&self) -> impl Iterator<Item = &AttemptReport> {
        self.passes.iter().flat_map(|pass| pass.attempts.iter())
    }
}

/// Top-level driver of incremental reconstruction.
pub struct IncrementalMapperController {
    options: MapperOptions,
    source: Box<dyn CorrespondenceSource>,
    services: MapperServices,
    pool: ModelPool,
    lifecycle: Arc<LifecycleSignal>,
}

impl IncrementalMapperController {
    /// Create a controller. Fails if the options do not validate.
    pub fn new<S, E>(options: MapperOptions, source: S, engine: E) -> Result<Self>
    where
        S: CorrespondenceSource + 'static,
        E: MapperEngine + 'static,
    {
        options.check().context("Invalid mapper options")?;
        Ok(Self {
            options,
            source: Box::new(source),
            services: MapperServices {
                engine: Box::new(engine),
                color_sampler: None,
                snapshot_writer: Box::new(JsonSnapshotWriter),
                image_path: PathBuf::new(),
                callbacks: CallbackRegistry::new(),
            },
            pool: ModelPool::new(),
            lifecycle: Arc::new(LifecycleSignal::new()),
        })
    }

    /// Resume from an existing model.
    pub fn with_reconstruction(mut self, reconstruction: Reconstruction) -> Self {
        self.pool = ModelPool::resume_from(reconstruction);
        self
    }

    /// Run on a pre-filled pool. `run()` rejects pools with more than one
    /// model.
    pub fn with_pool(mut self, pool: ModelPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_color_sampler<C: ColorSampler + 'static>(mut self, sampler: C, image_path: impl Into<PathBuf>) -> Self {
        self.services.color_sampler = Some(Box::new(sampler));
        self.services.image_path = image_path.into();
        self
    }

    pub fn with_snapshot_writer<W: SnapshotWriter + 'static>(mut self, writer: W) -> Self {
        self.services.snapshot_writer = Box::new(writer);
        self
    }

    pub fn options(&self) -> &MapperOptions {
        &self.options
    }

    /// Handle for pausing, resuming and stopping the run from another thread.
    pub fn lifecycle(&self) -> Arc<LifecycleSignal> {
        Arc::clone(&self.lifecycle)
    }

    pub fn register_callback<F>(&mut self, slot: MapperCallback, callback: F)
    where
        F: FnMut(&MapperEvent) + Send + 'static,
    {
        self.services.callbacks.register(slot, callback);
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    pub fn into_pool(self) -> ModelPool {
        self.pool
    }

    /// Run incremental mapping.
    ///
    /// Returns `Err` only for invalid options, an invalid resume pool or a
    /// failing correspondence source. Every other failure is recovered or
    /// reported in the returned `RunReport`.
    pub fn run(&mut self) -> Result<RunReport> {
        self.options.check().context("Invalid mapper options")?;
        ensure!(
            self.pool.len() <= 1,
            "Can only resume from a single reconstruction, but {} are given",
            self.pool.len()
        );

        let start = Instant::now();
        let cache = self.load_correspondences()?;
        let mut report = RunReport {
            status: RunStatus::Completed,
            num_images: cache.num_images(),
            passes: Vec::new(),
            num_models: self.pool.len(),
        };

        if cache.num_images() == 0 {
            warn!("[Mapper] No images with matches found");
            report.status = RunStatus::NoImages;
            return Ok(report);
        }

        let mut init_options = self.options.mapper();
        report.passes.push(self.reconstruct(&cache, &init_options));

        for _ in 0..NUM_INIT_RELAXATIONS {
            if !self.pool.is_empty() || self.lifecycle.is_stopped() {
                break;
            }
            info!("[Mapper] Relaxing the initialization constraints");
            init_options.init_min_num_inliers /= 2;
            report.passes.push(self.reconstruct(&cache, &init_options));

            if !self.pool.is_empty() || self.lifecycle.is_stopped() {
                break;
            }
            info!("[Mapper] Relaxing the initialization constraints");
            init_options.init_min_tri_angle /= 2.0;
            report.passes.push(self.reconstruct(&cache, &init_options));
        }

        if self.lifecycle.is_stopped() {
            report.status = RunStatus::Stopped;
        }
        report.num_models = self.pool.len();

        info!(
            "[Mapper] finished in {:.2}s: {} passes, {} models",
            start.elapsed().as_secs_f64(),
            report.num_passes(),
            report.num_models
        );
        Ok(report)
    }

    /// Load the correspondence cache. A resumed model's registered images
    /// stay in an explicit image subset.
    fn load_correspondences(&mut self) -> Result<CorrespondenceCache> {
        let mut request: LoadRequest = self.options.load_request();
        if self.pool.len() == 1 && !request.image_names.is_empty() {
            if let Some(model) = self.pool.get(0) {
                for &image_id in model.reg_image_ids() {
                    if let Some(image) = model.image(image_id) {
                        request.image_names.insert(image.name.clone());
                    }
                }
            }
        }

        let start = Instant::now();
        let cache = self
            .source
            .load(&request)
            .context("Failed to load correspondences")?;
        info!(
            "[Mapper] loaded {} images, {} cameras, {} pairs in {:.2}s",
            cache.num_images(),
            cache.num_cameras(),
            cache.num_pairs(),
            start.elapsed().as_secs_f64()
        );
        Ok(cache)
    }

    fn reconstruct(&mut self, cache: &CorrespondenceCache, init_options: &RegistrationOptions) -> PassReport {
        let mut pass = ReconstructionPass::new(
            &self.options,
            init_options,
            cache,
            &mut self.services,
            &self.lifecycle,
        );
        pass.run(&mut self.pool)
    }
}

impl std::fmt::Debug for IncrementalMapperController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalMapperController")
            .field("num_models", &self.pool.len())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
