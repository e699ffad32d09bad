//! Image selection and registration invoker.
//!
//! Seeding uses the initialization options of the current pass, which the
//! session controller relaxes between passes. Growth always uses the
//! configured registration options.

use tracing::{debug, info};

use crate::config::{MapperOptions, RegistrationOptions};
use crate::engine::{PoseRegistrar, SeedTuple};
use crate::model::{ImageId, Reconstruction};

/// Ask the registrar for up to `init_num_trials` seed tuples.
pub fn find_seed_tuples<R: PoseRegistrar + ?Sized>(
    engine: &mut R,
    reconstruction: &Reconstruction,
    options: &MapperOptions,
    init_options: &RegistrationOptions,
) -> Vec<SeedTuple> {
    let mut tuples = engine.find_initial_tuples(reconstruction, init_options, options.init_num_trials);
    tuples.truncate(options.init_num_trials);
    info!(
        "[Mapper] {} seed tuples (min inliers {}, min angle {:.2})",
        tuples.len(),
        init_options.init_min_num_inliers,
        init_options.init_min_tri_angle
    );
    tuples
}

pub fn register_initial_tuple<R: PoseRegistrar + ?Sized>(
    engine: &mut R,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
    init_options: &RegistrationOptions,
    tuple: &SeedTuple,
) -> bool {
    info!(
        "[Mapper] Initializing with images {}, {}, {} and {}",
        tuple[0], tuple[1], tuple[2], tuple[3]
    );
    let success = engine.register_initial_tuple(reconstruction, init_options, &options.triangulation(), tuple);
    if !success {
        info!("[Mapper] Initialization failed");
    }
    success
}

/// Ranked registration candidates, best first.
pub fn find_next_images<R: PoseRegistrar + ?Sized>(
    engine: &mut R,
    reconstruction: &Reconstruction,
    options: &MapperOptions,
) -> Vec<ImageId> {
    let candidates = engine.find_next_images(reconstruction, &options.mapper());
    debug!("[Mapper] {} registration candidates", candidates.len());
    candidates
}

pub fn register_next_image<R: PoseRegistrar + ?Sized>(
    engine: &mut R,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
    image_id: ImageId,
) -> bool {
    if let Some(image) = reconstruction.image(image_id) {
        info!(
            "[Mapper] Registering image {} ({}), sees {} / {} points",
            image_id,
            reconstruction.num_reg_images() + 1,
            image.num_points3d(),
            image.num_observations
        );
    }
    let success = engine.register_next_image(reconstruction, &options.mapper(), image_id);
    if !success {
        debug!("[Mapper] Could not register image {}, trying another image", image_id);
    }
    success
}
