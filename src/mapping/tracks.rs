//! Track maintenance invoker.
//!
//! Thin wrappers around the triangulation engine that derive the engine
//! options from the run configuration and log the observation counts.

use tracing::{debug, info};

use crate::config::MapperOptions;
use crate::engine::TrackTriangulator;
use crate::model::{ImageId, Reconstruction};

/// Triangulate the observations of a freshly registered image.
pub fn triangulate_image<T: TrackTriangulator + ?Sized>(
    engine: &mut T,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
    image_id: ImageId,
) -> usize {
    let continued = reconstruction
        .image(image_id)
        .map(|image| image.num_points3d())
        .unwrap_or(0);
    let added = engine.triangulate_image(reconstruction, &options.triangulation(), image_id);
    debug!(
        "[Triangulation] image {}: {} continued, {} added observations",
        image_id, continued, added
    );
    added
}

/// Complete and then merge every track. Returns the number of changed
/// observations.
pub fn complete_and_merge_tracks<T: TrackTriangulator + ?Sized>(
    engine: &mut T,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
) -> usize {
    let triangulation = options.triangulation();
    let completed = engine.complete_tracks(reconstruction, &triangulation);
    let merged = engine.merge_tracks(reconstruction, &triangulation);
    debug!(
        "[Tracks] completed {} observations, merged {} observations",
        completed, merged
    );
    completed + merged
}

pub fn retriangulate<T: TrackTriangulator + ?Sized>(
    engine: &mut T,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
) -> usize {
    let num_retriangulated = engine.retriangulate(reconstruction, &options.triangulation());
    info!("[Retriangulation] {} observations", num_retriangulated);
    num_retriangulated
}

pub fn filter_points<T: TrackTriangulator + ?Sized>(
    engine: &mut T,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
) -> usize {
    let num_filtered = engine.filter_points(reconstruction, &options.mapper());
    debug!("[Filter] removed {} observations", num_filtered);
    num_filtered
}

pub fn filter_images<T: TrackTriangulator + ?Sized>(
    engine: &mut T,
    reconstruction: &mut Reconstruction,
    options: &MapperOptions,
) -> usize {
    let num_filtered = engine.filter_images(reconstruction, &options.mapper());
    if num_filtered > 0 {
        info!("[Filter] deregistered {} images", num_filtered);
    }
    num_filtered
}
