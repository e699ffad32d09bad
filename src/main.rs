use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use rust_sfm::config::{load_options, MapperOptions};
use rust_sfm::mapping::{AttemptOutcome, IncrementalMapperController};
use rust_sfm::sim::{SceneConfig, SyntheticColorSampler, SyntheticEngine, SyntheticScene};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let options = match args.next() {
        Some(path) if path != "-" => load_options(&path)?,
        _ => MapperOptions::default(),
    };
    let num_images = match args.next() {
        Some(n) => n
            .parse::<usize>()
            .with_context(|| format!("Invalid image count: {}", n))?,
        None => 40,
    };

    let scene = Arc::new(SyntheticScene::generate(SceneConfig {
        cluster_sizes: vec![num_images],
        ..Default::default()
    }));
    println!(
        "Synthetic scene: {} images, {} landmarks",
        scene.num_images(),
        scene.num_landmarks()
    );

    let engine = SyntheticEngine::new(Arc::clone(&scene));
    let mut controller = IncrementalMapperController::new(options, scene.correspondence_source(), engine)?
        .with_color_sampler(SyntheticColorSampler::new(Arc::clone(&scene)), "images");

    let report = controller.run()?;
    println!(
        "Run {:?}: {} passes, {} attempts, {} models",
        report.status,
        report.num_passes(),
        report.attempts().count(),
        report.num_models
    );

    for attempt in report.attempts() {
        if let AttemptOutcome::Kept { model_index } = attempt.outcome {
            let summary = attempt.summary;
            println!(
                "  model {}: {} / {} images, {} points, {} observations, mean track length {:.2}",
                model_index,
                summary.num_reg_images,
                summary.num_images,
                summary.num_points3d,
                summary.num_observations,
                summary.mean_track_length
            );
        }
    }

    Ok(())
}
