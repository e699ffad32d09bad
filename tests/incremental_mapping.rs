use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;

use rust_sfm::config::{MapperOptions, RegistrationOptions};
use rust_sfm::io::{CorrespondenceSource, CsvCorrespondenceSource, LoadRequest, SnapshotWriter};
use rust_sfm::mapping::{
    iterative_local_refinement, AttemptOutcome, GrowthTermination, IncrementalMapperController, RunStatus,
};
use rust_sfm::model::{ImageId, Reconstruction};
use rust_sfm::sim::{EngineJournal, SceneConfig, SyntheticColorSampler, SyntheticEngine, SyntheticScene};
use rust_sfm::system::{spawn_mapper, LifecycleState, MapperCallback, MapperEvent};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn id(i: u32) -> ImageId {
    ImageId::new(i)
}

fn clean_scene() -> SceneConfig {
    SceneConfig {
        outlier_ratio: 0.0,
        ..Default::default()
    }
}

struct Setup {
    scene: Arc<SyntheticScene>,
    controller: IncrementalMapperController,
    journal: Arc<Mutex<EngineJournal>>,
}

fn setup(config: SceneConfig, options: MapperOptions) -> Setup {
    init_logging();
    let scene = Arc::new(SyntheticScene::generate(config));
    let engine = SyntheticEngine::new(Arc::clone(&scene));
    let journal = engine.journal();
    let controller = IncrementalMapperController::new(options, scene.correspondence_source(), engine)
        .expect("valid options");
    Setup {
        scene,
        controller,
        journal,
    }
}

/// Records every event fired on the given slots.
fn record_events(controller: &mut IncrementalMapperController, slots: &[MapperCallback]) -> Arc<Mutex<Vec<MapperEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for &slot in slots {
        let sink = Arc::clone(&events);
        controller.register_callback(slot, move |event| sink.lock().push(event.clone()));
    }
    events
}

// ─────────────────────────────────────────────────────────────────────────────
// Termination and pool bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn run_terminates_within_bounded_attempts() {
    let configs = vec![
        SceneConfig::default(),
        SceneConfig {
            cluster_sizes: vec![8, 8, 8],
            ..Default::default()
        },
        SceneConfig {
            failing_images: [id(3), id(7)].into_iter().collect(),
            ..Default::default()
        },
        SceneConfig {
            init_num_inliers: 1,
            ..Default::default()
        },
    ];

    for config in configs {
        let options = MapperOptions::default();
        let init_num_trials = options.init_num_trials;
        let mut setup = setup(config, options);
        let report = setup.controller.run().unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.num_passes() <= 5);
        for pass in &report.passes {
            assert!(pass.attempts.len() <= init_num_trials);
        }
    }
}

#[test]
fn pool_holds_exactly_the_kept_models() {
    let config = SceneConfig {
        cluster_sizes: vec![12, 3, 6],
        ..clean_scene()
    };
    let options = MapperOptions {
        min_model_size: 5,
        ..Default::default()
    };
    let mut setup = setup(config, options);
    let report = setup.controller.run().unwrap();

    let kept: Vec<usize> = report
        .attempts()
        .filter_map(|attempt| match attempt.outcome {
            AttemptOutcome::Kept { model_index } => Some(model_index),
            _ => None,
        })
        .collect();
    assert_eq!(kept, vec![0, 1]);
    assert_eq!(report.num_models, 2);
    assert_eq!(setup.controller.pool().len(), 2);

    let sizes: Vec<usize> = setup
        .controller
        .pool()
        .models()
        .iter()
        .map(|model| model.num_reg_images())
        .collect();
    assert_eq!(sizes, vec![12, 6]);

    // The 3-image cluster has no seed tuple; its images stay unregistered.
    assert_eq!(setup.controller.pool().num_total_reg_images(), 18);
    let journal = setup.journal.lock();
    assert_eq!(journal.num_begun, journal.ended.len());
}

#[test]
fn discarded_attempts_leave_pool_unchanged() {
    let config = SceneConfig {
        failing_images: [id(0), id(1)].into_iter().collect(),
        ..clean_scene()
    };
    let mut setup = setup(config, MapperOptions::default());
    let report = setup.controller.run().unwrap();

    // Tuples containing image 0 or 1 fail; the third tuple (2, 3, 4, 5) seeds.
    let outcomes: Vec<AttemptOutcome> = report.attempts().map(|a| a.outcome).collect();
    assert!(matches!(outcomes[0], AttemptOutcome::Discarded(_)));
    assert!(matches!(outcomes[1], AttemptOutcome::Discarded(_)));
    assert_eq!(outcomes[2], AttemptOutcome::Kept { model_index: 0 });
    assert_eq!(setup.controller.pool().len(), 1);

    // Every attempt but the kept one released its model with discard.
    let num_attempts = report.attempts().count();
    assert_eq!(setup.journal.lock().num_discarded(), num_attempts - 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Initialization relaxation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn relaxation_halves_inliers_then_angle() {
    let config = SceneConfig {
        init_num_inliers: 60,
        init_tri_angle: 10.0,
        ..clean_scene()
    };
    let mut setup = setup(config, MapperOptions::default());
    let report = setup.controller.run().unwrap();

    let thresholds: Vec<(usize, f64)> = report
        .passes
        .iter()
        .map(|pass| (pass.init_min_num_inliers, pass.init_min_tri_angle))
        .collect();
    assert_eq!(thresholds, vec![(100, 16.0), (50, 16.0), (50, 8.0)]);
    assert_eq!(setup.controller.pool().len(), 1);
    assert_eq!(report.status, RunStatus::Completed);
}

#[test]
fn all_seeds_failing_ends_with_empty_pool() {
    let config = SceneConfig {
        cluster_sizes: vec![10],
        init_num_inliers: 10,
        ..clean_scene()
    };
    let mut setup = setup(config, MapperOptions::default());
    let events = record_events(
        &mut setup.controller,
        &[
            MapperCallback::InitialImagePairRegistered,
            MapperCallback::LastImageRegistered,
        ],
    );
    let report = setup.controller.run().unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.num_passes(), 5);
    let thresholds: Vec<(usize, f64)> = report
        .passes
        .iter()
        .map(|pass| (pass.init_min_num_inliers, pass.init_min_tri_angle))
        .collect();
    assert_eq!(
        thresholds,
        vec![(100, 16.0), (50, 16.0), (50, 8.0), (25, 8.0), (25, 4.0)]
    );
    assert!(setup.controller.pool().is_empty());
    assert!(events.lock().is_empty());

    // 7 tuples per pass, each tried once.
    assert_eq!(setup.journal.lock().initializations.len(), 5 * 7);
}

// ─────────────────────────────────────────────────────────────────────────────
// Model overlap
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn overlapping_model_stops_at_ceiling() {
    let config = SceneConfig {
        cluster_sizes: vec![6, 4],
        seed_tuples: Some(vec![[id(0), id(1), id(2), id(3)], [id(2), id(3), id(4), id(5)]]),
        exclusive_seeds: false,
        ..clean_scene()
    };
    let options = MapperOptions {
        max_model_overlap: 3,
        min_model_size: 3,
        ..Default::default()
    };
    let mut setup = setup(config, options);
    let report = setup.controller.run().unwrap();

    let attempts: Vec<_> = report.attempts().collect();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Kept { model_index: 0 });
    assert_eq!(attempts[0].termination, Some(GrowthTermination::NoCandidates));
    assert_eq!(attempts[1].outcome, AttemptOutcome::Kept { model_index: 1 });
    assert_eq!(attempts[1].termination, Some(GrowthTermination::ModelOverlap));
    assert_eq!(attempts[2].outcome, AttemptOutcome::SeedsExhausted);

    let pool = setup.controller.pool();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.get(0).unwrap().num_reg_images(), 6);
    // Four seed images plus one grown image, all shared with the first model.
    assert_eq!(pool.get(1).unwrap().num_reg_images(), 5);
    let first = pool.get(0).unwrap().reg_image_ids();
    let shared = pool
        .get(1)
        .unwrap()
        .reg_image_ids()
        .iter()
        .filter(|id| first.contains(*id))
        .count();
    assert_eq!(shared, 5);
}

// ─────────────────────────────────────────────────────────────────────────────
// Refinement
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn local_refinement_converges_and_stays_converged() {
    init_logging();
    let scene = Arc::new(SyntheticScene::generate(SceneConfig {
        outlier_ratio: 0.3,
        ..Default::default()
    }));
    let cache = scene
        .correspondence_source()
        .load(&LoadRequest::default())
        .unwrap();
    let options = MapperOptions {
        mapper: RegistrationOptions {
            abs_pose_min_num_inliers: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut engine = SyntheticEngine::new(Arc::clone(&scene));

    let mut reconstruction = Reconstruction::new();
    reconstruction.load(&cache);
    use rust_sfm::engine::PoseRegistrar;
    engine.begin_reconstruction(&reconstruction, &cache);
    assert!(engine.register_initial_tuple(
        &mut reconstruction,
        &options.mapper(),
        &options.triangulation(),
        &[id(0), id(1), id(2), id(3)],
    ));
    assert!(engine.register_next_image(&mut reconstruction, &options.mapper(), id(4)));

    let first = iterative_local_refinement(&mut engine, &mut reconstruction, &options, id(4));
    assert!(first.num_changed_observations > 0);
    assert_eq!(first.num_iterations, 2);

    let second = iterative_local_refinement(&mut engine, &mut reconstruction, &options, id(4));
    assert_eq!(second.num_iterations, 1);
    assert_eq!(second.num_changed_observations, 0);
}

#[test]
fn global_refinement_options_follow_model_size() {
    let config = SceneConfig {
        cluster_sizes: vec![20],
        ..clean_scene()
    };
    let options = MapperOptions::default();
    let base_iterations = options.ba_global_max_num_iterations;
    let mut setup = setup(config, options);
    setup.controller.run().unwrap();

    let journal = setup.journal.lock();
    assert!(!journal.global_adjustments.is_empty());
    for record in &journal.global_adjustments {
        let expected_iterations = if record.num_reg_images < 10 {
            2 * base_iterations
        } else {
            base_iterations
        };
        assert_eq!(record.max_num_iterations, expected_iterations);
        assert_eq!(record.refine_extra_params, record.num_reg_images >= 16);
    }
    assert!(journal.global_adjustments.iter().any(|r| r.num_reg_images < 10));
    assert!(journal.global_adjustments.iter().any(|r| r.num_reg_images >= 16));
    assert!(journal.num_calibrations > 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Callbacks, colors, snapshots
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn callbacks_fire_in_growth_order() {
    let mut setup = setup(clean_scene(), MapperOptions::default());
    let events = record_events(
        &mut setup.controller,
        &[
            MapperCallback::InitialImagePairRegistered,
            MapperCallback::NextImageRegistered,
            MapperCallback::LastImageRegistered,
        ],
    );
    setup.controller.run().unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 1 + 8 + 1);
    assert!(matches!(
        events[0],
        MapperEvent::InitialImagePairRegistered { model_index: 0, seed: Some(_), .. }
    ));
    assert!(matches!(
        events[9],
        MapperEvent::LastImageRegistered { model_index: Some(0), .. }
    ));

    let growth: Vec<usize> = events[1..9]
        .iter()
        .map(|event| event.summary().num_reg_images)
        .collect();
    assert_eq!(growth, (5..=12).collect::<Vec<_>>());
}

#[test]
fn colors_follow_landmarks_and_unreadable_images_are_skipped() {
    let config = SceneConfig {
        unreadable_images: [id(5)].into_iter().collect(),
        ..clean_scene()
    };
    let Setup {
        scene,
        controller,
        journal: _,
    } = setup(config, MapperOptions::default());
    let mut controller = controller.with_color_sampler(SyntheticColorSampler::new(Arc::clone(&scene)), "images");
    let report = controller.run().unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let model = controller.pool().get(0).unwrap();
    assert_eq!(model.num_reg_images(), 12);
    let first_image = model.image(id(0)).unwrap();
    assert!(first_image.num_points3d() > 0);
    for (point2d_idx, point_id) in first_image.point3d_ids() {
        let expected = scene.landmark(point2d_idx as usize).unwrap().color;
        assert_eq!(model.point3d(point_id).unwrap().color, expected);
    }
}

struct RecordingWriter {
    sizes: Arc<Mutex<Vec<usize>>>,
}

impl SnapshotWriter for RecordingWriter {
    fn write(&mut self, reconstruction: &Reconstruction, _dir: &Path) -> Result<()> {
        self.sizes.lock().push(reconstruction.num_reg_images());
        Ok(())
    }
}

#[test]
fn snapshots_written_every_n_registered_images() {
    let dir = tempfile::tempdir().unwrap();
    let options = MapperOptions {
        snapshot_path: Some(dir.path().to_path_buf()),
        snapshot_images_freq: 2,
        ..Default::default()
    };
    let Setup { controller, .. } = setup(clean_scene(), options);
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let mut controller = controller.with_snapshot_writer(RecordingWriter {
        sizes: Arc::clone(&sizes),
    });
    controller.run().unwrap();

    assert_eq!(*sizes.lock(), vec![6, 8, 10, 12]);
}

#[test]
fn json_snapshot_can_be_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let options = MapperOptions {
        snapshot_path: Some(dir.path().to_path_buf()),
        snapshot_images_freq: 8,
        ..Default::default()
    };
    let mut setup = setup(clean_scene(), options);
    setup.controller.run().unwrap();

    let snapshot_dirs: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(snapshot_dirs.len(), 1);
    let file = fs::File::open(snapshot_dirs[0].join("reconstruction.json")).unwrap();
    let snapshot: Reconstruction = serde_json::from_reader(file).unwrap();
    assert_eq!(snapshot.num_reg_images(), 12);
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn stop_keeps_partial_model() {
    let mut setup = setup(clean_scene(), MapperOptions::default());
    let lifecycle = setup.controller.lifecycle();
    setup.controller.register_callback(MapperCallback::NextImageRegistered, move |event| {
        if event.summary().num_reg_images >= 6 {
            lifecycle.stop();
        }
    });
    let events = record_events(&mut setup.controller, &[MapperCallback::LastImageRegistered]);
    let report = setup.controller.run().unwrap();

    assert_eq!(report.status, RunStatus::Stopped);
    let attempt = report.attempts().last().unwrap();
    assert_eq!(attempt.outcome, AttemptOutcome::Stopped { model_index: 0 });
    assert_eq!(attempt.termination, Some(GrowthTermination::Stopped));
    assert_eq!(setup.controller.pool().get(0).unwrap().num_reg_images(), 6);
    assert_eq!(events.lock().len(), 1);
}

#[test]
fn spawned_mapper_honors_pause_and_resume() {
    let setup = setup(clean_scene(), MapperOptions::default());
    let lifecycle = setup.controller.lifecycle();
    lifecycle.pause();

    let handle = spawn_mapper(setup.controller).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.state(), LifecycleState::Paused);
    assert!(!handle.is_finished());
    assert!(handle.events().try_recv().is_err());

    handle.resume();
    let events: Vec<MapperEvent> = {
        let receiver = handle.events().clone();
        let output = handle.join().unwrap();
        assert_eq!(output.report.status, RunStatus::Completed);
        assert_eq!(output.pool.len(), 1);
        receiver.try_iter().collect()
    };
    assert_eq!(events.len(), 10);
    assert_eq!(events[0].callback(), MapperCallback::InitialImagePairRegistered);
    assert_eq!(events[9].callback(), MapperCallback::LastImageRegistered);
}

#[test]
fn spawned_mapper_stops_while_paused() {
    let setup = setup(clean_scene(), MapperOptions::default());
    setup.controller.lifecycle().pause();

    let handle = spawn_mapper(setup.controller).unwrap();
    handle.stop();
    let output = handle.join().unwrap();

    assert_eq!(output.report.status, RunStatus::Stopped);
    assert!(output.pool.is_empty());
}

#[test]
fn resumed_model_grows_without_new_seed() {
    let scene = Arc::new(SyntheticScene::generate(clean_scene()));
    let cache = scene
        .correspondence_source()
        .load(&LoadRequest::default())
        .unwrap();
    let mut partial = Reconstruction::new();
    partial.load(&cache);
    let options = MapperOptions::default();
    {
        use rust_sfm::engine::PoseRegistrar;
        let mut engine = SyntheticEngine::new(Arc::clone(&scene));
        engine.begin_reconstruction(&partial, &cache);
        assert!(engine.register_initial_tuple(
            &mut partial,
            &options.mapper(),
            &options.triangulation(),
            &[id(4), id(5), id(6), id(7)],
        ));
    }

    let engine = SyntheticEngine::new(Arc::clone(&scene));
    let journal = engine.journal();
    let mut controller = IncrementalMapperController::new(options, scene.correspondence_source(), engine)
        .unwrap()
        .with_reconstruction(partial);
    let events = record_events(&mut controller, &[MapperCallback::InitialImagePairRegistered]);
    let report = controller.run().unwrap();

    assert_eq!(report.num_passes(), 1);
    let attempt = report.attempts().next().unwrap();
    assert!(attempt.resumed);
    assert_eq!(attempt.outcome, AttemptOutcome::Kept { model_index: 0 });
    assert_eq!(controller.pool().get(0).unwrap().num_reg_images(), 12);
    assert!(journal.lock().initializations.is_empty());
    assert!(matches!(
        events.lock()[0],
        MapperEvent::InitialImagePairRegistered { seed: None, .. }
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Correspondence tables on disk
// ─────────────────────────────────────────────────────────────────────────────

fn write_tables(scene: &SyntheticScene, dir: &Path) {
    let source = scene.correspondence_source();

    let mut cameras = String::from("# camera_id, model, width, height, params\n");
    for camera in &source.cameras {
        let params: Vec<String> = camera.params.iter().map(|p| p.to_string()).collect();
        cameras += &format!(
            "{}, {}, {}, {}, {}\n",
            camera.id.0,
            camera.model,
            camera.width,
            camera.height,
            params.join(", ")
        );
    }

    let mut images = String::new();
    for image in &source.images {
        images += &format!(
            "{}, {}, {}, {}, {}\n",
            image.id.0, image.name, image.camera_id.0, image.num_points2d, image.num_observations
        );
    }

    let mut matches = String::new();
    for pair in &source.pairs {
        matches += &format!("{}, {}, {}\n", pair.image_id1.0, pair.image_id2.0, pair.num_matches);
    }

    fs::write(dir.join("cameras.csv"), cameras).unwrap();
    fs::write(dir.join("images.csv"), images).unwrap();
    fs::write(dir.join("matches.csv"), matches).unwrap();
}

#[test]
fn csv_tables_drive_a_full_run() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let scene = Arc::new(SyntheticScene::generate(clean_scene()));
    write_tables(&scene, dir.path());

    let mut controller = IncrementalMapperController::new(
        MapperOptions::default(),
        CsvCorrespondenceSource::new(dir.path()),
        SyntheticEngine::new(Arc::clone(&scene)),
    )
    .unwrap();
    let report = controller.run().unwrap();

    assert_eq!(report.num_images, 12);
    assert_eq!(controller.pool().len(), 1);
    let names: HashSet<String> = controller
        .pool()
        .get(0)
        .unwrap()
        .images()
        .filter(|image| image.is_registered())
        .map(|image| image.name.clone())
        .collect();
    assert!(names.contains("image_0011.jpg"));
}

#[test]
fn missing_tables_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let scene = Arc::new(SyntheticScene::generate(clean_scene()));
    let mut controller = IncrementalMapperController::new(
        MapperOptions::default(),
        CsvCorrespondenceSource::new(dir.path()),
        SyntheticEngine::new(scene),
    )
    .unwrap();
    assert!(controller.run().is_err());
}
