//! Synthetic scene and ground-truth engines.
//!
//! Used by the binary as a self-contained demo and by the tests to drive
//! the controller end to end without a feature-matching database.

pub mod engine;
pub mod scene;

pub use engine::{EngineJournal, GlobalAdjustmentRecord, SyntheticColorSampler, SyntheticEngine};
pub use scene::{Landmark, SceneConfig, SceneImage, SyntheticScene, SCENE_CAMERA_ID};
