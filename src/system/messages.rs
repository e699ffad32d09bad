//! Events emitted by the mapping controller.
//!
//! Every callback slot of the controller receives one of these. A mapper
//! running on its own thread forwards them over a channel.

use crate::engine::SeedTuple;
use crate::model::{ImageId, ModelIndex, ReconstructionSummary};

/// Named callback slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapperCallback {
    /// A model was initialized (or resumed) and is about to grow.
    InitialImagePairRegistered,
    /// One more image was registered and refined.
    NextImageRegistered,
    /// A model is finished, kept or discarded.
    LastImageRegistered,
}

/// Payload of a fired callback.
#[derive(Debug, Clone, PartialEq)]
pub enum MapperEvent {
    InitialImagePairRegistered {
        model_index: ModelIndex,
        /// `None` when a resumed model skipped initialization.
        seed: Option<SeedTuple>,
        summary: ReconstructionSummary,
    },
    NextImageRegistered {
        model_index: ModelIndex,
        image_id: ImageId,
        summary: ReconstructionSummary,
    },
    LastImageRegistered {
        /// Index of the model in the pool, `None` if it was discarded.
        model_index: Option<ModelIndex>,
        summary: ReconstructionSummary,
    },
}

impl MapperEvent {
    /// The callback slot this event is fired on.
    pub fn callback(&self) -> MapperCallback {
        match self {
            MapperEvent::InitialImagePairRegistered { .. } => MapperCallback::InitialImagePairRegistered,
            MapperEvent::NextImageRegistered { .. } => MapperCallback::NextImageRegistered,
            MapperEvent::LastImageRegistered { .. } => MapperCallback::LastImageRegistered,
        }
    }

    pub fn summary(&self) -> &ReconstructionSummary {
        match self {
            MapperEvent::InitialImagePairRegistered { summary, .. }
            | MapperEvent::NextImageRegistered { summary, .. }
            | MapperEvent::LastImageRegistered { summary, .. } => summary,
        }
    }
}
