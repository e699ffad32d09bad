//! Mapper thread - runs a controller in the background.
//!
//! `spawn_mapper` moves the controller onto its own thread and hands back a
//! `MapperHandle` that owns the lifecycle signal and an event receiver. All
//! callbacks of the controller are mirrored onto the channel, so observers
//! never touch the model pool while it is being grown.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::mapping::{IncrementalMapperController, RunReport};
use crate::model::ModelPool;

use super::lifecycle::{LifecycleSignal, LifecycleState};
use super::messages::{MapperCallback, MapperEvent};

const MAPPER_THREAD_NAME: &str = "incremental-mapper";

/// Result of a finished mapper thread.
pub struct MapperOutput {
    pub report: RunReport,
    pub pool: ModelPool,
}

/// Control handle of a running mapper.
pub struct MapperHandle {
    lifecycle: Arc<LifecycleSignal>,
    events: Receiver<MapperEvent>,
    handle: Option<JoinHandle<Result<MapperOutput>>>,
}

/// Spawn `controller` on a dedicated thread.
pub fn spawn_mapper(mut controller: IncrementalMapperController) -> Result<MapperHandle> {
    let (event_sender, events) = unbounded::<MapperEvent>();
    forward_events(&mut controller, &event_sender);

    let lifecycle = controller.lifecycle();
    let handle = thread::Builder::new()
        .name(MAPPER_THREAD_NAME.to_string())
        .spawn(move || {
            info!("[Mapper] thread started");
            let report = controller.run()?;
            info!("[Mapper] thread finished ({:?})", report.status);
            Ok(MapperOutput {
                report,
                pool: controller.into_pool(),
            })
        })
        .context("Failed to spawn mapper thread")?;

    Ok(MapperHandle {
        lifecycle,
        events,
        handle: Some(handle),
    })
}

/// Register one forwarding callback per slot.
fn forward_events(controller: &mut IncrementalMapperController, sender: &Sender<MapperEvent>) {
    for slot in [
        MapperCallback::InitialImagePairRegistered,
        MapperCallback::NextImageRegistered,
        MapperCallback::LastImageRegistered,
    ] {
        let sender = sender.clone();
        controller.register_callback(slot, move |event| {
            // Receiver may be gone.
            let _ = sender.send(event.clone());
        });
    }
}

impl MapperHandle {
    pub fn pause(&self) {
        self.lifecycle.pause();
    }

    pub fn resume(&self) {
        self.lifecycle.resume();
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Events fired by the mapper, in firing order.
    pub fn events(&self) -> &Receiver<MapperEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Wait for the mapper to finish and take its models.
    pub fn join(mut self) -> Result<MapperOutput> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("mapper thread already joined"))?;
        handle
            .join()
            .map_err(|_| anyhow!("mapper thread panicked"))?
    }
}

impl Drop for MapperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Dropped without join: stop at the next safe point and wait.
            self.lifecycle.stop();
            if handle.join().is_err() {
                warn!("[Mapper] thread panicked during shutdown");
            }
        }
    }
}
