//! Lifecycle control shared between the mapper and the outside world.
//!
//! The `LifecycleSignal` is the only state a running mapper shares with
//! other threads. The mapper polls it at safe points (top of every trial and
//! every growth iteration); a paused mapper sleeps on a condition variable
//! until it is resumed or stopped.

use std::collections::HashMap;
use std::fmt;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use super::messages::{MapperCallback, MapperEvent};

/// Externally requested run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Paused,
    /// Terminal: a stopped mapper never resumes.
    Stopped,
}

/// Tri-state control surface of a mapper.
pub struct LifecycleSignal {
    state: Mutex<LifecycleState>,
    changed: Condvar,
}

impl LifecycleSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Running),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Request a pause. Ignored once stopped.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Running {
            *state = LifecycleState::Paused;
            self.changed.notify_all();
        }
    }

    /// Resume a paused mapper. Ignored once stopped.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Paused {
            *state = LifecycleState::Running;
            self.changed.notify_all();
        }
    }

    /// Request a stop. Also wakes a paused mapper.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        *state = LifecycleState::Stopped;
        self.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.state() == LifecycleState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == LifecycleState::Stopped
    }

    /// Block the calling thread while paused. Returns the state that ended
    /// the wait.
    pub fn block_if_paused(&self) -> LifecycleState {
        let mut state = self.state.lock();
        if *state == LifecycleState::Paused {
            info!("[Mapper] paused");
            while *state == LifecycleState::Paused {
                self.changed.wait(&mut state);
            }
            info!("[Mapper] resumed ({:?})", *state);
        }
        *state
    }
}

impl Default for LifecycleSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LifecycleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleSignal")
            .field("state", &self.state())
            .finish()
    }
}

/// Boxed callback invoked synchronously on the mapper thread.
pub type CallbackFn = Box<dyn FnMut(&MapperEvent) + Send>;

/// Callbacks registered per slot, fired in registration order.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<MapperCallback, Vec<CallbackFn>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, slot: MapperCallback, callback: F)
    where
        F: FnMut(&MapperEvent) + Send + 'static,
    {
        self.callbacks.entry(slot).or_default().push(Box::new(callback));
    }

    /// Number of callbacks registered on `slot`.
    pub fn len(&self, slot: MapperCallback) -> usize {
        self.callbacks.get(&slot).map(Vec::len).unwrap_or(0)
    }

    /// Invoke every callback of the event's slot.
    pub fn fire(&mut self, event: &MapperEvent) {
        if let Some(callbacks) = self.callbacks.get_mut(&event.callback()) {
            for callback in callbacks.iter_mut() {
                callback(event);
            }
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.callbacks.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("CallbackRegistry").field("callbacks", &counts).finish()
    }
}
