//! Lifecycle control, callbacks and background execution of a mapper.
//!
//! The mapper itself is single-threaded. This module contains the pieces
//! that let other threads observe and steer it: the tri-state lifecycle
//! signal, the callback registry, the event types and a thread runner.

pub mod lifecycle;
mod mapper_thread;
pub mod messages;

pub use lifecycle::{CallbackFn, CallbackRegistry, LifecycleSignal, LifecycleState};
pub use mapper_thread::{spawn_mapper, MapperHandle, MapperOutput};
pub use messages::{MapperCallback, MapperEvent};
