pub mod config;
pub mod engine;
pub mod geometry;
pub mod io;
pub mod mapping;
pub mod model;
pub mod sim;
pub mod system;
