//! Pipeline scheduling and work dispatch for Gantry CD.
//!
//! The automatic scheduling engine: build-cause resolution over the material
//! dependency graph (fan-in), trigger serialization per pipeline, stage
//! ordering, and job dispatch to polling agents.

pub mod config;
pub mod dispatch;
pub mod fanin;
pub mod guard;
pub mod materials;
pub mod queue;
pub mod scheduler;
pub mod stages;
