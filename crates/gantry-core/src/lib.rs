//! Gantry Core
//!
//! Core domain types, traits, and error handling for the Gantry CD
//! scheduling engine. This crate has minimal dependencies and defines the
//! shared vocabulary used across all other crates.

pub mod agent;
pub mod build_cause;
pub mod error;
pub mod events;
pub mod health;
pub mod ids;
pub mod instance;
pub mod material;
pub mod operation;
pub mod pipeline;
pub mod ports;
pub mod timeline;

pub use error::{Error, Result};
pub use ids::*;
