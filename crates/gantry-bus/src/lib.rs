//! In-process publish/subscribe event bus.
//!
//! Scheduling, dispatch, and health consumers are decoupled through this bus
//! rather than listener callbacks. A single broadcast channel fans events out
//! to subscribers; because publishing goes through one channel, every
//! subscriber observes events in publish order, which also gives the
//! per-subject ordering guarantee.

mod bus;

pub use bus::BroadcastBus;
