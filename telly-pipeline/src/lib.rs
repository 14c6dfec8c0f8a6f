//! The plugin pipeline of the telly metrics agent.
//!
//! Plugins implement one of four interfaces:
//!
//!  - [`Input`] produces metrics, either when gathered or continuously as a [`ServiceInput`].
//!  - [`Processor`] transforms metrics one at a time.
//!  - [`Aggregator`] summarizes metrics over a time window.
//!  - [`Output`] writes batches of metrics to a backend.
//!
//! Each plugin is wrapped in a running wrapper ([`RunningInput`], [`RunningProcessor`],
//! [`RunningAggregator`] and [`RunningOutput`]) which applies the plugin's filter, renames and
//! tags, and records statistics in [`selfstat`]. Outputs buffer metrics in a bounded [`Buffer`]
//! that retries failed batches in order.
//!
//! The [`Agent`] creates plugins from a [`Registry`] according to an [`AgentConfig`] and
//! schedules them until shut down.
//!
//! # Delivery Tracking
//!
//! Inputs that need to know when their metrics have been written attach tracking through
//! [`Accumulator::with_tracking`]. A tracked metric group is delivered once every copy of every
//! metric has been accepted by an output or discarded by a filter. A single rejected copy marks
//! the whole group as undelivered.

#![warn(missing_docs)]

mod accumulator;
mod agent;
mod buffer;
pub mod config;
mod delivery;
mod error;
mod plugin;
mod registry;
mod running;
pub mod selfstat;

#[cfg(test)]
mod testutils;

pub use self::accumulator::*;
pub use self::agent::*;
pub use self::buffer::*;
pub use self::config::AgentConfig;
pub use self::delivery::*;
pub use self::error::*;
pub use self::plugin::*;
pub use self::registry::*;
pub use self::running::*;
