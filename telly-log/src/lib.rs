//! Logging facade for the telly metric pipeline.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files. This requires the
//! `init` feature.
//!
//! ```ignore
//! let config = telly_log::LogConfig {
//!     enable_backtraces: true,
//!     ..Default::default()
//! };
//!
//! telly_log::init(&config);
//! ```
//!
//! # Logging
//!
//! All crates log through the five macros re-exported from `tracing`: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`].
//!
//! ## Conventions
//!
//! Log messages start lowercase and end without punctuation. The identity of the plugin emitting
//! a message is attached as a structured field rather than interpolated into the message:
//!
//! - [`error!`] for bugs and invalid behavior.
//! - [`warn!`] for undesirable behavior, such as a buffer overflow.
//! - [`info!`] for messages relevant to the average user.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for full auxiliary information.
//!
//! ```
//! telly_log::debug!(output = "file", "wrote batch of {} metrics", 42);
//! ```
//!
//! ## Logging Error Types
//!
//! To log errors together with their source chain, use the [`LogError`] wrapper.
//!
//! ```
//! use telly_log::LogError;
//!
//! if let Err(error) = std::env::var("TELLY_DOES_NOT_EXIST") {
//!     telly_log::error!("env failed: {}", LogError(&error));
//! }
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of a test. It captures log output in the test runner and enables all levels
//! for the calling crate. This requires the `test` feature.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{Level, debug, enabled, error, info, trace, warn};

/// The crates of this workspace, which are logged at the configured level by default.
pub const CRATE_NAMES: &[&str] = &[
    "telly_filter",
    "telly_log",
    "telly_metric",
    "telly_pipeline",
];
