//! Metric filters.
//!
//! A [`Filter`] is compiled from a [`FilterConfig`] and applied identically by every pipeline
//! stage:
//!
//! * [`Filter::select`] decides whether a metric passes the name and tag rules.
//! * [`Filter::modify`] removes fields and tags that fail the field and tag key rules.
//!
//! For every dimension configured with both a pass and a drop list, a value must match the pass
//! list and must not match the drop list. A filter without any rules is inert.
#![warn(missing_docs)]

mod config;
mod filter;
mod pattern;

pub use crate::config::*;
pub use crate::filter::*;
pub use crate::pattern::*;
