//! Metric data model of the telly pipeline.
//!
//! A [`Metric`] is the canonical measurement record: a name, a set of tags sorted by key, a list of
//! typed fields, a timestamp and a [`ValueType`]. Metrics may be tracked through a delivery group,
//! see [`track`] and [`track_group`], so that inputs with unreliable transports can acknowledge
//! their source messages only after the pipeline has disposed of every copy.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use telly_metric::{FieldValue, Metric};
//!
//! let mut metric = Metric::new("cpu", [("host", "web-1")], [("usage", 0.5)], Utc::now());
//! metric.add_tag("cpu", "cpu0");
//!
//! assert_eq!(metric.tags()[0].key, "cpu");
//! assert_eq!(metric.field("usage"), Some(&FieldValue::Float(0.5)));
//! ```

#![warn(missing_docs)]

mod metric;
mod series;
mod time;
mod tracking;
mod value;

pub use self::metric::*;
pub use self::series::*;
pub use self::time::*;
pub use self::tracking::{DeliveryInfo, NotifyFn, TrackingId, track, track_group};
pub use self::value::*;
