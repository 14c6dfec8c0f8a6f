//! Self statistics of the pipeline.
//!
//! Every running plugin registers a set of [`Stat`]s in a process-wide registry. A stat is
//! identified by its measurement, field and tag set, and registering the same key twice returns a
//! handle to the same value. The registry can be snapshotted into [`Metric`]s with [`metrics`], so
//! the agent can report its own health through its own pipeline.
//!
//! ```
//! use telly_pipeline::selfstat;
//!
//! let written = selfstat::register("internal_example", "written", &[("output", "file")]);
//! written.incr(3);
//!
//! let again = selfstat::register("internal_example", "written", &[("output", "file")]);
//! assert_eq!(again.get(), 3);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use parking_lot::Mutex;
use telly_metric::Metric;

type Tags = BTreeMap<String, String>;

#[derive(Debug)]
struct StatInner {
    measurement: String,
    field: String,
    tags: Tags,
    value: AtomicI64,
}

/// A registered counter or gauge.
///
/// Stats are cheap to clone and all clones share the same value.
#[derive(Clone, Debug)]
pub struct Stat(Arc<StatInner>);

impl Stat {
    /// Returns the measurement this stat is reported under.
    pub fn measurement(&self) -> &str {
        &self.0.measurement
    }

    /// Returns the field name of this stat.
    pub fn field(&self) -> &str {
        &self.0.field
    }

    /// Returns the tags this stat is reported with.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.0.tags
    }

    /// Adds `value` to the stat.
    pub fn incr(&self, value: i64) {
        self.0.value.fetch_add(value, Ordering::Relaxed);
    }

    /// Overwrites the stat with `value`.
    pub fn set(&self, value: i64) {
        self.0.value.store(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> i64 {
        self.0.value.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Registry {
    stats: BTreeMap<(String, Tags), BTreeMap<String, Stat>>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(Default::default);

/// Registers a stat, or returns the existing stat with the same key.
pub fn register(measurement: &str, field: &str, tags: &[(&str, &str)]) -> Stat {
    let tags: Tags = tags
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();

    register_tags(measurement, field, tags)
}

pub(crate) fn register_tags(measurement: &str, field: &str, tags: Tags) -> Stat {
    let mut registry = REGISTRY.lock();
    let fields = registry
        .stats
        .entry((measurement.to_owned(), tags.clone()))
        .or_default();

    fields
        .entry(field.to_owned())
        .or_insert_with(|| {
            Stat(Arc::new(StatInner {
                measurement: measurement.to_owned(),
                field: field.to_owned(),
                tags,
                value: AtomicI64::new(0),
            }))
        })
        .clone()
}

/// Returns the tags identifying a plugin in its stats.
pub(crate) fn plugin_tags(kind: &str, name: &str, alias: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(kind.to_owned(), name.to_owned());
    if !alias.is_empty() {
        tags.insert("alias".to_owned(), alias.to_owned());
    }
    tags
}

/// Returns a snapshot of all registered stats.
///
/// Stats sharing a measurement and tag set are reported as fields of one metric.
pub fn metrics() -> Vec<Metric> {
    let now = Utc::now();
    let registry = REGISTRY.lock();

    registry
        .stats
        .iter()
        .map(|((measurement, tags), fields)| {
            Metric::new(
                measurement.as_str(),
                tags.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                fields.iter().map(|(f, s)| (f.as_str(), s.get())),
                now,
            )
        })
        .collect()
}

/// Process-wide number of metrics gathered by all inputs.
pub(crate) static GLOBAL_METRICS_GATHERED: LazyLock<Stat> =
    LazyLock::new(|| register("internal_agent", "metrics_gathered", &[]));

/// Process-wide number of errors reported by all inputs.
pub(crate) static GLOBAL_GATHER_ERRORS: LazyLock<Stat> =
    LazyLock::new(|| register("internal_agent", "gather_errors", &[]));

#[cfg(test)]
mod tests {
    use telly_metric::FieldValue;

    use super::*;

    #[test]
    fn test_same_key_returns_same_stat() {
        let a = register("internal_test_same", "count", &[("input", "a")]);
        let b = register("internal_test_same", "count", &[("input", "a")]);
        let c = register("internal_test_same", "count", &[("input", "b")]);

        a.incr(2);
        b.incr(3);
        c.set(7);

        assert_eq!(a.get(), 5);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn test_snapshot_groups_fields() {
        register("internal_test_snapshot", "errors", &[("output", "x")]).incr(1);
        register("internal_test_snapshot", "written", &[("output", "x")]).set(10);

        let metrics: Vec<_> = metrics()
            .into_iter()
            .filter(|m| m.name() == "internal_test_snapshot")
            .collect();

        assert_eq!(metrics.len(), 1);
        let metric = &metrics[0];
        assert_eq!(metric.tag("output"), Some("x"));
        assert_eq!(metric.field("errors"), Some(&FieldValue::Int(1)));
        assert_eq!(metric.field("written"), Some(&FieldValue::Int(10)));
    }

    #[test]
    fn test_plugin_tags() {
        let tags = plugin_tags("input", "cpu", "");
        assert_eq!(tags.len(), 1);

        let tags = plugin_tags("input", "cpu", "total");
        assert_eq!(tags.get("alias").map(String::as_str), Some("total"));
    }
}
