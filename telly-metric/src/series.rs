use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{IntoFieldValue, Metric, Tag};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct SeriesKey {
    name: String,
    tags: Vec<Tag>,
    timestamp: DateTime<Utc>,
}

impl SeriesKey {
    fn of(metric: &Metric) -> Self {
        Self {
            name: metric.name().to_owned(),
            tags: metric.tags().to_vec(),
            timestamp: metric.timestamp(),
        }
    }
}

/// Merges fields arriving one at a time into one metric per series and timestamp.
///
/// Metrics are keyed by name, sorted tag set and timestamp. The first value for a key creates a
/// metric, later values for the same key set or overwrite a field on it. Metrics are returned in
/// the order their keys were first seen.
#[derive(Debug, Default)]
pub struct SeriesGrouper {
    index: HashMap<SeriesKey, usize>,
    metrics: Vec<Metric>,
}

impl SeriesGrouper {
    /// Creates an empty grouper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single field value to the metric of the given series.
    ///
    /// The metric is created on first sight of the key even if the value is rejected, in which
    /// case it does not receive the field.
    pub fn add<T, K, V>(
        &mut self,
        measurement: &str,
        tags: T,
        timestamp: DateTime<Utc>,
        field: &str,
        value: impl IntoFieldValue,
    ) where
        T: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let metric = Metric::new(
            measurement,
            tags,
            None::<(String, crate::FieldValue)>,
            timestamp,
        );
        let key = SeriesKey::of(&metric);

        let index = match self.index.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.metrics.len();
                self.index.insert(key, index);
                self.metrics.push(metric);
                index
            }
        };

        self.metrics[index].add_field(field, value);
    }

    /// Adds a whole metric, merging its fields into an existing metric of the same series.
    ///
    /// A merged metric is consumed. If it was tracked, its copy is discarded.
    pub fn add_metric(&mut self, metric: Metric) {
        let key = SeriesKey::of(&metric);

        match self.index.get(&key) {
            Some(&index) => {
                let existing = &mut self.metrics[index];
                for field in metric.fields() {
                    existing.add_field(field.key.as_str(), &field.value);
                }
                metric.discard();
            }
            None => {
                self.index.insert(key, self.metrics.len());
                self.metrics.push(metric);
            }
        }
    }

    /// Returns the grouped metrics in first-seen order.
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Consumes the grouper and returns the grouped metrics in first-seen order.
    pub fn into_metrics(self) -> Vec<Metric> {
        self.metrics
    }

    /// Returns the number of grouped metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns `true` if nothing has been added.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
