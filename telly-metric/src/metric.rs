use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use chrono::{DateTime, Utc};
use fnv::FnvHasher;

use crate::tracking::Tracker;
use crate::{FieldValue, IntoFieldValue, TrackingId, ValueType};

/// A tag of a metric: a key with a string value.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tag {
    /// The tag key.
    pub key: String,
    /// The tag value.
    pub value: String,
}

/// A field of a metric: a key with a typed value.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// The field key.
    pub key: String,
    /// The field value.
    pub value: FieldValue,
}

/// Routing information attached by the check that produced a metric.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OriginCheck {
    /// Human readable name of the check.
    pub display_name: String,
    /// The target the check ran against.
    pub target: String,
    /// Additional tags used by backends to route the metric.
    pub tags: BTreeMap<String, String>,
}

/// The plugin a metric originates from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Origin {
    /// Name of the producing plugin.
    pub plugin: String,
    /// Identifier of the plugin instance.
    pub instance: String,
    /// Optional check routing information.
    pub check: Option<OriginCheck>,
}

/// A single measurement flowing through the pipeline.
///
/// Tags are unique by key and always kept sorted ascending by key. Fields are unique by key and
/// keep their insertion order, where writing an existing key replaces the value in place.
///
/// Cloning a metric creates an independent deep copy. If the metric is tracked, the clone joins
/// the same delivery group and must be settled on its own; use [`Metric::untracked_copy`] for a
/// copy that never takes part in delivery tracking.
#[derive(Clone)]
pub struct Metric {
    name: String,
    tags: Vec<Tag>,
    fields: Vec<Field>,
    timestamp: DateTime<Utc>,
    value_type: ValueType,
    aggregate: bool,
    origin: Origin,
    pub(crate) tracker: Option<Tracker>,
}

impl Metric {
    /// Creates a new untyped metric.
    ///
    /// Tags with an empty key or value are skipped. Fields with an empty key or a value that
    /// cannot be converted are skipped. Duplicate keys keep the last value.
    pub fn new<T, K, V, F, N, X>(
        name: impl Into<String>,
        tags: T,
        fields: F,
        timestamp: DateTime<Utc>,
    ) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        F: IntoIterator<Item = (N, X)>,
        N: Into<String>,
        X: IntoFieldValue,
    {
        let mut metric = Self {
            name: name.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
            value_type: ValueType::Untyped,
            aggregate: false,
            origin: Origin::default(),
            tracker: None,
        };

        for (key, value) in tags {
            let (key, value) = (key.into(), value.into());
            if !key.is_empty() && !value.is_empty() {
                metric.add_tag(key, value);
            }
        }

        for (key, value) in fields {
            let key = key.into();
            if !key.is_empty() {
                metric.add_field(key, value);
            }
        }

        metric
    }

    /// Sets the value type of this metric.
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the metric name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Prepends `prefix` to the metric name.
    pub fn add_prefix(&mut self, prefix: &str) {
        self.name.insert_str(0, prefix);
    }

    /// Appends `suffix` to the metric name.
    pub fn add_suffix(&mut self, suffix: &str) {
        self.name.push_str(suffix);
    }

    /// Returns all tags sorted by key.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Returns the value of the tag with the given key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tag_position(key)
            .ok()
            .map(|index| self.tags[index].value.as_str())
    }

    /// Returns `true` if the metric has a tag with the given key.
    pub fn has_tag(&self, key: &str) -> bool {
        self.tag_position(key).is_ok()
    }

    /// Inserts a tag, replacing the value of an existing tag with the same key.
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        match self.tag_position(&key) {
            Ok(index) => self.tags[index].value = value,
            Err(index) => self.tags.insert(index, Tag { key, value }),
        }
    }

    /// Removes the tag with the given key and returns its value.
    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        let index = self.tag_position(key).ok()?;
        Some(self.tags.remove(index).value)
    }

    /// Keeps only the tags for which the predicate returns `true`.
    pub fn retain_tags(&mut self, mut f: impl FnMut(&Tag) -> bool) {
        self.tags.retain(|tag| f(tag));
    }

    fn tag_position(&self, key: &str) -> Result<usize, usize> {
        self.tags.binary_search_by(|tag| tag.key.as_str().cmp(key))
    }

    /// Returns all fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns the value of the field with the given key.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Returns `true` if the metric has a field with the given key.
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }

    /// Sets a field, replacing the value of an existing field with the same key in place.
    ///
    /// Returns `false` if the value cannot be converted, in which case the metric is unchanged.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl IntoFieldValue) -> bool {
        let Some(value) = value.into_field_value() else {
            return false;
        };

        let key = key.into();
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { key, value }),
        }

        true
    }

    /// Removes the field with the given key and returns its value.
    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        let index = self.fields.iter().position(|f| f.key == key)?;
        Some(self.fields.remove(index).value)
    }

    /// Keeps only the fields for which the predicate returns `true`.
    pub fn retain_fields(&mut self, mut f: impl FnMut(&Field) -> bool) {
        self.fields.retain(|field| f(field));
    }

    /// Returns the metric timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Replaces the metric timestamp.
    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
    }

    /// Returns the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Returns `true` if this metric was emitted by an aggregator.
    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    /// Marks this metric as produced by an aggregator.
    pub fn set_aggregate(&mut self, aggregate: bool) {
        self.aggregate = aggregate;
    }

    /// Returns the origin of this metric.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Replaces the origin of this metric.
    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    /// Returns the series hash of this metric.
    ///
    /// The hash is FNV-1a 64 over the name and the sorted tag pairs, so metrics of the same series
    /// hash equally regardless of their fields and timestamp.
    pub fn hash_id(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(self.name.as_bytes());
        hasher.write(b"\n");
        for tag in &self.tags {
            hasher.write(tag.key.as_bytes());
            hasher.write(b"\n");
            hasher.write(tag.value.as_bytes());
            hasher.write(b"\n");
        }
        hasher.finish()
    }

    /// Returns a deep copy of this metric without delivery tracking.
    pub fn untracked_copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            timestamp: self.timestamp,
            value_type: self.value_type,
            aggregate: self.aggregate,
            origin: self.origin.clone(),
            tracker: None,
        }
    }

    /// Returns the delivery group of this metric if it is tracked.
    pub fn tracking_id(&self) -> Option<TrackingId> {
        self.tracker.as_ref().map(Tracker::id)
    }

    /// Settles this copy as delivered.
    pub fn accept(self) {
        if let Some(tracker) = self.tracker {
            tracker.accept();
        }
    }

    /// Settles this copy as failed, which marks its whole delivery group as not delivered.
    pub fn reject(self) {
        if let Some(tracker) = self.tracker {
            tracker.reject();
        }
    }

    /// Settles this copy without affecting the outcome of its delivery group.
    ///
    /// Use this for metrics removed by filters or superseded by merges.
    pub fn discard(self) {
        if let Some(tracker) = self.tracker {
            tracker.discard();
        }
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.tags == other.tags
            && self.fields == other.fields
            && self.timestamp == other.timestamp
            && self.value_type == other.value_type
            && self.aggregate == other.aggregate
            && self.origin == other.origin
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Metric");
        s.field("name", &self.name)
            .field("tags", &self.tags)
            .field("fields", &self.fields)
            .field("timestamp", &self.timestamp)
            .field("value_type", &self.value_type);

        if self.aggregate {
            s.field("aggregate", &true);
        }
        if let Some(tracker) = &self.tracker {
            s.field("tracking_id", &tracker.id());
        }

        s.finish()
    }
}
