//! Accumulators collect the metrics emitted by plugins.
//!
//! Plugins only see the [`Accumulator`] trait. The pipeline provides:
//!
//!  - [`MetricAccumulator`], which passes metrics through a [`MetricMaker`] and forwards the
//!    survivors into the pipeline,
//!  - [`TrackingAccumulator`], which attaches delivery tracking to metric groups,
//!  - [`CollectingAccumulator`], which keeps emitted metrics in memory.

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use telly_log::LogError;
use telly_metric::{DeliveryInfo, FieldValue, Metric, Precision, TrackingId, ValueType};
use tokio::sync::mpsc;

use crate::BoxError;
use crate::selfstat::GLOBAL_GATHER_ERRORS;

/// Tags passed to [`Accumulator::add_fields`] and friends.
pub type Tags = Vec<(String, String)>;

/// Fields passed to [`Accumulator::add_fields`] and friends.
pub type Fields = Vec<(String, FieldValue)>;

/// Receives metrics and errors from a plugin.
pub trait Accumulator: Send + Sync {
    /// Adds a measurement of the given type.
    ///
    /// Without a timestamp, the current time is used.
    fn add_measurement(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
        value_type: ValueType,
    );

    /// Adds a complete metric.
    fn add_metric(&self, metric: Metric);

    /// Reports an error of the plugin.
    fn add_error(&self, error: BoxError);

    /// Wraps this accumulator to attach delivery tracking to metrics.
    ///
    /// At most `max_undelivered` delivery notifications are buffered for the consumer. The caller
    /// must keep at most `max_undelivered` tracked groups outstanding and read from
    /// [`TrackingAccumulator::delivered`] before adding more. A notification that finds the
    /// buffer full is logged and lost.
    fn with_tracking(self: Arc<Self>, max_undelivered: usize) -> TrackingAccumulator;

    /// Adds an untyped measurement.
    fn add_fields(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.add_measurement(measurement, fields, tags, timestamp, ValueType::Untyped);
    }

    /// Adds a gauge measurement.
    fn add_gauge(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.add_measurement(measurement, fields, tags, timestamp, ValueType::Gauge);
    }

    /// Adds a counter measurement.
    fn add_counter(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.add_measurement(measurement, fields, tags, timestamp, ValueType::Counter);
    }

    /// Adds a summary measurement.
    fn add_summary(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.add_measurement(measurement, fields, tags, timestamp, ValueType::Summary);
    }

    /// Adds a histogram measurement.
    fn add_histogram(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.add_measurement(measurement, fields, tags, timestamp, ValueType::Histogram);
    }
}

pub(crate) fn build_metric(
    measurement: &str,
    fields: Fields,
    tags: Tags,
    timestamp: DateTime<Utc>,
    value_type: ValueType,
) -> Metric {
    Metric::new(measurement, tags, fields, timestamp).with_type(value_type)
}

/// Turns raw plugin metrics into pipeline metrics.
///
/// Implemented by the running wrappers, which apply filters, renames and tags.
pub trait MetricMaker: Send + Sync {
    /// Returns the name identifying the plugin in logs.
    fn log_name(&self) -> &str;

    /// Returns the metric to pass on, or `None` if it was removed.
    ///
    /// Removed metrics are settled by the maker.
    fn make_metric(&self, metric: Metric) -> Option<Metric>;

    /// Handles an error reported by the plugin.
    fn on_error(&self, error: &(dyn Error + 'static)) {
        telly_log::error!(plugin = self.log_name(), "error in plugin: {}", LogError(error));
    }
}

/// The accumulator handed to inputs.
///
/// Every metric is rounded to the configured precision, passed through the [`MetricMaker`] and
/// sent into the pipeline.
pub struct MetricAccumulator {
    maker: Arc<dyn MetricMaker>,
    sink: mpsc::UnboundedSender<Metric>,
    precision: Precision,
}

impl MetricAccumulator {
    /// Creates an accumulator sending made metrics into `sink`.
    pub fn new(
        maker: Arc<dyn MetricMaker>,
        sink: mpsc::UnboundedSender<Metric>,
        precision: Precision,
    ) -> Self {
        Self {
            maker,
            sink,
            precision,
        }
    }

    /// Returns the timestamp precision.
    pub fn precision(&self) -> Precision {
        self.precision
    }
}

impl Accumulator for MetricAccumulator {
    fn add_measurement(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
        value_type: ValueType,
    ) {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        self.add_metric(build_metric(measurement, fields, tags, timestamp, value_type));
    }

    fn add_metric(&self, mut metric: Metric) {
        metric.set_timestamp(self.precision.round(metric.timestamp()));

        let Some(metric) = self.maker.make_metric(metric) else {
            return;
        };

        if let Err(mpsc::error::SendError(metric)) = self.sink.send(metric) {
            telly_log::debug!(
                plugin = self.maker.log_name(),
                "pipeline closed, discarding metric"
            );
            metric.discard();
        }
    }

    fn add_error(&self, error: BoxError) {
        GLOBAL_GATHER_ERRORS.incr(1);
        self.maker.on_error(&*error);
    }

    fn with_tracking(self: Arc<Self>, max_undelivered: usize) -> TrackingAccumulator {
        TrackingAccumulator::new(self, max_undelivered)
    }
}

/// An accumulator that attaches delivery tracking to metric groups.
///
/// Delivery notifications are sent to a bounded channel obtained once from
/// [`delivered`](Self::delivered). If the consumer falls behind and the channel is full, the
/// notification is logged and discarded.
pub struct TrackingAccumulator {
    inner: Arc<dyn Accumulator>,
    notifications: mpsc::Sender<DeliveryInfo>,
    delivered: Mutex<Option<mpsc::Receiver<DeliveryInfo>>>,
}

impl TrackingAccumulator {
    /// Wraps `inner` with a notification channel of `max_undelivered` slots.
    pub fn new(inner: Arc<dyn Accumulator>, max_undelivered: usize) -> Self {
        let (notifications, delivered) = mpsc::channel(max_undelivered.max(1));
        Self {
            inner,
            notifications,
            delivered: Mutex::new(Some(delivered)),
        }
    }

    /// Adds a single tracked metric and returns its tracking ID.
    pub fn add_tracking_metric(&self, metric: Metric) -> TrackingId {
        let (metric, id) = telly_metric::track(metric, self.notifier());
        self.inner.add_metric(metric);
        id
    }

    /// Adds all metrics produced from one source message as a single delivery group.
    ///
    /// The returned ID is reported through [`delivered`](Self::delivered) once every metric of
    /// the group has been settled. An empty group is reported immediately.
    pub fn add_tracking_metric_group(&self, metrics: Vec<Metric>) -> TrackingId {
        let (metrics, id) = telly_metric::track_group(metrics, self.notifier());
        for metric in metrics {
            self.inner.add_metric(metric);
        }
        id
    }

    /// Takes the receiving end of the delivery notifications.
    ///
    /// Returns `None` if the receiver has already been taken.
    pub fn delivered(&self) -> Option<mpsc::Receiver<DeliveryInfo>> {
        self.delivered.lock().take()
    }

    fn notifier(&self) -> impl Fn(DeliveryInfo) + Send + Sync + 'static {
        let notifications = self.notifications.clone();
        move |info| match notifications.try_send(info) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(info)) => {
                telly_log::error!(
                    tracking_id = info.id().value(),
                    "delivery notification channel is full, dropping notification"
                );
            }
            Err(mpsc::error::TrySendError::Closed(info)) => {
                telly_log::debug!(
                    tracking_id = info.id().value(),
                    "delivery notification receiver closed"
                );
            }
        }
    }
}

impl Accumulator for TrackingAccumulator {
    fn add_measurement(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
        value_type: ValueType,
    ) {
        self.inner
            .add_measurement(measurement, fields, tags, timestamp, value_type);
    }

    fn add_metric(&self, metric: Metric) {
        self.inner.add_metric(metric);
    }

    fn add_error(&self, error: BoxError) {
        self.inner.add_error(error);
    }

    fn with_tracking(self: Arc<Self>, max_undelivered: usize) -> TrackingAccumulator {
        TrackingAccumulator::new(self, max_undelivered)
    }
}

/// An accumulator that keeps all emitted metrics in memory.
#[derive(Default)]
pub struct CollectingAccumulator {
    metrics: Mutex<Vec<Metric>>,
    errors: Mutex<Vec<String>>,
}

impl CollectingAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all metrics collected so far.
    pub fn take_metrics(&self) -> Vec<Metric> {
        std::mem::take(&mut *self.metrics.lock())
    }

    /// Consumes the accumulator and returns the collected metrics.
    pub fn into_metrics(self) -> Vec<Metric> {
        self.metrics.into_inner()
    }

    /// Returns the messages of all reported errors.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl Accumulator for CollectingAccumulator {
    fn add_measurement(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
        value_type: ValueType,
    ) {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        self.add_metric(build_metric(measurement, fields, tags, timestamp, value_type));
    }

    fn add_metric(&self, metric: Metric) {
        self.metrics.lock().push(metric);
    }

    fn add_error(&self, error: BoxError) {
        telly_log::warn!("error in plugin: {}", LogError(&*error));
        self.errors.lock().push(error.to_string());
    }

    fn with_tracking(self: Arc<Self>, max_undelivered: usize) -> TrackingAccumulator {
        TrackingAccumulator::new(self, max_undelivered)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;

    struct PassThrough;

    impl MetricMaker for PassThrough {
        fn log_name(&self) -> &str {
            "pass"
        }

        fn make_metric(&self, metric: Metric) -> Option<Metric> {
            if metric.name() == "drop_me" {
                metric.discard();
                return None;
            }
            Some(metric)
        }
    }

    fn fields(value: i64) -> Fields {
        vec![("value".to_owned(), FieldValue::Int(value))]
    }

    #[test]
    fn test_metric_accumulator_rounds_and_filters() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let acc = MetricAccumulator::new(Arc::new(PassThrough), tx, Precision::Second);

        let ts = Utc.timestamp_opt(10, 700_000_000).unwrap();
        acc.add_gauge("cpu", fields(1), vec![], Some(ts));
        acc.add_fields("drop_me", fields(2), vec![], Some(ts));

        let metric = rx.try_recv().unwrap();
        assert_eq!(metric.name(), "cpu");
        assert_eq!(metric.value_type(), ValueType::Gauge);
        assert_eq!(metric.timestamp(), Utc.timestamp_opt(11, 0).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_metric_accumulator_closed_pipeline() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let acc = Arc::new(MetricAccumulator::new(
            Arc::new(PassThrough),
            tx,
            Precision::Nanosecond,
        ));
        let tracking = acc.with_tracking(4);
        let mut delivered = tracking.delivered().unwrap();

        let id = tracking.add_tracking_metric(Metric::new(
            "cpu",
            None::<(&str, &str)>,
            [("value", 1)],
            Utc::now(),
        ));

        let info = delivered.try_recv().unwrap();
        assert_eq!(info.id(), id);
        assert!(info.delivered());
    }

    #[test]
    fn test_tracking_group_notifies_once_settled() {
        let collector = Arc::new(CollectingAccumulator::new());
        let tracking = Arc::clone(&collector).with_tracking(4);
        let mut delivered = tracking.delivered().unwrap();
        assert!(tracking.delivered().is_none());

        let metrics = vec![
            Metric::new("a", None::<(&str, &str)>, [("v", 1)], Utc::now()),
            Metric::new("b", None::<(&str, &str)>, [("v", 2)], Utc::now()),
        ];
        let id = tracking.add_tracking_metric_group(metrics);

        let mut collected = collector.take_metrics().into_iter();
        collected.next().unwrap().accept();
        assert!(delivered.try_recv().is_err());
        collected.next().unwrap().reject();

        let info = delivered.try_recv().unwrap();
        assert_eq!(info.id(), id);
        assert!(!info.delivered());
    }

    #[test]
    fn test_tracking_empty_group() {
        let collector = Arc::new(CollectingAccumulator::new());
        let tracking = collector.with_tracking(1);
        let mut delivered = tracking.delivered().unwrap();

        let id = tracking.add_tracking_metric_group(Vec::new());
        let info = delivered.try_recv().unwrap();
        assert_eq!(info.id(), id);
        assert!(info.delivered());
    }

    #[test]
    fn test_full_notification_channel_does_not_panic() {
        telly_test::setup();

        let collector = Arc::new(CollectingAccumulator::new());
        let tracking = Arc::clone(&collector).with_tracking(1);
        let mut delivered = tracking.delivered().unwrap();

        let first = tracking.add_tracking_metric_group(Vec::new());
        let _second = tracking.add_tracking_metric_group(Vec::new());

        assert_eq!(delivered.try_recv().unwrap().id(), first);
        assert!(delivered.try_recv().is_err());
    }

    #[test]
    fn test_collecting_errors() {
        let collector = CollectingAccumulator::new();
        collector.add_error("connection refused".into());
        assert_eq!(collector.errors(), vec!["connection refused".to_owned()]);
    }
}
