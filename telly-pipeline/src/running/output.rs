use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use telly_filter::Filter;
use telly_log::LogError;
use telly_metric::Metric;
use tokio::sync::Notify;

use crate::config::{DEFAULT_METRIC_BATCH_SIZE, DEFAULT_METRIC_BUFFER_LIMIT, OutputConfig};
use crate::selfstat::{self, Stat};
use crate::{AggregatingOutput, Buffer, Output, PluginError, PluginKind, log_name};

#[derive(Debug)]
struct OutputStats {
    metrics_filtered: Stat,
    write_time: Stat,
    errors: Stat,
}

/// An output plugin with its filter, renames, buffer and statistics.
///
/// Metrics are added to the buffer as they arrive and written in batches, either periodically by
/// [`write`](Self::write) or by [`write_batch`](Self::write_batch) once a full batch has
/// accumulated, as signaled through [`batch_ready`](Self::batch_ready).
pub struct RunningOutput {
    output: tokio::sync::Mutex<Box<dyn Output>>,
    aggregating: Option<Mutex<Box<dyn AggregatingOutput>>>,
    config: OutputConfig,
    filter: Filter,
    log_name: String,
    batch_size: usize,
    buffer: Buffer,
    new_metrics: AtomicUsize,
    dropped_metrics: AtomicUsize,
    batch_ready: Notify,
    stats: OutputStats,
}

impl RunningOutput {
    /// Wraps an output plugin.
    ///
    /// Batch size and buffer limit fall back to the given defaults when not configured.
    pub fn new(
        mut output: Box<dyn Output>,
        config: OutputConfig,
        batch_size: usize,
        buffer_limit: usize,
    ) -> Result<Self, PluginError> {
        let log_name = log_name(&config.name, &config.alias);
        let filter = config
            .filter
            .compile()
            .map_err(|source| PluginError::InvalidConfig {
                kind: PluginKind::Output,
                plugin: log_name.clone(),
                source: Box::new(source),
            })?;

        let batch_size = match config.metric_batch_size.unwrap_or(batch_size) {
            0 => DEFAULT_METRIC_BATCH_SIZE,
            size => size,
        };
        let buffer_limit = config.metric_buffer_limit.unwrap_or(buffer_limit);

        let tags = selfstat::plugin_tags("output", &config.name, &config.alias);
        let stat = |field| selfstat::register_tags("internal_write", field, tags.clone());
        let stats = OutputStats {
            metrics_filtered: stat("metrics_filtered"),
            write_time: stat("write_time_ns"),
            errors: stat("errors"),
        };

        Ok(Self {
            aggregating: output.take_aggregating().map(Mutex::new),
            output: tokio::sync::Mutex::new(output),
            buffer: Buffer::new(&config.name, &config.alias, buffer_limit),
            config,
            filter,
            log_name,
            batch_size,
            new_metrics: AtomicUsize::new(0),
            dropped_metrics: AtomicUsize::new(0),
            batch_ready: Notify::new(),
            stats,
        })
    }

    /// Wraps an output plugin with the default batch size and buffer limit.
    pub fn with_defaults(output: Box<dyn Output>, config: OutputConfig) -> Result<Self, PluginError> {
        Self::new(
            output,
            config,
            DEFAULT_METRIC_BATCH_SIZE,
            DEFAULT_METRIC_BUFFER_LIMIT,
        )
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Returns the name identifying the output in logs.
    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Returns the number of metrics written in one batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the buffer of this output.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Initializes the plugin.
    pub fn init(&mut self) -> Result<(), PluginError> {
        self.output
            .get_mut()
            .init()
            .map_err(|source| PluginError::Init {
                kind: PluginKind::Output,
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Connects the plugin to its backend.
    pub async fn connect(&self) -> Result<(), PluginError> {
        self.output
            .lock()
            .await
            .connect()
            .await
            .map_err(|source| PluginError::Connect {
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Closes the plugin, logging failures.
    pub async fn close(&self) {
        if let Err(source) = self.output.lock().await.close().await {
            let error = PluginError::Close {
                plugin: self.log_name.clone(),
                source,
            };
            telly_log::error!(output = %self.log_name, "{}", LogError(&error));
        }
    }

    /// Adds a metric to the output.
    ///
    /// Metrics not selected by the filter, or emptied by it, are dropped. Aggregating outputs
    /// receive the metric directly. All others buffer it for the next write.
    pub fn add_metric(&self, mut metric: Metric) {
        if !self.filter.select(&metric) {
            self.metric_filtered(metric);
            return;
        }

        self.filter.modify(&mut metric);
        if metric.fields().is_empty() {
            self.metric_filtered(metric);
            return;
        }

        if let Some(aggregating) = &self.aggregating {
            aggregating.lock().add(metric.untracked_copy());
            metric.accept();
            return;
        }

        if !self.config.name_override.is_empty() {
            metric.set_name(self.config.name_override.as_str());
        }
        if !self.config.name_prefix.is_empty() {
            metric.add_prefix(&self.config.name_prefix);
        }
        if !self.config.name_suffix.is_empty() {
            metric.add_suffix(&self.config.name_suffix);
        }

        let dropped = self.buffer.add([metric]);
        self.dropped_metrics.fetch_add(dropped, Ordering::Relaxed);

        let count = self.new_metrics.fetch_add(1, Ordering::AcqRel) + 1;
        if count == self.batch_size {
            self.new_metrics.store(0, Ordering::Release);
            self.batch_ready.notify_one();
        }
    }

    /// Resolves once a full batch of new metrics has been added since the last write.
    ///
    /// Holds at most one pending signal, so several full batches arriving between two writes
    /// resolve only once.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await;
    }

    /// Writes all buffered metrics in batches.
    ///
    /// Aggregating outputs first push their aggregates into the buffer. Only metrics buffered
    /// when the write starts are written. On the first failing batch the batch is returned to
    /// the buffer and the error is returned.
    pub async fn write(&self) -> Result<(), PluginError> {
        let mut output = self.output.lock().await;

        if let Some(aggregating) = &self.aggregating {
            let mut aggregating = aggregating.lock();
            let metrics = aggregating.push();
            let dropped = self.buffer.add(metrics);
            self.dropped_metrics.fetch_add(dropped, Ordering::Relaxed);
            aggregating.reset();
        }

        self.new_metrics.store(0, Ordering::Release);

        let batches = self.buffer.len().div_ceil(self.batch_size);
        for _ in 0..batches {
            let batch = self.buffer.batch(self.batch_size);
            if batch.is_empty() {
                break;
            }

            self.write_metrics(&mut **output, batch).await?;
        }

        Ok(())
    }

    /// Writes a single batch.
    pub async fn write_batch(&self) -> Result<(), PluginError> {
        let mut output = self.output.lock().await;

        let batch = self.buffer.batch(self.batch_size);
        if batch.is_empty() {
            return Ok(());
        }

        self.write_metrics(&mut **output, batch).await
    }

    /// Logs the current buffer fullness.
    pub fn log_buffer_status(&self) {
        telly_log::debug!(
            output = %self.log_name,
            "buffer fullness: {} / {} metrics",
            self.buffer.len(),
            self.buffer.capacity()
        );
    }

    async fn write_metrics(
        &self,
        output: &mut dyn Output,
        batch: Vec<Metric>,
    ) -> Result<(), PluginError> {
        let dropped = self.dropped_metrics.swap(0, Ordering::AcqRel);
        if dropped > 0 {
            telly_log::warn!(
                output = %self.log_name,
                "metric buffer overflow; {dropped} metrics have been dropped"
            );
        }

        let start = Instant::now();
        let result = output.write(&batch).await;
        let elapsed = start.elapsed();
        self.stats
            .write_time
            .set(elapsed.as_nanos().try_into().unwrap_or(i64::MAX));

        match result {
            Ok(()) => {
                telly_log::debug!(
                    output = %self.log_name,
                    "wrote batch of {} metrics in {elapsed:?}",
                    batch.len()
                );
                self.buffer.accept(batch);
                Ok(())
            }
            Err(source) => {
                self.stats.errors.incr(1);
                self.buffer.reject(batch);
                Err(PluginError::Write {
                    plugin: self.log_name.clone(),
                    source,
                })
            }
        }
    }

    fn metric_filtered(&self, metric: Metric) {
        self.stats.metrics_filtered.incr(1);
        metric.discard();
    }
}

impl std::fmt::Debug for RunningOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningOutput")
            .field("name", &self.log_name)
            .field("batch_size", &self.batch_size)
            .field("buffer", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutils::{MockOutput, SumAggregator, WriteGate};

    fn metric(value: i64) -> Metric {
        Metric::new(
            "cpu",
            [("host", "a")],
            [("value", value)],
            Utc.timestamp_opt(value, 0).unwrap(),
        )
    }

    fn values(metrics: &[Metric]) -> Vec<i64> {
        metrics.iter().map(|m| m.timestamp().timestamp()).collect()
    }

    fn running(name: &str, output: &MockOutput, batch: usize, limit: usize) -> RunningOutput {
        RunningOutput::new(Box::new(output.clone()), OutputConfig::new(name), batch, limit).unwrap()
    }

    #[tokio::test]
    async fn test_write_in_batches() {
        let mock = MockOutput::default();
        let output = running("test_write_in_batches", &mock, 2, 10);

        for i in 1..=5 {
            output.add_metric(metric(i));
        }
        output.write().await.unwrap();

        let batches = mock.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(values(&batches[0]), vec![1, 2]);
        assert_eq!(values(&batches[2]), vec![5]);
        assert!(output.buffer().is_empty());
        assert_eq!(output.buffer().stats().metrics_written.get(), 5);
    }

    #[tokio::test]
    async fn test_failed_write_retried_in_order() {
        let mock = MockOutput::default();
        let output = running("test_failed_write_retried_in_order", &mock, 2, 10);

        for i in 1..=3 {
            output.add_metric(metric(i));
        }

        mock.set_failing(true);
        let err = output.write().await.unwrap_err();
        assert!(matches!(err, PluginError::Write { .. }));
        assert_eq!(output.buffer().len(), 3);

        output.add_metric(metric(4));
        mock.set_failing(false);
        output.write().await.unwrap();

        let written: Vec<_> = mock.batches().iter().flat_map(|b| values(b)).collect();
        assert_eq!(written, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_write_batch_writes_one_batch() {
        let mock = MockOutput::default();
        let output = running("test_write_batch_writes_one_batch", &mock, 2, 10);

        for i in 1..=3 {
            output.add_metric(metric(i));
        }
        output.write_batch().await.unwrap();

        assert_eq!(mock.batches().len(), 1);
        assert_eq!(output.buffer().len(), 1);

        output.write_batch().await.unwrap();
        output.write_batch().await.unwrap();
        assert_eq!(mock.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_ready_signaled_at_batch_size() {
        let mock = MockOutput::default();
        let output = running("test_batch_ready_signaled_at_batch_size", &mock, 3, 10);

        output.add_metric(metric(1));
        output.add_metric(metric(2));
        let pending = tokio::time::timeout(Duration::from_millis(10), output.batch_ready()).await;
        assert!(pending.is_err());

        output.add_metric(metric(3));
        tokio::time::timeout(Duration::from_millis(10), output.batch_ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_filter_and_rename() {
        let mock = MockOutput::default();
        let mut config = OutputConfig::new("test_filter_and_rename");
        config.filter.namedrop = vec!["mem".to_owned()];
        config.name_prefix = "out_".to_owned();
        let output = RunningOutput::new(Box::new(mock.clone()), config, 10, 10).unwrap();

        output.add_metric(metric(1));
        output.add_metric(Metric::new("mem", None::<(&str, &str)>, [("v", 1)], Utc::now()));
        output.write().await.unwrap();

        let written = &mock.batches()[0];
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].name(), "out_cpu");
        assert_eq!(output.stats.metrics_filtered.get(), 1);
    }

    #[tokio::test]
    async fn test_overflow_reported_on_next_write() {
        telly_test::setup();

        let mock = MockOutput::default();
        let output = running("test_overflow_reported_on_next_write", &mock, 10, 2);

        for i in 1..=5 {
            output.add_metric(metric(i));
        }
        assert_eq!(output.dropped_metrics.load(Ordering::Relaxed), 3);

        output.write().await.unwrap();
        assert_eq!(output.dropped_metrics.load(Ordering::Relaxed), 0);
        assert_eq!(values(&mock.batches()[0]), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_tracked_metric_accepted_after_write() {
        let mock = MockOutput::default();
        let output = running("test_tracked_metric_accepted_after_write", &mock, 10, 10);

        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);
        let (tracked, _) = telly_metric::track(metric(1), move |info| {
            flag.store(info.delivered(), Ordering::SeqCst);
        });

        output.add_metric(tracked);
        assert!(!delivered.load(Ordering::SeqCst));

        output.write().await.unwrap();
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_aggregating_output() {
        let aggregator = SumAggregator::default();
        let mock = MockOutput::default().with_aggregating(aggregator.clone());
        let output = running("test_aggregating_output", &mock, 10, 10);

        output.add_metric(metric(1));
        output.add_metric(metric(2));
        assert!(output.buffer().is_empty());

        output.write().await.unwrap();
        let written = &mock.batches()[0];
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].field("sum"), Some(&telly_metric::FieldValue::Float(3.0)));
        assert_eq!(aggregator.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let mock = MockOutput::default();
        let output = running("test_connect_and_close", &mock, 10, 10);

        output.connect().await.unwrap();
        output.close().await;
        assert!(mock.is_connected());
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_add_while_write_blocked() {
        let gate = Arc::new(WriteGate::default());
        let mock = MockOutput::default().with_gate(Arc::clone(&gate));
        let output = Arc::new(running("test_add_while_write_blocked", &mock, 2, 3));

        for i in 1..=3 {
            output.add_metric(metric(i));
        }

        let writer = tokio::spawn({
            let output = Arc::clone(&output);
            async move { output.write_batch().await }
        });
        gate.started.notified().await;

        output.add_metric(metric(4));
        output.add_metric(metric(5));
        assert_eq!(output.buffer().len(), 3);
        assert_eq!(output.dropped_metrics.load(Ordering::Relaxed), 2);

        gate.release.notify_one();
        writer.await.unwrap().unwrap();

        assert_eq!(values(&mock.batches()[0]), vec![1, 2]);
        assert_eq!(values(&output.buffer().batch(10)), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_rejected_batch_overflow_reported() {
        telly_test::setup();

        let gate = Arc::new(WriteGate::default());
        let mock = MockOutput::default().with_gate(Arc::clone(&gate));
        let output = Arc::new(running("test_rejected_batch_overflow_reported", &mock, 2, 3));

        for i in 1..=3 {
            output.add_metric(metric(i));
        }

        mock.set_failing(true);
        let writer = tokio::spawn({
            let output = Arc::clone(&output);
            async move { output.write_batch().await }
        });
        gate.started.notified().await;

        output.add_metric(metric(4));
        output.add_metric(metric(5));
        gate.release.notify_one();
        assert!(writer.await.unwrap().is_err());

        assert_eq!(output.dropped_metrics.load(Ordering::Relaxed), 2);
        assert_eq!(output.buffer().stats().metrics_dropped.get(), 2);
        assert_eq!(values(&output.buffer().batch(10)), vec![3, 4, 5]);
    }
}
