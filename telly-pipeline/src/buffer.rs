use std::collections::VecDeque;

use parking_lot::Mutex;
use telly_metric::Metric;

use crate::config::DEFAULT_METRIC_BUFFER_LIMIT;
use crate::selfstat::{self, Stat};

/// Statistics of a [`Buffer`], reported under `internal_write`.
#[derive(Clone, Debug)]
pub struct BufferStats {
    /// Metrics added to the buffer.
    pub metrics_added: Stat,
    /// Metrics accepted by the output.
    pub metrics_written: Stat,
    /// Metrics evicted or not restored after a failed write.
    pub metrics_dropped: Stat,
    /// Current number of buffered metrics, including metrics in flight.
    pub buffer_size: Stat,
    /// Capacity of the buffer.
    pub buffer_limit: Stat,
}

impl BufferStats {
    fn register(name: &str, alias: &str, capacity: usize) -> Self {
        let tags = selfstat::plugin_tags("output", name, alias);
        let stat = |field| selfstat::register_tags("internal_write", field, tags.clone());

        let stats = Self {
            metrics_added: stat("metrics_added"),
            metrics_written: stat("metrics_written"),
            metrics_dropped: stat("metrics_dropped"),
            buffer_size: stat("buffer_size"),
            buffer_limit: stat("buffer_limit"),
        };
        stats.buffer_limit.set(capacity as i64);
        stats
    }
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<Metric>,
    in_flight: usize,
    capacity: usize,
}

impl Inner {
    fn len(&self) -> usize {
        self.entries.len() + self.in_flight
    }
}

/// A bounded FIFO of metrics owned by one output.
///
/// When full, adding a metric evicts the oldest one. Metrics taken with [`batch`](Self::batch)
/// remain accounted for as in flight until the batch is either accepted, which removes it for
/// good, or rejected, which returns it to the front of the buffer for the next write.
///
/// Evicted metrics are rejected. Written metrics are accepted.
#[derive(Debug)]
pub struct Buffer {
    inner: Mutex<Inner>,
    stats: BufferStats,
}

impl Buffer {
    /// Creates a buffer for the named output.
    ///
    /// A capacity of zero is replaced with the default limit.
    pub fn new(name: &str, alias: &str, capacity: usize) -> Self {
        let capacity = match capacity {
            0 => {
                telly_log::warn!(
                    output = name,
                    "invalid buffer limit of zero, using {DEFAULT_METRIC_BUFFER_LIMIT}"
                );
                DEFAULT_METRIC_BUFFER_LIMIT
            }
            capacity => capacity,
        };

        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_METRIC_BUFFER_LIMIT)),
                in_flight: 0,
                capacity,
            }),
            stats: BufferStats::register(name, alias, capacity),
        }
    }

    /// Returns the statistics of this buffer.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Returns the capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Returns the number of buffered metrics, including metrics in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns `true` if no metric is buffered or in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends metrics and returns the number of metrics dropped to make room.
    ///
    /// When the buffer is full while a batch is in flight, the oldest in-flight metric gives up
    /// its slot and is counted as dropped right away. It is settled once its batch returns, and
    /// is not restored should the batch be rejected.
    pub fn add(&self, metrics: impl IntoIterator<Item = Metric>) -> usize {
        let mut dropped = Vec::new();
        let mut displaced = 0;
        let mut inner = self.inner.lock();

        for metric in metrics {
            self.stats.metrics_added.incr(1);

            if inner.len() >= inner.capacity {
                if inner.in_flight > 0 {
                    inner.in_flight -= 1;
                    displaced += 1;
                } else if let Some(oldest) = inner.entries.pop_front() {
                    dropped.push(oldest);
                }
            }

            inner.entries.push_back(metric);
        }

        self.stats.buffer_size.set(inner.len() as i64);
        drop(inner);

        self.stats.metrics_dropped.incr(displaced as i64);
        displaced + self.drop_metrics(dropped)
    }

    /// Takes up to `size` of the oldest metrics for writing.
    pub fn batch(&self, size: usize) -> Vec<Metric> {
        let mut inner = self.inner.lock();
        let size = size.min(inner.entries.len());

        let batch: Vec<_> = inner.entries.drain(..size).collect();
        inner.in_flight += batch.len();
        batch
    }

    /// Removes a written batch for good.
    pub fn accept(&self, batch: Vec<Metric>) {
        let written = batch.len();
        for metric in batch {
            metric.accept();
        }

        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(written);
        self.stats.metrics_written.incr(written as i64);
        self.stats.buffer_size.set(inner.len() as i64);
    }

    /// Returns a failed batch to the front of the buffer in its original order.
    ///
    /// If metrics were added while the batch was in flight and there is no longer room for the
    /// whole batch, its oldest metrics are rejected. [`add`](Self::add) already counted them as
    /// dropped.
    pub fn reject(&self, batch: Vec<Metric>) {
        if batch.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(batch.len());

        let free = inner.capacity.saturating_sub(inner.len());
        let restore = batch.len().min(free);
        let skip = batch.len() - restore;

        let mut batch = batch.into_iter();
        let dropped: Vec<_> = batch.by_ref().take(skip).collect();
        for metric in batch.rev() {
            inner.entries.push_front(metric);
        }

        self.stats.buffer_size.set(inner.len() as i64);
        drop(inner);

        for metric in dropped {
            metric.reject();
        }
    }

    fn drop_metrics(&self, metrics: Vec<Metric>) -> usize {
        let dropped = metrics.len();
        for metric in metrics {
            metric.reject();
        }
        self.stats.metrics_dropped.incr(dropped as i64);
        dropped
    }
}
