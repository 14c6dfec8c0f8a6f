//! In-memory plugins for pipeline tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use telly_metric::Metric;
use tokio::sync::Notify;

use crate::{Accumulator, AggregatingOutput, Aggregator, BoxError, Input, Output, Processor};

/// Emits clones of its metrics on every gather, or fails.
#[derive(Clone, Debug, Default)]
pub struct MockInput {
    metrics: Vec<Metric>,
    error: Option<String>,
    pub gathers: Arc<AtomicUsize>,
}

impl MockInput {
    pub fn with_metrics(metrics: Vec<Metric>) -> Self {
        Self {
            metrics,
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_owned()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Input for MockInput {
    async fn gather(&mut self, acc: &dyn Accumulator) -> Result<(), BoxError> {
        self.gathers.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.error {
            return Err(error.clone().into());
        }

        for metric in &self.metrics {
            let mut metric = metric.clone();
            metric.set_timestamp(Utc::now());
            acc.add_metric(metric);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutputState {
    batches: Vec<Vec<Metric>>,
    failing: bool,
    connected: bool,
    closed: bool,
}

/// Holds writes of a [`MockOutput`] until released.
#[derive(Debug, Default)]
pub struct WriteGate {
    /// Notified when a write starts waiting.
    pub started: Notify,
    /// Releases one waiting write.
    pub release: Notify,
}

/// Records written batches. Clones share the recorded state.
#[derive(Clone, Debug, Default)]
pub struct MockOutput {
    state: Arc<Mutex<OutputState>>,
    aggregating: Option<SumAggregator>,
    gate: Option<Arc<WriteGate>>,
}

impl MockOutput {
    pub fn with_gate(mut self, gate: Arc<WriteGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_aggregating(mut self, aggregator: SumAggregator) -> Self {
        self.aggregating = Some(aggregator);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn batches(&self) -> Vec<Vec<Metric>> {
        self.state.lock().batches.clone()
    }

    pub fn written(&self) -> Vec<Metric> {
        self.state.lock().batches.concat()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Output for MockOutput {
    async fn connect(&mut self) -> Result<(), BoxError> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> Result<(), BoxError> {
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state.lock();
        if state.failing {
            return Err("connection refused".into());
        }

        state
            .batches
            .push(metrics.iter().map(Metric::untracked_copy).collect());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn take_aggregating(&mut self) -> Option<Box<dyn AggregatingOutput>> {
        self.aggregating
            .take()
            .map(|aggregator| Box::new(aggregator) as Box<dyn AggregatingOutput>)
    }
}

/// Renames every metric it processes.
#[derive(Debug)]
pub struct RenameProcessor {
    name: String,
}

impl RenameProcessor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl Processor for RenameProcessor {
    fn add(&mut self, mut metric: Metric, acc: &dyn Accumulator) -> Result<(), BoxError> {
        metric.set_name(self.name.as_str());
        acc.add_metric(metric);
        Ok(())
    }
}

/// Sums all numeric fields per metric name into a single `sum` field.
#[derive(Clone, Debug, Default)]
pub struct SumAggregator {
    sums: BTreeMap<String, f64>,
    pub added: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
}

impl SumAggregator {
    fn add_metric(&mut self, metric: Metric) {
        self.added.fetch_add(1, Ordering::SeqCst);
        let total: f64 = metric.fields().iter().filter_map(|f| f.value.as_f64()).sum();
        *self.sums.entry(metric.name().to_owned()).or_default() += total;
        metric.discard();
    }

    fn aggregates(&self) -> Vec<Metric> {
        let now = Utc::now();
        self.sums
            .iter()
            .map(|(name, sum)| Metric::new(name.as_str(), None::<(&str, &str)>, [("sum", *sum)], now))
            .collect()
    }

    fn clear(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.sums.clear();
    }
}

impl Aggregator for SumAggregator {
    fn add(&mut self, metric: Metric) {
        self.add_metric(metric);
    }

    fn push(&mut self, acc: &dyn Accumulator) {
        for metric in self.aggregates() {
            acc.add_metric(metric);
        }
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl AggregatingOutput for SumAggregator {
    fn add(&mut self, metric: Metric) {
        self.add_metric(metric);
    }

    fn push(&mut self) -> Vec<Metric> {
        self.aggregates()
    }

    fn reset(&mut self) {
        self.clear();
    }
}
