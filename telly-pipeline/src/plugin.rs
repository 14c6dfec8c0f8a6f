//! Interfaces implemented by plugins.
//!
//! Optional capabilities are expressed through provided trait methods. An input becomes a
//! service input by returning itself from [`Input::as_service`], and an output exposes its
//! aggregating half through [`Output::take_aggregating`].

use std::sync::Arc;

use async_trait::async_trait;
use telly_metric::Metric;

use crate::{Accumulator, BoxError};

/// A plugin producing metrics when gathered.
#[async_trait]
pub trait Input: Send {
    /// Validates the configuration and prepares the plugin.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Gathers metrics into the accumulator.
    async fn gather(&mut self, acc: &dyn Accumulator) -> Result<(), BoxError>;

    /// Returns the streaming interface of this input, if it has one.
    fn as_service(&mut self) -> Option<&mut dyn ServiceInput> {
        None
    }
}

/// An input that produces metrics continuously in the background.
pub trait ServiceInput: Send {
    /// Starts producing metrics into the accumulator.
    ///
    /// The accumulator stays valid until [`stop`](Self::stop) returns.
    fn start(&mut self, acc: Arc<dyn Accumulator>) -> Result<(), BoxError>;

    /// Stops producing metrics and releases the accumulator.
    fn stop(&mut self);
}

/// A plugin writing batches of metrics to a backend.
#[async_trait]
pub trait Output: Send {
    /// Validates the configuration and prepares the plugin.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Connects to the backend.
    async fn connect(&mut self) -> Result<(), BoxError>;

    /// Writes a batch of metrics.
    ///
    /// On error, the whole batch is retried on a later write.
    async fn write(&mut self, metrics: &[Metric]) -> Result<(), BoxError>;

    /// Closes the connection to the backend.
    async fn close(&mut self) -> Result<(), BoxError>;

    /// Hands out the aggregating half of this output.
    ///
    /// This is called once when the output is wrapped. Outputs returning an aggregator receive
    /// metrics only through it, and the metrics it pushes are written instead.
    fn take_aggregating(&mut self) -> Option<Box<dyn AggregatingOutput>> {
        None
    }
}

/// An output that aggregates metrics before writing them.
pub trait AggregatingOutput: Send {
    /// Adds a metric to the aggregation.
    fn add(&mut self, metric: Metric);

    /// Returns the aggregated metrics.
    fn push(&mut self) -> Vec<Metric>;

    /// Clears the aggregation.
    fn reset(&mut self);
}

/// A plugin transforming one metric into zero or more metrics.
pub trait Processor: Send {
    /// Validates the configuration and prepares the plugin.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Starts the processor.
    ///
    /// Processors that emit metrics on their own, independent of [`add`](Self::add), emit them
    /// into this accumulator.
    fn start(&mut self, _acc: Arc<dyn Accumulator>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Processes a metric and emits the results into the accumulator.
    ///
    /// The processor owns the metric. Metrics that are not emitted must be settled, usually with
    /// [`Metric::discard`].
    fn add(&mut self, metric: Metric, acc: &dyn Accumulator) -> Result<(), BoxError>;

    /// Stops the processor.
    fn stop(&mut self) {}
}

/// A plugin summarizing metrics over a time window.
pub trait Aggregator: Send {
    /// Validates the configuration and prepares the plugin.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Adds a metric to the current window.
    fn add(&mut self, metric: Metric);

    /// Emits the aggregates of the current window into the accumulator.
    fn push(&mut self, acc: &dyn Accumulator);

    /// Clears the aggregates for the next window.
    fn reset(&mut self);
}
