use std::sync::Arc;

use parking_lot::Mutex;
use telly_filter::Filter;
use telly_metric::Metric;

use crate::config::ProcessorConfig;
use crate::selfstat::{self, Stat};
use crate::{Accumulator, PluginError, PluginKind, Processor, log_name};

/// A processor plugin with its filter and statistics.
///
/// Metrics not selected by the filter pass through unmodified.
pub struct RunningProcessor {
    processor: Mutex<Box<dyn Processor>>,
    config: ProcessorConfig,
    filter: Filter,
    log_name: String,
    metrics_filtered: Stat,
    errors: Stat,
}

impl RunningProcessor {
    /// Wraps a processor plugin.
    pub fn new(processor: Box<dyn Processor>, config: ProcessorConfig) -> Result<Self, PluginError> {
        let log_name = log_name(&config.name, &config.alias);
        let filter = config
            .filter
            .compile()
            .map_err(|source| PluginError::InvalidConfig {
                kind: PluginKind::Processor,
                plugin: log_name.clone(),
                source: Box::new(source),
            })?;

        let tags = selfstat::plugin_tags("processor", &config.name, &config.alias);
        Ok(Self {
            processor: Mutex::new(processor),
            metrics_filtered: selfstat::register_tags(
                "internal_process",
                "metrics_filtered",
                tags.clone(),
            ),
            errors: selfstat::register_tags("internal_process", "errors", tags),
            config,
            filter,
            log_name,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Returns the position of this processor in the chain.
    pub fn order(&self) -> i64 {
        self.config.order
    }

    /// Returns the name identifying the processor in logs.
    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Initializes the plugin.
    pub fn init(&mut self) -> Result<(), PluginError> {
        self.processor
            .get_mut()
            .init()
            .map_err(|source| PluginError::Init {
                kind: PluginKind::Processor,
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Starts the plugin.
    pub fn start(&self, acc: Arc<dyn Accumulator>) -> Result<(), PluginError> {
        self.processor
            .lock()
            .start(acc)
            .map_err(|source| PluginError::Start {
                kind: PluginKind::Processor,
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Processes a metric, emitting the results into `acc`.
    pub fn add(&self, mut metric: Metric, acc: &dyn Accumulator) -> Result<(), PluginError> {
        if !self.filter.select(&metric) {
            acc.add_metric(metric);
            return Ok(());
        }

        self.filter.modify(&mut metric);
        if metric.fields().is_empty() {
            self.metrics_filtered.incr(1);
            metric.discard();
            return Ok(());
        }

        self.processor.lock().add(metric, acc).map_err(|source| {
            self.errors.incr(1);
            PluginError::Process {
                plugin: self.log_name.clone(),
                source,
            }
        })
    }

    /// Stops the plugin.
    pub fn stop(&self) {
        self.processor.lock().stop();
    }
}

impl std::fmt::Debug for RunningProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProcessor")
            .field("name", &self.log_name)
            .field("order", &self.config.order)
            .finish()
    }
}
