//! Configuration of the agent and its plugins.
//!
//! Durations are given in whole seconds unless noted otherwise. Options not known to the
//! pipeline are collected into [`PluginOptions`] and handed to the plugin factory.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use telly_filter::FilterConfig;
use telly_metric::Precision;

/// Plugin specific options.
pub type PluginOptions = serde_json::Map<String, serde_json::Value>;

/// Default number of metrics written to an output in one batch.
pub const DEFAULT_METRIC_BATCH_SIZE: usize = 1000;

/// Default number of metrics an output buffers before dropping the oldest.
pub const DEFAULT_METRIC_BUFFER_LIMIT: usize = 10_000;

/// Configuration of an input plugin.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InputConfig {
    /// Name of the plugin in the registry.
    pub name: String,
    /// Distinguishes multiple instances of the same plugin in logs and stats.
    pub alias: String,
    /// Stable identifier of this plugin instance.
    pub id: String,
    /// Gather interval in seconds, overriding the agent interval.
    pub interval: Option<u64>,
    /// Timestamp precision, overriding the agent precision.
    pub precision: Option<Precision>,
    /// Maximum random delay in seconds before each gather, overriding the agent jitter.
    pub collection_jitter: Option<u64>,
    /// Replaces the name of every gathered metric.
    pub name_override: String,
    /// Prepended to the name of every gathered metric.
    pub measurement_prefix: String,
    /// Appended to the name of every gathered metric.
    pub measurement_suffix: String,
    /// Tags added to every gathered metric unless already present.
    pub tags: BTreeMap<String, String>,
    /// Metric filter.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Options of the plugin itself.
    #[serde(flatten)]
    pub options: PluginOptions,
}

impl InputConfig {
    /// Creates a configuration for the named plugin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the configured gather interval.
    pub fn interval(&self) -> Option<Duration> {
        self.interval.map(Duration::from_secs)
    }

    /// Returns the configured collection jitter.
    pub fn collection_jitter(&self) -> Option<Duration> {
        self.collection_jitter.map(Duration::from_secs)
    }
}

/// Configuration of an output plugin.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Name of the plugin in the registry.
    pub name: String,
    /// Distinguishes multiple instances of the same plugin in logs and stats.
    pub alias: String,
    /// Stable identifier of this plugin instance.
    pub id: String,
    /// Flush interval in seconds, overriding the agent flush interval.
    pub flush_interval: Option<u64>,
    /// Maximum random delay in seconds before each flush, overriding the agent jitter.
    pub flush_jitter: Option<u64>,
    /// Number of metrics kept in the buffer, overriding the agent limit.
    pub metric_buffer_limit: Option<usize>,
    /// Number of metrics written in one batch, overriding the agent batch size.
    pub metric_batch_size: Option<usize>,
    /// Replaces the name of every written metric.
    pub name_override: String,
    /// Prepended to the name of every written metric.
    pub name_prefix: String,
    /// Appended to the name of every written metric.
    pub name_suffix: String,
    /// Metric filter.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Options of the plugin itself.
    #[serde(flatten)]
    pub options: PluginOptions,
}

impl OutputConfig {
    /// Creates a configuration for the named plugin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the configured flush interval.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval.map(Duration::from_secs)
    }

    /// Returns the configured flush jitter.
    pub fn flush_jitter(&self) -> Option<Duration> {
        self.flush_jitter.map(Duration::from_secs)
    }
}

/// Configuration of a processor plugin.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Name of the plugin in the registry.
    pub name: String,
    /// Distinguishes multiple instances of the same plugin in logs and stats.
    pub alias: String,
    /// Stable identifier of this plugin instance.
    pub id: String,
    /// Position in the processor chain, lower runs first.
    pub order: i64,
    /// Metric filter.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Options of the plugin itself.
    #[serde(flatten)]
    pub options: PluginOptions,
}

impl ProcessorConfig {
    /// Creates a configuration for the named plugin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Configuration of an aggregator plugin.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Name of the plugin in the registry.
    pub name: String,
    /// Distinguishes multiple instances of the same plugin in logs and stats.
    pub alias: String,
    /// Stable identifier of this plugin instance.
    pub id: String,
    /// Drops metrics the aggregator selected instead of passing them on to outputs.
    pub drop_original: bool,
    /// Length of the aggregation window in seconds.
    ///
    /// Defaults to `30` seconds.
    pub period: u64,
    /// Time in milliseconds after the window end during which late metrics are still admitted.
    ///
    /// Defaults to `100` milliseconds.
    pub delay: u64,
    /// Time in seconds before the window start during which early metrics are admitted.
    pub grace: u64,
    /// Replaces the name of every aggregated metric.
    pub name_override: String,
    /// Prepended to the name of every aggregated metric.
    pub measurement_prefix: String,
    /// Appended to the name of every aggregated metric.
    pub measurement_suffix: String,
    /// Tags added to every aggregated metric unless already present.
    pub tags: BTreeMap<String, String>,
    /// Metric filter.
    #[serde(flatten)]
    pub filter: FilterConfig,
    /// Options of the plugin itself.
    #[serde(flatten)]
    pub options: PluginOptions,
}

impl AggregatorConfig {
    /// Creates a configuration for the named plugin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the window length.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    /// Returns the admission delay after the window end.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay)
    }

    /// Returns the admission grace before the window start.
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            alias: String::new(),
            id: String::new(),
            drop_original: false,
            period: 30,
            delay: 100,
            grace: 0,
            name_override: String::new(),
            measurement_prefix: String::new(),
            measurement_suffix: String::new(),
            tags: BTreeMap::new(),
            filter: FilterConfig::default(),
            options: PluginOptions::new(),
        }
    }
}

/// Configuration of the agent.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Default gather interval in seconds.
    ///
    /// Defaults to `10` seconds.
    pub interval: u64,
    /// Aligns gathering and aggregation windows to multiples of their interval.
    ///
    /// Defaults to `true`.
    pub round_interval: bool,
    /// Default timestamp precision of gathered metrics.
    pub precision: Precision,
    /// Default maximum random delay in seconds before each gather.
    pub collection_jitter: u64,
    /// Default flush interval of outputs in seconds.
    ///
    /// Defaults to `10` seconds.
    pub flush_interval: u64,
    /// Default maximum random delay in seconds before each flush.
    pub flush_jitter: u64,
    /// Default number of metrics written to an output in one batch.
    pub metric_batch_size: usize,
    /// Default number of metrics an output buffers.
    pub metric_buffer_limit: usize,
    /// Time in seconds to wait before retrying a failed output connection.
    ///
    /// Defaults to `15` seconds.
    pub connect_retry_delay: u64,
    /// Tags added to every gathered metric unless already present.
    pub tags: BTreeMap<String, String>,
    /// Reports the agent's self statistics through the pipeline on every interval.
    ///
    /// The statistics are sent as metrics named after their measurement, such as
    /// `internal_write`, and pass through processors, aggregators and outputs like gathered
    /// metrics.
    pub internal_stats: bool,
    /// Configured inputs.
    pub inputs: Vec<InputConfig>,
    /// Configured processors.
    pub processors: Vec<ProcessorConfig>,
    /// Configured aggregators.
    pub aggregators: Vec<AggregatorConfig>,
    /// Configured outputs.
    pub outputs: Vec<OutputConfig>,
}

impl AgentConfig {
    /// Returns the default gather interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Returns the default collection jitter.
    pub fn collection_jitter(&self) -> Duration {
        Duration::from_secs(self.collection_jitter)
    }

    /// Returns the default flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    /// Returns the default flush jitter.
    pub fn flush_jitter(&self) -> Duration {
        Duration::from_secs(self.flush_jitter)
    }

    /// Returns the delay before retrying a failed connection.
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            round_interval: true,
            precision: Precision::default(),
            collection_jitter: 0,
            flush_interval: 10,
            flush_jitter: 0,
            metric_batch_size: DEFAULT_METRIC_BATCH_SIZE,
            metric_buffer_limit: DEFAULT_METRIC_BUFFER_LIMIT,
            connect_retry_delay: 15,
            tags: BTreeMap::new(),
            internal_stats: false,
            inputs: Vec::new(),
            processors: Vec::new(),
            aggregators: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_agent_defaults() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert!(config.round_interval);
        assert_eq!(config.metric_batch_size, 1000);
        assert_eq!(config.metric_buffer_limit, 10_000);
        assert_eq!(config.connect_retry_delay(), Duration::from_secs(15));
        assert!(!config.internal_stats);
    }

    #[test]
    fn test_aggregator_defaults() {
        let config = AggregatorConfig::default();
        assert_eq!(config.period(), Duration::from_secs(30));
        assert_eq!(config.delay(), Duration::from_millis(100));
        assert_eq!(config.grace(), Duration::ZERO);
    }

    #[test]
    fn test_plugin_options_and_filter_flattened() {
        let json = r#"{
            "name": "http",
            "alias": "api",
            "interval": 5,
            "namepass": ["http_*"],
            "tags": {"dc": "eu"},
            "url": "http://localhost:8080",
            "timeout": 3
        }"#;

        let config: InputConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "http");
        assert_eq!(config.interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.filter.namepass, vec!["http_*".to_owned()]);
        assert_eq!(config.tags.get("dc").map(String::as_str), Some("eu"));
        assert_eq!(
            config.options.get("url"),
            Some(&serde_json::Value::from("http://localhost:8080"))
        );
        assert!(config.options.get("namepass").is_none());
    }

    #[test]
    fn test_agent_plugin_lists() {
        let json = r#"{
            "interval": 1,
            "outputs": [{"name": "file", "metric_batch_size": 10}],
            "aggregators": [{"name": "minmax", "period": 60, "grace": 5}]
        }"#;

        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.outputs[0].metric_batch_size, Some(10));
        assert_eq!(config.aggregators[0].period(), Duration::from_secs(60));
        assert_eq!(config.aggregators[0].delay(), Duration::from_millis(100));
    }
}
