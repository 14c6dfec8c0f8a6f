use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use telly_filter::Filter;
use telly_log::LogError;
use telly_metric::{Metric, Origin};
use tokio::sync::Mutex;

use crate::config::InputConfig;
use crate::selfstat::{self, GLOBAL_METRICS_GATHERED, Stat};
use crate::{Accumulator, Input, MetricMaker, PluginError, PluginKind, log_name};

#[derive(Debug)]
struct InputStats {
    metrics_gathered: Stat,
    gather_time: Stat,
    gather_timeouts: Stat,
    errors: Stat,
}

impl InputStats {
    fn register(config: &InputConfig) -> Self {
        let tags = selfstat::plugin_tags("input", &config.name, &config.alias);
        let stat = |field| selfstat::register_tags("internal_gather", field, tags.clone());

        Self {
            metrics_gathered: stat("metrics_gathered"),
            gather_time: stat("gather_time_ns"),
            gather_timeouts: stat("gather_timeouts"),
            errors: stat("errors"),
        }
    }
}

/// An input plugin with its filter, renames, tags and statistics.
pub struct RunningInput {
    input: Mutex<Box<dyn Input>>,
    config: InputConfig,
    filter: Filter,
    default_tags: BTreeMap<String, String>,
    log_name: String,
    stats: InputStats,
}

impl RunningInput {
    /// Wraps an input plugin.
    ///
    /// Fails if the filter of the configuration does not compile.
    pub fn new(input: Box<dyn Input>, config: InputConfig) -> Result<Self, PluginError> {
        let log_name = log_name(&config.name, &config.alias);
        let filter = config
            .filter
            .compile()
            .map_err(|source| PluginError::InvalidConfig {
                kind: PluginKind::Input,
                plugin: log_name.clone(),
                source: Box::new(source),
            })?;

        Ok(Self {
            input: Mutex::new(input),
            stats: InputStats::register(&config),
            config,
            filter,
            default_tags: BTreeMap::new(),
            log_name,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &InputConfig {
        &self.config
    }

    /// Sets the agent-wide tags added to every metric that lacks them.
    pub fn set_default_tags(&mut self, tags: BTreeMap<String, String>) {
        self.default_tags = tags;
    }

    /// Initializes the plugin.
    pub fn init(&mut self) -> Result<(), PluginError> {
        self.input
            .get_mut()
            .init()
            .map_err(|source| PluginError::Init {
                kind: PluginKind::Input,
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Gathers the plugin once and records the elapsed time.
    pub async fn gather(&self, acc: &dyn Accumulator) -> Result<(), PluginError> {
        let mut input = self.input.lock().await;

        let start = Instant::now();
        let result = input.gather(acc).await;
        self.stats
            .gather_time
            .set(start.elapsed().as_nanos().try_into().unwrap_or(i64::MAX));

        result.map_err(|source| PluginError::Gather {
            plugin: self.log_name.clone(),
            source,
        })
    }

    /// Records a gather that did not complete within its interval.
    pub fn record_gather_timeout(&self) {
        self.stats.gather_timeouts.incr(1);
        telly_log::warn!(
            input = %self.log_name,
            "input did not complete within its interval"
        );
    }

    /// Starts the plugin if it is a service input.
    ///
    /// Returns `false` for polled inputs.
    pub async fn start(&self, acc: Arc<dyn Accumulator>) -> Result<bool, PluginError> {
        let mut input = self.input.lock().await;
        let Some(service) = input.as_service() else {
            return Ok(false);
        };

        service
            .start(acc)
            .map(|()| true)
            .map_err(|source| PluginError::Start {
                kind: PluginKind::Input,
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Stops the plugin if it is a service input.
    pub async fn stop(&self) {
        let mut input = self.input.lock().await;
        if let Some(service) = input.as_service() {
            service.stop();
        }
    }

    fn metric_filtered(&self, metric: Metric) {
        metric.discard();
    }
}

impl MetricMaker for RunningInput {
    fn log_name(&self) -> &str {
        &self.log_name
    }

    fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
        if !self.filter.select(&metric) {
            self.metric_filtered(metric);
            return None;
        }

        super::make_metric(
            &mut metric,
            &self.config.name_override,
            &self.config.measurement_prefix,
            &self.config.measurement_suffix,
            &self.config.tags,
            &self.default_tags,
        );

        let check = metric.origin().check.clone();
        metric.set_origin(Origin {
            plugin: self.config.name.clone(),
            instance: self.config.id.clone(),
            check,
        });

        self.filter.modify(&mut metric);
        if metric.fields().is_empty() {
            self.metric_filtered(metric);
            return None;
        }

        self.stats.metrics_gathered.incr(1);
        GLOBAL_METRICS_GATHERED.incr(1);
        Some(metric)
    }

    fn on_error(&self, error: &(dyn Error + 'static)) {
        self.stats.errors.incr(1);
        telly_log::error!(input = %self.log_name, "error in plugin: {}", LogError(error));
    }
}

impl std::fmt::Debug for RunningInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInput")
            .field("name", &self.log_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use similar_asserts::assert_eq;
    use telly_filter::FilterConfig;
    use telly_metric::FieldValue;

    use super::*;
    use crate::CollectingAccumulator;
    use crate::testutils::MockInput;

    fn config(name: &str) -> InputConfig {
        InputConfig::new(name)
    }

    fn metric(name: &str) -> Metric {
        Metric::new(
            name,
            [("host", "a")],
            [("value", 1), ("other", 2)],
            Utc::now(),
        )
    }

    fn running(config: InputConfig) -> RunningInput {
        RunningInput::new(Box::new(MockInput::default()), config).unwrap()
    }

    #[test]
    fn test_make_metric_applies_renames_and_tags() {
        let mut config = config("test_make_metric_applies_renames_and_tags");
        config.name_override = "system".to_owned();
        config.measurement_prefix = "pre_".to_owned();
        config.tags.insert("host".to_owned(), "plugin".to_owned());
        config.tags.insert("dc".to_owned(), "eu".to_owned());
        config.id = "instance-1".to_owned();

        let mut input = running(config);
        input.set_default_tags([("env".to_owned(), "prod".to_owned())].into());

        let metric = input.make_metric(metric("cpu")).unwrap();
        assert_eq!(metric.name(), "pre_system");
        assert_eq!(metric.tag("host"), Some("a"));
        assert_eq!(metric.tag("dc"), Some("eu"));
        assert_eq!(metric.tag("env"), Some("prod"));
        assert_eq!(metric.origin().plugin, "test_make_metric_applies_renames_and_tags");
        assert_eq!(metric.origin().instance, "instance-1");
        assert_eq!(input.stats.metrics_gathered.get(), 1);
    }

    #[test]
    fn test_make_metric_filters() {
        let mut config = config("test_make_metric_filters");
        config.filter = FilterConfig {
            namepass: vec!["cpu*".to_owned()],
            fielddrop: vec!["other".to_owned()],
            ..Default::default()
        };
        let input = running(config);

        assert!(input.make_metric(metric("mem")).is_none());

        let metric = input.make_metric(metric("cpu")).unwrap();
        assert_eq!(metric.fields().len(), 1);
        assert_eq!(metric.field("value"), Some(&FieldValue::Int(1)));
        assert_eq!(input.stats.metrics_gathered.get(), 1);
    }

    #[test]
    fn test_emptied_metric_dropped_and_settled() {
        let mut config = config("test_emptied_metric_dropped_and_settled");
        config.filter.fielddrop = vec!["*".to_owned()];
        let input = running(config);

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let (tracked, _) = telly_metric::track(metric("cpu"), move |info| {
            assert!(info.delivered());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(input.make_metric(tracked).is_none());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(input.stats.metrics_gathered.get(), 0);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let mut config = config("test_invalid_filter_rejected");
        config.filter.namepass = vec!["cpu[".to_owned()];

        let err = RunningInput::new(Box::new(MockInput::default()), config).unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_gather_errors_are_annotated() {
        telly_test::setup();

        let input = RunningInput::new(
            Box::new(MockInput::failing("no route to host")),
            config("test_gather_errors_are_annotated"),
        )
        .unwrap();

        let acc = CollectingAccumulator::new();
        let err = input.gather(&acc).await.unwrap_err();
        assert_eq!(err.plugin(), "test_gather_errors_are_annotated");

        input.on_error(&err);
        assert_eq!(input.stats.errors.get(), 1);
    }

    #[tokio::test]
    async fn test_polled_input_does_not_start() {
        let input = running(config("test_polled_input_does_not_start"));
        let acc: Arc<dyn Accumulator> = Arc::new(CollectingAccumulator::new());
        assert!(!input.start(acc).await.unwrap());
    }
}
