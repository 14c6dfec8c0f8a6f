use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use telly_filter::Filter;
use telly_metric::Metric;

use crate::agent::align_time;
use crate::config::AggregatorConfig;
use crate::selfstat::{self, Stat};
use crate::{Accumulator, Aggregator, CollectingAccumulator, PluginError, PluginKind, log_name};

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug)]
struct AggregatorStats {
    metrics_pushed: Stat,
    metrics_filtered: Stat,
    metrics_dropped: Stat,
    push_time: Stat,
}

/// The aggregation window together with the plugin it feeds.
struct Window {
    aggregator: Box<dyn Aggregator>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// An aggregator plugin with its filter, time window and statistics.
///
/// Metrics are admitted into the current window `[start, end]` if their timestamp lies between
/// `start - grace` and `end + delay`, both inclusive. Each [`push`](Self::push) advances the window
/// by one period.
pub struct RunningAggregator {
    window: Mutex<Window>,
    config: AggregatorConfig,
    filter: Filter,
    log_name: String,
    stats: AggregatorStats,
}

impl RunningAggregator {
    /// Wraps an aggregator plugin.
    ///
    /// The window is empty until it is initialized with [`init_window`](Self::init_window) or
    /// [`update_window`](Self::update_window).
    pub fn new(
        aggregator: Box<dyn Aggregator>,
        config: AggregatorConfig,
    ) -> Result<Self, PluginError> {
        let log_name = log_name(&config.name, &config.alias);
        let filter = config
            .filter
            .compile()
            .map_err(|source| PluginError::InvalidConfig {
                kind: PluginKind::Aggregator,
                plugin: log_name.clone(),
                source: Box::new(source),
            })?;

        let tags = selfstat::plugin_tags("aggregator", &config.name, &config.alias);
        let stat = |field| selfstat::register_tags("internal_aggregate", field, tags.clone());
        let stats = AggregatorStats {
            metrics_pushed: stat("metrics_pushed"),
            metrics_filtered: stat("metrics_filtered"),
            metrics_dropped: stat("metrics_dropped"),
            push_time: stat("push_time_ns"),
        };

        let now = Utc::now();
        Ok(Self {
            window: Mutex::new(Window {
                aggregator,
                start: now,
                end: now,
            }),
            config,
            filter,
            log_name,
            stats,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Returns the name identifying the aggregator in logs.
    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Initializes the plugin.
    pub fn init(&mut self) -> Result<(), PluginError> {
        self.window
            .get_mut()
            .aggregator
            .init()
            .map_err(|source| PluginError::Init {
                kind: PluginKind::Aggregator,
                plugin: self.log_name.clone(),
                source,
            })
    }

    /// Returns the start of the current window.
    pub fn period_start(&self) -> DateTime<Utc> {
        self.window.lock().start
    }

    /// Returns the end of the current window.
    pub fn period_end(&self) -> DateTime<Utc> {
        self.window.lock().end
    }

    /// Replaces the current window.
    pub fn update_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut window = self.window.lock();
        window.start = start;
        window.end = end;
        telly_log::debug!(
            aggregator = %self.log_name,
            "updated aggregation range [{start}, {end}]"
        );
    }

    /// Opens the first window at `start`.
    ///
    /// With `round_interval`, the window ends at the next multiple of the period strictly after
    /// `start`. Otherwise it lasts exactly one period.
    pub fn init_window(&self, start: DateTime<Utc>, round_interval: bool) {
        let period = self.config.period();
        let end = match round_interval {
            true => {
                let end = align_time(start, period);
                if end == start {
                    align_time(start + TimeDelta::nanoseconds(1), period)
                } else {
                    end
                }
            }
            false => start
                .checked_add_signed(to_delta(period))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        self.update_window(start, end);
    }

    /// Adds a metric to the current window.
    ///
    /// Returns `true` if the original metric should be dropped instead of passed on to outputs.
    /// A metric not selected by the filter is never dropped. Every selected metric, including
    /// metrics emptied by the filter and metrics outside the window, yields the configured
    /// `drop_original`.
    pub fn add(&self, metric: &Metric) -> bool {
        if !self.filter.select(metric) {
            return false;
        }

        let mut metric = metric.untracked_copy();
        self.filter.modify(&mut metric);
        if metric.fields().is_empty() {
            self.stats.metrics_filtered.incr(1);
            return self.config.drop_original;
        }

        let mut window = self.window.lock();

        let earliest = window
            .start
            .checked_sub_signed(to_delta(self.config.grace()))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let latest = window
            .end
            .checked_add_signed(to_delta(self.config.delay()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let timestamp = metric.timestamp();
        if timestamp < earliest || timestamp > latest {
            telly_log::debug!(
                aggregator = %self.log_name,
                "metric is outside aggregation window, discarding: {timestamp} not in [{earliest}, {latest}]"
            );
            self.stats.metrics_dropped.incr(1);
            return self.config.drop_original;
        }

        window.aggregator.add(metric);
        self.config.drop_original
    }

    /// Emits the aggregates of the current window and advances the window by one period.
    pub fn push(&self, acc: &dyn Accumulator) {
        let collector = CollectingAccumulator::new();

        {
            let mut window = self.window.lock();
            let since = window.end;
            let until = since
                .checked_add_signed(to_delta(self.config.period()))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            window.start = since;
            window.end = until;

            let start = Instant::now();
            window.aggregator.push(&collector);
            self.stats
                .push_time
                .set(start.elapsed().as_nanos().try_into().unwrap_or(i64::MAX));
            window.aggregator.reset();
        }

        for metric in collector.into_metrics() {
            acc.add_metric(self.make_metric(metric));
        }
    }

    /// Applies renames and tags to an aggregate and marks it as such.
    pub fn make_metric(&self, mut metric: Metric) -> Metric {
        super::make_metric(
            &mut metric,
            &self.config.name_override,
            &self.config.measurement_prefix,
            &self.config.measurement_suffix,
            &self.config.tags,
            &Default::default(),
        );
        metric.set_aggregate(true);
        self.stats.metrics_pushed.incr(1);
        metric
    }
}

impl std::fmt::Debug for RunningAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningAggregator")
            .field("name", &self.log_name)
            .finish()
    }
}
