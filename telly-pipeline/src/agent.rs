//! Scheduling of all plugins of an agent.
//!
//! The [`Agent`] wires running plugins into a pipeline:
//!
//! ```text
//! inputs ─▶ router ─▶ processors ─▶ aggregators ─┬─▶ outputs
//!                                      │          │
//!                                      └─ push ───┘
//! ```
//!
//! Every polled input gathers on its own task. A single router task passes metrics through the
//! processors in order, offers them to every aggregator and fans them out to all outputs. Each
//! aggregator pushes its aggregates directly to the outputs once per period, and each output
//! flushes its buffer on its own task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rand::Rng;
use telly_log::LogError;
use telly_metric::{Metric, ValueType};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::accumulator::{Fields, Tags, build_metric};
use crate::config::AgentConfig;
use crate::selfstat;
use crate::{
    Accumulator, BoxError, CollectingAccumulator, MetricAccumulator, MetricMaker, PluginError,
    PluginKind, Registry, RunningAggregator, RunningInput, RunningOutput, RunningProcessor,
    TrackingAccumulator,
};

/// Rounds `t` up to the next multiple of `interval` since the Unix epoch.
///
/// Times that already are a multiple are returned unchanged, as is `t` for an empty interval.
pub fn align_time(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let Ok(delta) = TimeDelta::from_std(interval) else {
        return t;
    };

    match t.duration_trunc(delta) {
        Ok(truncated) if truncated == t => t,
        Ok(truncated) => truncated.checked_add_signed(delta).unwrap_or(t),
        Err(_) => t,
    }
}

/// Returns the time until `t`, or zero if it has passed.
fn until(t: DateTime<Utc>) -> Duration {
    (t - Utc::now()).to_std().unwrap_or_default()
}

/// Sleeps for a random duration below `jitter`.
///
/// Returns `false` if the token was cancelled while sleeping.
async fn sleep_jitter(jitter: Duration, shutdown: &CancellationToken) -> bool {
    if jitter.is_zero() {
        return true;
    }

    let delay = rand::rng().random_range(Duration::ZERO..jitter);
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn invalid_interval(kind: PluginKind, plugin: &str) -> PluginError {
    PluginError::InvalidConfig {
        kind,
        plugin: plugin.to_owned(),
        source: "interval must be positive".into(),
    }
}

/// Offers metrics to aggregators and fans them out to outputs.
#[derive(Debug)]
struct Fanout {
    aggregators: Vec<Arc<RunningAggregator>>,
    outputs: Vec<Arc<RunningOutput>>,
}

impl Fanout {
    fn route(&self, metric: Metric) {
        let mut drop_original = false;
        for aggregator in &self.aggregators {
            drop_original |= aggregator.add(&metric);
        }

        if drop_original {
            metric.discard();
            return;
        }

        let Some((last, rest)) = self.outputs.split_last() else {
            metric.discard();
            return;
        };

        for output in rest {
            output.add_metric(metric.clone());
        }
        last.add_metric(metric);
    }
}

impl Accumulator for Fanout {
    fn add_measurement(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
        value_type: ValueType,
    ) {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        self.route(build_metric(measurement, fields, tags, timestamp, value_type));
    }

    fn add_metric(&self, metric: Metric) {
        self.route(metric);
    }

    fn add_error(&self, error: BoxError) {
        telly_log::error!("error in pipeline: {}", LogError(&*error));
    }

    fn with_tracking(self: Arc<Self>, max_undelivered: usize) -> TrackingAccumulator {
        TrackingAccumulator::new(self, max_undelivered)
    }
}

/// Runs a metric through all processors in order.
fn process(processors: &[Arc<RunningProcessor>], metric: Metric) -> Vec<Metric> {
    let mut metrics = vec![metric];

    for processor in processors {
        let acc = CollectingAccumulator::new();
        for metric in metrics {
            if let Err(error) = processor.add(metric, &acc) {
                telly_log::error!(
                    processor = processor.log_name(),
                    "{}",
                    LogError(&error)
                );
            }
        }
        metrics = acc.into_metrics();
    }

    metrics
}

/// An input together with its accumulator.
struct ScheduledInput {
    input: Arc<RunningInput>,
    acc: Arc<MetricAccumulator>,
}

/// The running plugins of an agent.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    inputs: Vec<Arc<RunningInput>>,
    processors: Vec<Arc<RunningProcessor>>,
    aggregators: Vec<Arc<RunningAggregator>>,
    outputs: Vec<Arc<RunningOutput>>,
}

impl Agent {
    /// Creates and initializes all plugins named in the configuration.
    ///
    /// Processors are ordered by their configured `order`, keeping the configuration order for
    /// equal values.
    pub fn new(config: AgentConfig, registry: &Registry) -> Result<Self, PluginError> {
        if config.internal_stats && config.interval().is_zero() {
            return Err(invalid_interval(PluginKind::Input, "internal"));
        }

        let mut inputs = Vec::with_capacity(config.inputs.len());
        for input_config in &config.inputs {
            let plugin = registry.create_input(&input_config.name, &input_config.options)?;
            let mut input = RunningInput::new(plugin, input_config.clone())?;
            if input_config.interval().unwrap_or(config.interval()).is_zero() {
                return Err(invalid_interval(PluginKind::Input, input.log_name()));
            }
            input.set_default_tags(config.tags.clone());
            input.init()?;
            inputs.push(Arc::new(input));
        }

        let mut processors = Vec::with_capacity(config.processors.len());
        for processor_config in &config.processors {
            let plugin =
                registry.create_processor(&processor_config.name, &processor_config.options)?;
            let mut processor = RunningProcessor::new(plugin, processor_config.clone())?;
            processor.init()?;
            processors.push(Arc::new(processor));
        }
        processors.sort_by_key(|processor| processor.order());

        let mut aggregators = Vec::with_capacity(config.aggregators.len());
        for aggregator_config in &config.aggregators {
            let plugin =
                registry.create_aggregator(&aggregator_config.name, &aggregator_config.options)?;
            let mut aggregator = RunningAggregator::new(plugin, aggregator_config.clone())?;
            if aggregator_config.period().is_zero() {
                return Err(invalid_interval(
                    PluginKind::Aggregator,
                    aggregator.log_name(),
                ));
            }
            aggregator.init()?;
            aggregators.push(Arc::new(aggregator));
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        for output_config in &config.outputs {
            let plugin = registry.create_output(&output_config.name, &output_config.options)?;
            let mut output = RunningOutput::new(
                plugin,
                output_config.clone(),
                config.metric_batch_size,
                config.metric_buffer_limit,
            )?;
            if output_config
                .flush_interval()
                .unwrap_or(config.flush_interval())
                .is_zero()
            {
                return Err(invalid_interval(PluginKind::Output, output.log_name()));
            }
            output.init()?;
            outputs.push(Arc::new(output));
        }

        Ok(Self {
            config,
            inputs,
            processors,
            aggregators,
            outputs,
        })
    }

    /// Returns the agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Returns the running inputs.
    pub fn inputs(&self) -> &[Arc<RunningInput>] {
        &self.inputs
    }

    /// Returns the running processors in the order they are applied.
    pub fn processors(&self) -> &[Arc<RunningProcessor>] {
        &self.processors
    }

    /// Returns the running aggregators.
    pub fn aggregators(&self) -> &[Arc<RunningAggregator>] {
        &self.aggregators
    }

    /// Returns the running outputs.
    pub fn outputs(&self) -> &[Arc<RunningOutput>] {
        &self.outputs
    }

    /// Runs the pipeline until `shutdown` is cancelled.
    ///
    /// On shutdown, inputs are stopped first. Metrics already gathered are then drained through
    /// processors and aggregators, aggregators push one final time, and outputs write their
    /// remaining buffers before they are closed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PluginError> {
        telly_log::info!(
            "starting agent with {} inputs, {} processors, {} aggregators and {} outputs",
            self.inputs.len(),
            self.processors.len(),
            self.aggregators.len(),
            self.outputs.len()
        );

        self.connect_outputs(&shutdown).await?;

        let fanout = Arc::new(Fanout {
            aggregators: self.aggregators.clone(),
            outputs: self.outputs.clone(),
        });

        for (index, processor) in self.processors.iter().enumerate() {
            if let Err(error) = processor.start(fanout.clone()) {
                for started in &self.processors[..index] {
                    started.stop();
                }
                return Err(error);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (services, polled) = match self.start_inputs(&tx).await {
            Ok(inputs) => inputs,
            Err(error) => {
                self.stop_processors();
                return Err(error);
            }
        };
        let stats_sink = self.config.internal_stats.then(|| tx.clone());
        drop(tx);

        let outputs_token = CancellationToken::new();
        let mut output_tasks = JoinSet::new();
        for output in &self.outputs {
            let config = output.config();
            output_tasks.spawn(flush_loop(
                Arc::clone(output),
                config.flush_interval().unwrap_or(self.config.flush_interval()),
                config.flush_jitter().unwrap_or(self.config.flush_jitter()),
                outputs_token.clone(),
            ));
        }

        let sink = Arc::new(Fanout {
            aggregators: Vec::new(),
            outputs: self.outputs.clone(),
        });
        let aggregators_token = CancellationToken::new();
        let mut aggregator_tasks = JoinSet::new();
        let now = Utc::now();
        for aggregator in &self.aggregators {
            aggregator.init_window(now, self.config.round_interval);
            aggregator_tasks.spawn(push_loop(
                Arc::clone(aggregator),
                Arc::clone(&sink),
                aggregators_token.clone(),
            ));
        }

        let router_token = CancellationToken::new();
        let router = tokio::spawn(route_loop(
            rx,
            self.processors.clone(),
            Arc::clone(&fanout),
            router_token.clone(),
        ));

        let inputs_token = CancellationToken::new();
        let mut input_tasks = JoinSet::new();
        for ScheduledInput { input, acc } in polled {
            let config = input.config();
            input_tasks.spawn(gather_loop(
                GatherSchedule {
                    interval: config.interval().unwrap_or(self.config.interval()),
                    jitter: config
                        .collection_jitter()
                        .unwrap_or(self.config.collection_jitter()),
                    round_interval: self.config.round_interval,
                },
                input,
                acc,
                inputs_token.clone(),
            ));
        }

        if let Some(sink) = stats_sink {
            input_tasks.spawn(report_loop(
                self.config.interval(),
                sink,
                inputs_token.clone(),
            ));
        }

        shutdown.cancelled().await;
        telly_log::info!("stopping agent");

        inputs_token.cancel();
        while input_tasks.join_next().await.is_some() {}
        for ScheduledInput { input, .. } in &services {
            input.stop().await;
        }
        drop(services);

        router_token.cancel();
        if let Err(error) = router.await {
            telly_log::error!("router task failed: {}", LogError(&error));
        }
        self.stop_processors();

        aggregators_token.cancel();
        while aggregator_tasks.join_next().await.is_some() {}

        outputs_token.cancel();
        while output_tasks.join_next().await.is_some() {}
        for output in &self.outputs {
            output.close().await;
        }

        telly_log::info!("agent stopped");
        Ok(())
    }

    /// Connects all outputs, retrying each failed connection once.
    async fn connect_outputs(&self, shutdown: &CancellationToken) -> Result<(), PluginError> {
        let retry_delay = self.config.connect_retry_delay();

        for output in &self.outputs {
            telly_log::debug!(output = output.log_name(), "connecting output");

            if let Err(error) = output.connect().await {
                telly_log::error!(
                    output = output.log_name(),
                    "failed to connect, retrying in {retry_delay:?}: {}",
                    LogError(&error)
                );

                tokio::select! {
                    _ = shutdown.cancelled() => return Err(error),
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                output.connect().await?;
            }

            telly_log::debug!(output = output.log_name(), "successfully connected output");
        }

        Ok(())
    }

    /// Creates accumulators for all inputs and starts service inputs.
    ///
    /// Returns the service inputs and the polled inputs separately.
    async fn start_inputs(
        &self,
        tx: &mpsc::UnboundedSender<Metric>,
    ) -> Result<(Vec<ScheduledInput>, Vec<ScheduledInput>), PluginError> {
        let mut services = Vec::new();
        let mut polled = Vec::new();

        for input in &self.inputs {
            let precision = input.config().precision.unwrap_or(self.config.precision);
            let maker: Arc<dyn MetricMaker> = input.clone();
            let acc = Arc::new(MetricAccumulator::new(maker, tx.clone(), precision));

            let scheduled = ScheduledInput {
                input: Arc::clone(input),
                acc: Arc::clone(&acc),
            };

            match input.start(acc).await {
                Ok(true) => services.push(scheduled),
                Ok(false) => polled.push(scheduled),
                Err(error) => {
                    for ScheduledInput { input, .. } in &services {
                        input.stop().await;
                    }
                    return Err(error);
                }
            }
        }

        Ok((services, polled))
    }

    fn stop_processors(&self) {
        for processor in &self.processors {
            processor.stop();
        }
    }
}

/// Timing of an input's gather loop.
#[derive(Clone, Copy, Debug)]
struct GatherSchedule {
    interval: Duration,
    jitter: Duration,
    round_interval: bool,
}

/// Gathers an input once per interval until cancelled.
async fn gather_loop(
    schedule: GatherSchedule,
    input: Arc<RunningInput>,
    acc: Arc<MetricAccumulator>,
    shutdown: CancellationToken,
) {
    let GatherSchedule {
        interval,
        jitter,
        round_interval,
    } = schedule;

    let mut start = Instant::now();
    if round_interval {
        start += until(align_time(Utc::now(), interval));
    }

    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !sleep_jitter(jitter, &shutdown).await {
            break;
        }

        gather_once(&input, &*acc, interval, &shutdown).await;
    }
}

/// Gathers an input, recording every interval it takes longer.
async fn gather_once(
    input: &RunningInput,
    acc: &dyn Accumulator,
    interval: Duration,
    shutdown: &CancellationToken,
) {
    let gather = input.gather(acc);
    tokio::pin!(gather);

    let mut slow = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            result = &mut gather => {
                if let Err(error) = result {
                    acc.add_error(Box::new(error));
                }
                return;
            }
            _ = slow.tick() => input.record_gather_timeout(),
            _ = shutdown.cancelled() => {
                telly_log::warn!(
                    input = input.log_name(),
                    "gather cancelled by shutdown"
                );
                return;
            }
        }
    }
}

/// Sends the self statistics into the pipeline once per interval until cancelled.
async fn report_loop(
    interval: Duration,
    sink: mpsc::UnboundedSender<Metric>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for metric in selfstat::metrics() {
            if let Err(mpsc::error::SendError(metric)) = sink.send(metric) {
                metric.discard();
                return;
            }
        }
    }
}

/// Passes gathered metrics through the pipeline.
///
/// After cancellation, metrics already sent are still drained.
async fn route_loop(
    mut rx: mpsc::UnboundedReceiver<Metric>,
    processors: Vec<Arc<RunningProcessor>>,
    fanout: Arc<Fanout>,
    shutdown: CancellationToken,
) {
    let route = |metric| {
        for metric in process(&processors, metric) {
            fanout.route(metric);
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            metric = rx.recv() => match metric {
                Some(metric) => route(metric),
                None => break,
            },
        }
    }

    rx.close();
    while let Some(metric) = rx.recv().await {
        route(metric);
    }
}

/// Pushes an aggregator at the end of every window, and once more when cancelled.
async fn push_loop(aggregator: Arc<RunningAggregator>, sink: Arc<Fanout>, shutdown: CancellationToken) {
    let config = aggregator.config();
    let first = Instant::now() + until(aggregator.period_end()) + config.delay();

    let mut ticker = tokio::time::interval_at(first, config.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => aggregator.push(&*sink),
        }
    }

    aggregator.push(&*sink);
}

/// Writes an output periodically and whenever a full batch is ready, then once more when
/// cancelled.
async fn flush_loop(
    output: Arc<RunningOutput>,
    interval: Duration,
    jitter: Duration,
    shutdown: CancellationToken,
) {
    let log_result = |result: Result<(), PluginError>| {
        if let Err(error) = result {
            telly_log::error!(output = output.log_name(), "{}", LogError(&error));
        }
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !sleep_jitter(jitter, &shutdown).await {
                    break;
                }
                output.log_buffer_status();
                log_result(output.write().await);
            }
            _ = output.batch_ready() => log_result(output.write_batch().await),
        }
    }

    telly_log::debug!(
        output = output.log_name(),
        "flushing {} buffered metrics",
        output.buffer().len()
    );
    log_result(output.write().await);
}
