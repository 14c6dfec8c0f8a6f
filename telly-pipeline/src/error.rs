use std::fmt;

/// A boxed error returned by plugins.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The category of a plugin.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PluginKind {
    /// Produces metrics.
    Input,
    /// Transforms metrics.
    Processor,
    /// Summarizes metrics over a time window.
    Aggregator,
    /// Writes metrics to a backend.
    Output,
}

impl PluginKind {
    /// Returns the lowercase name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Processor => "processor",
            Self::Aggregator => "aggregator",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the name used to identify a plugin in logs and errors.
///
/// This is `name` on its own, or `name::alias` if an alias is configured.
pub fn log_name(name: &str, alias: &str) -> String {
    match alias {
        "" => name.to_owned(),
        alias => format!("{name}::{alias}"),
    }
}

/// An error raised by a plugin, annotated with the plugin's identity.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin's initializer failed.
    #[error("could not initialize {kind} {plugin}")]
    Init {
        /// The kind of the failing plugin.
        kind: PluginKind,
        /// The log name of the failing plugin.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// An output could not connect to its backend.
    #[error("error connecting to output {plugin}")]
    Connect {
        /// The log name of the failing output.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// An input failed to gather.
    #[error("error gathering input {plugin}")]
    Gather {
        /// The log name of the failing input.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// An output failed to write a batch.
    #[error("error writing to output {plugin}")]
    Write {
        /// The log name of the failing output.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// An output failed to close.
    #[error("error closing output {plugin}")]
    Close {
        /// The log name of the failing output.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// A service input or streaming processor failed to start.
    #[error("could not start {kind} {plugin}")]
    Start {
        /// The kind of the failing plugin.
        kind: PluginKind,
        /// The log name of the failing plugin.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// A processor failed to process a metric.
    #[error("error processing metric in processor {plugin}")]
    Process {
        /// The log name of the failing processor.
        plugin: String,
        /// The plugin's error.
        #[source]
        source: BoxError,
    },
    /// No factory is registered under the requested name.
    #[error("undefined but requested {kind} '{name}'")]
    UnknownPlugin {
        /// The kind of plugin requested.
        kind: PluginKind,
        /// The requested plugin name.
        name: String,
    },
    /// The plugin configuration was rejected.
    #[error("invalid configuration for {kind} {plugin}")]
    InvalidConfig {
        /// The kind of the misconfigured plugin.
        kind: PluginKind,
        /// The log name of the misconfigured plugin.
        plugin: String,
        /// The reason the configuration was rejected.
        #[source]
        source: BoxError,
    },
}

impl PluginError {
    /// Returns the log name of the plugin this error belongs to.
    pub fn plugin(&self) -> &str {
        match self {
            Self::Init { plugin, .. }
            | Self::Connect { plugin, .. }
            | Self::Gather { plugin, .. }
            | Self::Write { plugin, .. }
            | Self::Close { plugin, .. }
            | Self::Start { plugin, .. }
            | Self::Process { plugin, .. }
            | Self::InvalidConfig { plugin, .. } => plugin,
            Self::UnknownPlugin { name, .. } => name,
        }
    }
}
