//! Factories creating plugins by name.
//!
//! The [`Registry`] is populated explicitly by the embedding binary, usually from a list of
//! built-in plugins:
//!
//! ```
//! use telly_pipeline::{Accumulator, BoxError, Input, Registry};
//!
//! struct Uptime;
//!
//! #[async_trait::async_trait]
//! impl Input for Uptime {
//!     async fn gather(&mut self, acc: &dyn Accumulator) -> Result<(), BoxError> {
//!         acc.add_fields("uptime", vec![("seconds".to_owned(), 42_i64.into())], vec![], None);
//!         Ok(())
//!     }
//! }
//!
//! let registry = Registry::new().with_input("uptime", |_options| Ok(Box::new(Uptime)));
//! assert!(registry.has_input("uptime"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::config::PluginOptions;
use crate::{Aggregator, BoxError, Input, Output, PluginError, PluginKind, Processor};

/// Creates an input from its options.
pub type InputFactory =
    Box<dyn Fn(&PluginOptions) -> Result<Box<dyn Input>, BoxError> + Send + Sync>;

/// Creates an output from its options.
pub type OutputFactory =
    Box<dyn Fn(&PluginOptions) -> Result<Box<dyn Output>, BoxError> + Send + Sync>;

/// Creates a processor from its options.
pub type ProcessorFactory =
    Box<dyn Fn(&PluginOptions) -> Result<Box<dyn Processor>, BoxError> + Send + Sync>;

/// Creates an aggregator from its options.
pub type AggregatorFactory =
    Box<dyn Fn(&PluginOptions) -> Result<Box<dyn Aggregator>, BoxError> + Send + Sync>;

/// Plugin factories keyed by plugin name.
#[derive(Default)]
pub struct Registry {
    inputs: BTreeMap<String, InputFactory>,
    outputs: BTreeMap<String, OutputFactory>,
    processors: BTreeMap<String, ProcessorFactory>,
    aggregators: BTreeMap<String, AggregatorFactory>,
}

/// Inserts a factory, warning if it replaces an existing one.
fn insert<F>(kind: PluginKind, map: &mut BTreeMap<String, F>, name: &str, factory: F) {
    if map.insert(name.to_owned(), factory).is_some() {
        telly_log::warn!("replacing factory for {kind} '{name}'");
    }
}

/// Looks up a factory and calls it with the options.
fn create<F, P>(
    kind: PluginKind,
    map: &BTreeMap<String, F>,
    name: &str,
    options: &PluginOptions,
) -> Result<P, PluginError>
where
    F: Fn(&PluginOptions) -> Result<P, BoxError>,
{
    let factory = map.get(name).ok_or_else(|| PluginError::UnknownPlugin {
        kind,
        name: name.to_owned(),
    })?;

    factory(options).map_err(|source| PluginError::Init {
        kind,
        plugin: name.to_owned(),
        source,
    })
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an input factory.
    pub fn register_input<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Input>, BoxError> + Send + Sync + 'static,
    {
        let factory: InputFactory = Box::new(factory);
        insert(PluginKind::Input, &mut self.inputs, name, factory);
    }

    /// Registers an output factory.
    pub fn register_output<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Output>, BoxError> + Send + Sync + 'static,
    {
        let factory: OutputFactory = Box::new(factory);
        insert(PluginKind::Output, &mut self.outputs, name, factory);
    }

    /// Registers a processor factory.
    pub fn register_processor<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Processor>, BoxError> + Send + Sync + 'static,
    {
        let factory: ProcessorFactory = Box::new(factory);
        insert(PluginKind::Processor, &mut self.processors, name, factory);
    }

    /// Registers an aggregator factory.
    pub fn register_aggregator<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Aggregator>, BoxError> + Send + Sync + 'static,
    {
        let factory: AggregatorFactory = Box::new(factory);
        insert(PluginKind::Aggregator, &mut self.aggregators, name, factory);
    }

    /// Registers an input factory, builder style.
    pub fn with_input<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Input>, BoxError> + Send + Sync + 'static,
    {
        self.register_input(name, factory);
        self
    }

    /// Registers an output factory, builder style.
    pub fn with_output<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Output>, BoxError> + Send + Sync + 'static,
    {
        self.register_output(name, factory);
        self
    }

    /// Registers a processor factory, builder style.
    pub fn with_processor<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Processor>, BoxError> + Send + Sync + 'static,
    {
        self.register_processor(name, factory);
        self
    }

    /// Registers an aggregator factory, builder style.
    pub fn with_aggregator<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn Aggregator>, BoxError> + Send + Sync + 'static,
    {
        self.register_aggregator(name, factory);
        self
    }

    /// Returns `true` if an input is registered under `name`.
    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    /// Returns `true` if an output is registered under `name`.
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    /// Creates the input registered under `name`.
    pub fn create_input(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Box<dyn Input>, PluginError> {
        create(PluginKind::Input, &self.inputs, name, options)
    }

    /// Creates the output registered under `name`.
    pub fn create_output(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Box<dyn Output>, PluginError> {
        create(PluginKind::Output, &self.outputs, name, options)
    }

    /// Creates the processor registered under `name`.
    pub fn create_processor(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Box<dyn Processor>, PluginError> {
        create(PluginKind::Processor, &self.processors, name, options)
    }

    /// Creates the aggregator registered under `name`.
    pub fn create_aggregator(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<Box<dyn Aggregator>, PluginError> {
        create(PluginKind::Aggregator, &self.aggregators, name, options)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("aggregators", &self.aggregators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutils::{MockInput, MockOutput};

    #[test]
    fn test_create_registered_plugin() {
        let registry = Registry::new()
            .with_input("mock", |_| Ok(Box::new(MockInput::default())))
            .with_output("mock", |_| Ok(Box::new(MockOutput::default())));

        assert!(registry.create_input("mock", &PluginOptions::new()).is_ok());
        assert!(registry.create_output("mock", &PluginOptions::new()).is_ok());
        assert!(registry.has_input("mock"));
        assert!(!registry.has_output("other"));
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = Registry::new();
        let Err(err) = registry.create_processor("rename", &PluginOptions::new()) else {
            panic!("expected an error");
        };

        assert!(matches!(
            err,
            PluginError::UnknownPlugin {
                kind: PluginKind::Processor,
                ..
            }
        ));
        assert_eq!(err.to_string(), "undefined but requested processor 'rename'");
    }

    #[test]
    fn test_factory_error_annotated() {
        let registry = Registry::new().with_input("mock", |options| {
            match options.get("fail") {
                Some(_) => Err("bad options".into()),
                None => Ok(Box::new(MockInput::default())),
            }
        });

        let mut options = PluginOptions::new();
        options.insert("fail".to_owned(), true.into());

        let Err(err) = registry.create_input("mock", &options) else {
            panic!("expected an error");
        };
        assert_eq!(err.plugin(), "mock");
        assert!(matches!(err, PluginError::Init { .. }));
    }
}
