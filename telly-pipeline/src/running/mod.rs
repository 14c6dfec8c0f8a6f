//! Wrappers applying filters, renames, tags and statistics uniformly around plugins.

use std::collections::BTreeMap;

use telly_metric::Metric;

mod aggregator;
mod input;
mod output;
mod processor;

pub use self::aggregator::*;
pub use self::input::*;
pub use self::output::*;
pub use self::processor::*;

/// Renames a metric and adds plugin and default tags that are not yet present.
fn make_metric(
    metric: &mut Metric,
    name_override: &str,
    prefix: &str,
    suffix: &str,
    tags: &BTreeMap<String, String>,
    default_tags: &BTreeMap<String, String>,
) {
    if !name_override.is_empty() {
        metric.set_name(name_override);
    }
    if !prefix.is_empty() {
        metric.add_prefix(prefix);
    }
    if !suffix.is_empty() {
        metric.add_suffix(suffix);
    }

    for (key, value) in tags.iter().chain(default_tags) {
        if !metric.has_tag(key) {
            metric.add_tag(key.as_str(), value.as_str());
        }
    }
}
