use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Filter, FilterError};

/// Raw rule lists of a metric filter as they appear in plugin configuration.
///
/// All lists contain glob patterns. Tag pass and drop rules map a tag key to the patterns matched
/// against its value.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Metric names to keep.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub namepass: Vec<String>,
    /// Metric names to drop.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub namedrop: Vec<String>,
    /// Field keys to keep.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fieldpass: Vec<String>,
    /// Field keys to remove.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fielddrop: Vec<String>,
    /// Tag values, by tag key, a metric must match to be kept.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tagpass: BTreeMap<String, Vec<String>>,
    /// Tag values, by tag key, that cause a metric to be dropped.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tagdrop: BTreeMap<String, Vec<String>>,
    /// Tag keys to keep.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taginclude: Vec<String>,
    /// Tag keys to remove.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tagexclude: Vec<String>,
}

impl FilterConfig {
    /// Returns `true` if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.namepass.is_empty()
            && self.namedrop.is_empty()
            && self.fieldpass.is_empty()
            && self.fielddrop.is_empty()
            && self.tagpass.is_empty()
            && self.tagdrop.is_empty()
            && self.taginclude.is_empty()
            && self.tagexclude.is_empty()
    }

    /// Compiles the rule lists into a [`Filter`].
    ///
    /// An empty configuration compiles into an inert filter that selects every metric and never
    /// modifies it.
    pub fn compile(&self) -> Result<Filter, FilterError> {
        Filter::compile(self)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "namepass": ["cpu*"],
            "tagpass": {"cpu": ["cpu0", "cpu1"]}
        }"#;

        let config: FilterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.namepass, vec!["cpu*".to_owned()]);
        assert_eq!(
            config.tagpass.get("cpu"),
            Some(&vec!["cpu0".to_owned(), "cpu1".to_owned()])
        );
        assert!(config.namedrop.is_empty());
        assert!(!config.is_empty());
    }

    #[test]
    fn test_serialize_skips_empty() {
        let config = FilterConfig {
            fielddrop: vec!["usage_*".to_owned()],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"fielddrop":["usage_*"]}"#);
    }
}
