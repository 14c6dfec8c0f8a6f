use std::collections::BTreeMap;

use telly_metric::{Metric, Tag};

use crate::{FilterConfig, PatternSet};

/// An error raised when a filter rule list does not compile.
#[derive(Debug, thiserror::Error)]
#[error("error compiling '{rule}': invalid pattern '{pattern}'")]
pub struct FilterError {
    rule: &'static str,
    pattern: String,
    #[source]
    source: globset::Error,
}

impl FilterError {
    /// Returns the name of the rule list that failed, such as `namepass`.
    pub fn rule(&self) -> &'static str {
        self.rule
    }

    /// Returns the offending pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

fn compile_list(rule: &'static str, patterns: &[String]) -> Result<Option<PatternSet>, FilterError> {
    if patterns.is_empty() {
        return Ok(None);
    }

    PatternSet::compile(patterns)
        .map(Some)
        .map_err(|(pattern, source)| FilterError {
            rule,
            pattern,
            source,
        })
}

#[derive(Clone, Debug)]
struct TagRule {
    key: String,
    values: PatternSet,
}

fn compile_tag_rules(
    rule: &'static str,
    rules: &BTreeMap<String, Vec<String>>,
) -> Result<Option<Vec<TagRule>>, FilterError> {
    if rules.is_empty() {
        return Ok(None);
    }

    let mut compiled = Vec::with_capacity(rules.len());
    for (key, values) in rules {
        if let Some(values) = compile_list(rule, values)? {
            compiled.push(TagRule {
                key: key.clone(),
                values,
            });
        }
    }

    Ok(Some(compiled))
}

/// Returns `true` if any tag rule matches one of the metric's tags.
fn any_tag_matches(rules: &[TagRule], tags: &[Tag]) -> bool {
    rules.iter().any(|rule| {
        tags.iter()
            .any(|tag| tag.key == rule.key && rule.values.is_match(&tag.value))
    })
}

/// Combines an optional pass and drop decision.
///
/// With both present, the value must pass and must not be dropped.
fn pass_and_not_drop(pass: Option<bool>, drop: Option<bool>) -> bool {
    pass.unwrap_or(true) && !drop.unwrap_or(false)
}

/// A compiled metric filter.
///
/// The default filter is inert: it selects every metric and leaves it untouched.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    active: bool,
    name_pass: Option<PatternSet>,
    name_drop: Option<PatternSet>,
    field_pass: Option<PatternSet>,
    field_drop: Option<PatternSet>,
    tag_pass: Option<Vec<TagRule>>,
    tag_drop: Option<Vec<TagRule>>,
    tag_include: Option<PatternSet>,
    tag_exclude: Option<PatternSet>,
}

impl Filter {
    /// Compiles all rule lists of the configuration.
    pub fn compile(config: &FilterConfig) -> Result<Self, FilterError> {
        if config.is_empty() {
            return Ok(Self::default());
        }

        Ok(Self {
            active: true,
            name_pass: compile_list("namepass", &config.namepass)?,
            name_drop: compile_list("namedrop", &config.namedrop)?,
            field_pass: compile_list("fieldpass", &config.fieldpass)?,
            field_drop: compile_list("fielddrop", &config.fielddrop)?,
            tag_pass: compile_tag_rules("tagpass", &config.tagpass)?,
            tag_drop: compile_tag_rules("tagdrop", &config.tagdrop)?,
            tag_include: compile_list("taginclude", &config.taginclude)?,
            tag_exclude: compile_list("tagexclude", &config.tagexclude)?,
        })
    }

    /// Returns `true` if any rule is configured.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns `true` if the metric passes the name and tag pass/drop rules.
    pub fn select(&self, metric: &Metric) -> bool {
        if !self.active {
            return true;
        }

        self.should_name_pass(metric.name()) && self.should_tags_pass(metric.tags())
    }

    /// Removes fields failing the field rules and tags failing the tag key rules.
    ///
    /// The metric may end up without fields, in which case the caller must drop it.
    pub fn modify(&self, metric: &mut Metric) {
        if !self.active {
            return;
        }

        if self.field_pass.is_some() || self.field_drop.is_some() {
            metric.retain_fields(|field| self.should_field_pass(&field.key));
        }

        if self.tag_include.is_some() || self.tag_exclude.is_some() {
            metric.retain_tags(|tag| self.should_tag_key_pass(&tag.key));
        }
    }

    /// Returns `true` if the metric name passes the name rules.
    pub fn should_name_pass(&self, name: &str) -> bool {
        pass_and_not_drop(
            self.name_pass.as_ref().map(|p| p.is_match(name)),
            self.name_drop.as_ref().map(|p| p.is_match(name)),
        )
    }

    /// Returns `true` if the field key passes the field rules.
    pub fn should_field_pass(&self, key: &str) -> bool {
        pass_and_not_drop(
            self.field_pass.as_ref().map(|p| p.is_match(key)),
            self.field_drop.as_ref().map(|p| p.is_match(key)),
        )
    }

    /// Returns `true` if the tag set passes the tag pass/drop rules.
    pub fn should_tags_pass(&self, tags: &[Tag]) -> bool {
        pass_and_not_drop(
            self.tag_pass.as_deref().map(|r| any_tag_matches(r, tags)),
            self.tag_drop.as_deref().map(|r| any_tag_matches(r, tags)),
        )
    }

    fn should_tag_key_pass(&self, key: &str) -> bool {
        pass_and_not_drop(
            self.tag_include.as_ref().map(|p| p.is_match(key)),
            self.tag_exclude.as_ref().map(|p| p.is_match(key)),
        )
    }
}
