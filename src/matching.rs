use anyhow::Context as _;
use hyper::Uri;
use regex::Regex;

use crate::config::MatchRuleConfig;

/// Compiled form of the configured offline-deferral predicate.
///
/// The rule is evaluated against the absolute upstream target URL of every
/// request crossing the relay. `Suffix`, `Contains`, and `Regex` look at the
/// rendered URL string; `PathPrefix` looks at the path component only, so a
/// query string never affects it.
#[derive(Debug, Clone)]
pub enum MatchRule {
    Suffix(String),
    Contains(String),
    PathPrefix(String),
    Regex(Regex),
}

impl MatchRule {
    pub fn from_config(config: &MatchRuleConfig) -> anyhow::Result<Self> {
        Ok(match config {
            MatchRuleConfig::Suffix { value } => Self::Suffix(value.clone()),
            MatchRuleConfig::Contains { value } => Self::Contains(value.clone()),
            MatchRuleConfig::PathPrefix { value } => Self::PathPrefix(value.clone()),
            MatchRuleConfig::Regex { value } => Self::Regex(
                Regex::new(value)
                    .with_context(|| format!("compile offline rule regex `{value}`"))?,
            ),
        })
    }

    pub fn matches(&self, target: &Uri) -> bool {
        match self {
            Self::Suffix(suffix) => target.to_string().ends_with(suffix.as_str()),
            Self::Contains(fragment) => target.to_string().contains(fragment.as_str()),
            Self::PathPrefix(prefix) => target.path().starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(&target.to_string()),
        }
    }
}
