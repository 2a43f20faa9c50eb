//! Capability routing — per-task tool preferences from configured rules.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use taskgate_core::config::RoutingRuleConfig;
use taskgate_core::error::{Result, TaskGateError};

use crate::SuppressionReason;

/// A rule compiled once at pipeline construction.
#[derive(Debug)]
pub struct RoutingRule {
    pattern: Regex,
    preferred: HashSet<String>,
    avoided: HashSet<String>,
    require_preferred: bool,
}

impl RoutingRule {
    pub fn compile(config: &RoutingRuleConfig) -> Result<Self> {
        let pattern = RegexBuilder::new(&config.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| TaskGateError::InvalidPattern {
                pattern: config.pattern.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            pattern,
            preferred: config.preferred.iter().cloned().collect(),
            avoided: config.avoided.iter().cloned().collect(),
            require_preferred: config.require_preferred,
        })
    }

    pub fn matches(&self, description: &str) -> bool {
        self.pattern.is_match(description)
    }

    /// Why `tool` is dropped under this rule, if it is.
    pub fn rejects(&self, tool: &str) -> Option<SuppressionReason> {
        if self.avoided.contains(tool) {
            Some(SuppressionReason::RoutingAvoided)
        } else if self.require_preferred && !self.preferred.contains(tool) {
            Some(SuppressionReason::RoutingNotPreferred)
        } else {
            None
        }
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

#[derive(Debug, Default)]
pub struct Router {
    rules: Vec<RoutingRule>,
}

impl Router {
    pub fn compile(configs: &[RoutingRuleConfig]) -> Result<Self> {
        let rules = configs.iter().map(RoutingRule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Rules whose pattern matches the task description.
    pub fn matching<'a>(&'a self, description: &'a str) -> impl Iterator<Item = &'a RoutingRule> {
        self.rules.iter().filter(move |r| r.matches(description))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
