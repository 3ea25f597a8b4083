//! Isolation rule model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::TriggeredRule;
use crate::error::FloodgateError;

/// Metric the isolation check compares against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationMetricType {
    /// In-flight request count.
    #[default]
    Concurrency,
}

/// Caps the number of in-flight calls on a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IsolationRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub resource: String,
    pub metric_type: IsolationMetricType,
    pub threshold: u32,
}

impl IsolationRule {
    pub fn is_valid(&self) -> Result<(), FloodgateError> {
        if self.resource.is_empty() {
            return Err(FloodgateError::invalid_rule("empty resource in isolation rule"));
        }
        if self.threshold == 0 {
            return Err(FloodgateError::invalid_rule("zero threshold in isolation rule"));
        }
        Ok(())
    }
}

impl fmt::Display for IsolationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => {
                write!(f, "IsolationRule{{resource={}, threshold={}}}", self.resource, self.threshold)
            }
        }
    }
}

impl TriggeredRule for IsolationRule {
    fn resource_name(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_degenerate_rules() {
        let rule = IsolationRule { resource: "r".into(), threshold: 1, ..Default::default() };
        assert!(rule.is_valid().is_ok());
        assert!(IsolationRule::default().is_valid().is_err());
        let zero = IsolationRule { resource: "r".into(), threshold: 0, ..Default::default() };
        assert!(zero.is_valid().is_err());
    }
}
