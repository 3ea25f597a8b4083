//! Structured refusals returned by the admission gate.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Which rule family refused the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Unknown,
    Flow,
    Isolation,
    HotSpotParamFlow,
    CircuitBreaking,
    SystemFlow,
    /// Reserved for user-defined slots.
    Custom(u32),
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Flow => write!(f, "Flow"),
            Self::Isolation => write!(f, "Isolation"),
            Self::HotSpotParamFlow => write!(f, "HotSpotParamFlow"),
            Self::CircuitBreaking => write!(f, "CircuitBreaking"),
            Self::SystemFlow => write!(f, "SystemFlow"),
            Self::Custom(code) => write!(f, "Custom({})", code),
        }
    }
}

/// Rule attached to a refusal, independent of the rule family.
pub trait TriggeredRule: fmt::Debug + fmt::Display + Send + Sync {
    fn resource_name(&self) -> &str;
}

/// A refusal: not an error in the operational sense, but a structured
/// description of why the call was not admitted.
#[derive(Debug, Clone)]
pub struct BlockError {
    block_type: BlockType,
    block_msg: Cow<'static, str>,
    rule: Option<Arc<dyn TriggeredRule>>,
    snapshot_value: Option<f64>,
}

impl BlockError {
    pub fn new(block_type: BlockType) -> Self {
        Self { block_type, block_msg: Cow::Borrowed(""), rule: None, snapshot_value: None }
    }

    pub fn with_message(block_type: BlockType, msg: impl Into<Cow<'static, str>>) -> Self {
        Self { block_type, block_msg: msg.into(), rule: None, snapshot_value: None }
    }

    pub fn with_cause(
        block_type: BlockType,
        msg: impl Into<Cow<'static, str>>,
        rule: Arc<dyn TriggeredRule>,
        snapshot_value: Option<f64>,
    ) -> Self {
        Self { block_type, block_msg: msg.into(), rule: Some(rule), snapshot_value }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn block_msg(&self) -> &str {
        &self.block_msg
    }

    /// The rule whose check refused the call, if any.
    pub fn triggered_rule(&self) -> Option<&Arc<dyn TriggeredRule>> {
        self.rule.as_ref()
    }

    /// The observed value that tripped the rule, if any.
    pub fn triggered_value(&self) -> Option<f64> {
        self.snapshot_value
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.block_msg.is_empty() {
            write!(f, "blocked: {}", self.block_type)
        } else {
            write!(f, "blocked: {}, message: {}", self.block_type, self.block_msg)
        }
    }
}

impl std::error::Error for BlockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DummyRule;

    impl fmt::Display for DummyRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "dummy")
        }
    }

    impl TriggeredRule for DummyRule {
        fn resource_name(&self) -> &str {
            "orders"
        }
    }

    #[test]
    fn display_without_message() {
        let err = BlockError::new(BlockType::Flow);
        assert_eq!(format!("{}", err), "blocked: Flow");
    }

    #[test]
    fn display_with_message() {
        let err = BlockError::with_message(BlockType::CircuitBreaking, "circuit open");
        let text = format!("{}", err);
        assert!(text.contains("CircuitBreaking"));
        assert!(text.contains("circuit open"));
    }

    #[test]
    fn cause_carries_rule_and_snapshot() {
        let err = BlockError::with_cause(
            BlockType::Isolation,
            "concurrency exceeds threshold",
            Arc::new(DummyRule),
            Some(3.0),
        );
        assert_eq!(err.block_type(), BlockType::Isolation);
        assert_eq!(err.triggered_rule().unwrap().resource_name(), "orders");
        assert_eq!(err.triggered_value(), Some(3.0));
    }
}
