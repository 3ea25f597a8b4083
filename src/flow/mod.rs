//! QPS flow shaping: calculators decide the live threshold, checkers
//! decide pass/block/wait against it.

pub mod calculator;
pub mod checker;
pub mod controller;
pub mod manager;
pub mod rule;
pub mod slot;

pub use controller::{StandaloneStat, TrafficShapingCalculator, TrafficShapingChecker, TrafficShapingController};
pub use manager::{clear_rules, get_rules, load_rules};
pub use rule::{CalculateStrategy, ControlBehavior, FlowRule, RelationStrategy};
