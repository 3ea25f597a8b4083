//! Circuit breaking: a three-state machine per rule driven by completion
//! statistics over private leap arrays.

pub mod breaker;
pub mod manager;
pub mod rule;
pub mod slot;
pub mod strategies;

pub use breaker::{
    clear_state_change_listeners, register_state_change_listeners, CircuitBreaker, State,
    StateChangeListener,
};
pub use manager::{clear_rules, get_rules, load_rules};
pub use rule::{BreakerStrategy, CircuitBreakerRule};
