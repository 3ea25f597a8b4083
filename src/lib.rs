#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! In-process traffic governance: gate calls to named resources and
//! decide *pass*, *block* or *wait-then-pass* from the rules attached to
//! each resource.
//!
//! ## Features
//!
//! - **Flow control** with constant, warm-up and memory-adaptive
//!   thresholds, rejecting or pacing excess traffic
//! - **Circuit breakers** (slow-request ratio, error ratio, error count)
//!   with half-open probing
//! - **Concurrency isolation** per resource
//! - **Hot-spot throttling** partitioned per argument value
//! - **Adaptive system protection** with a BBR-style admission estimate
//! - **Lock-free sliding-window statistics** shared across all of the
//!   above
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::flow::{load_rules, FlowRule};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     load_rules(vec![FlowRule {
//!         resource: "greeting".into(),
//!         threshold: 100.0,
//!         ..FlowRule::default()
//!     }])
//!     .expect("valid rule");
//!
//!     match floodgate::entry("greeting").await {
//!         Ok(mut entry) => {
//!             // protected work happens here
//!             entry.exit();
//!         }
//!         Err(blocked) => {
//!             eprintln!("refused: {}", blocked);
//!         }
//!     }
//! }
//! ```

pub mod api;
pub mod block;
pub mod chain;
pub mod circuitbreaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod flow;
pub mod hotspot;
pub mod isolation;
pub mod metrics;
pub mod resource;
pub mod sleeper;
pub mod stat;
pub mod system;
pub mod system_metric;
mod util;

// Re-exports
pub use api::{entry, entry_with_opts, trace_error, EntryOptions};
pub use block::{BlockError, BlockType, TriggeredRule};
pub use chain::{
    build_default_slot_chain, global_slot_chain, Decision, PrepareSlot, RuleCheckSlot, SlotChain,
    StatSlot,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{init_default, init_with_config, Config};
pub use context::{EntryContext, EntryInput, ParamValue};
pub use entry::Entry;
pub use error::FloodgateError;
pub use metrics::MetricItem;
pub use resource::{ResourceType, ResourceWrapper, TrafficType};
/// Sleep abstractions: `Sleeper` trait, `TokioSleeper` for production,
/// `InstantSleeper`/`TrackingSleeper` for tests.
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
