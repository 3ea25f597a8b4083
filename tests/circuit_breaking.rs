//! Circuit breaker lifecycle through the public gate: trip on error
//! ratio, block while open, probe after the retry timeout, close on
//! successful probes and reopen on a failing one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use floodgate::circuitbreaker::{
    self, BreakerStrategy, CircuitBreakerRule, State, StateChangeListener,
};
use floodgate::BlockType;

static RULES: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct TransitionRecorder {
    transitions: Mutex<Vec<(State, State)>>,
}

impl TransitionRecorder {
    fn seen(&self) -> Vec<(State, State)> {
        self.transitions.lock().unwrap().clone()
    }
}

impl StateChangeListener for TransitionRecorder {
    fn on_transform_to_closed(&self, prev: State, _rule: &CircuitBreakerRule) {
        self.transitions.lock().unwrap().push((prev, State::Closed));
    }
    fn on_transform_to_open(&self, prev: State, _rule: &CircuitBreakerRule, _snapshot: Option<f64>) {
        self.transitions.lock().unwrap().push((prev, State::Open));
    }
    fn on_transform_to_half_open(&self, prev: State, _rule: &CircuitBreakerRule) {
        self.transitions.lock().unwrap().push((prev, State::HalfOpen));
    }
}

fn biz_error() -> Arc<dyn std::error::Error + Send + Sync> {
    Arc::new(std::io::Error::other("downstream failed"))
}

async fn complete_one(resource: &str, errored: bool) {
    let mut e = floodgate::entry(resource).await.expect("breaker should admit this call");
    if errored {
        e.exit_with_error(biz_error());
    } else {
        e.exit();
    }
}

#[tokio::test]
async fn error_ratio_breaker_full_lifecycle() {
    let _guard = RULES.lock().unwrap();
    let resource = "cb_lifecycle_res";
    circuitbreaker::load_rules(vec![CircuitBreakerRule {
        resource: resource.into(),
        strategy: BreakerStrategy::ErrorRatio,
        retry_timeout_ms: 200,
        min_request_amount: 10,
        stat_interval_ms: 1000,
        threshold: 0.5,
        probe_num: 2,
        ..Default::default()
    }])
    .unwrap();
    let recorder = Arc::new(TransitionRecorder::default());
    circuitbreaker::register_state_change_listeners(vec![recorder.clone()]);

    // 10 completions, 6 errored: the 10th trips Closed -> Open.
    for i in 0..10 {
        complete_one(resource, i < 6).await;
    }
    assert_eq!(recorder.seen(), vec![(State::Closed, State::Open)]);

    // While open, every call is refused with CircuitBreaking.
    let refusal = floodgate::entry(resource).await.expect_err("open breaker must refuse");
    assert_eq!(refusal.block_type(), BlockType::CircuitBreaking);

    // After the retry timeout the first call probes through half-open.
    tokio::time::sleep(Duration::from_millis(250)).await;
    complete_one(resource, false).await;
    assert_eq!(
        recorder.seen(),
        vec![(State::Closed, State::Open), (State::Open, State::HalfOpen)]
    );

    // The second successful probe closes the breaker.
    complete_one(resource, false).await;
    assert_eq!(
        recorder.seen(),
        vec![
            (State::Closed, State::Open),
            (State::Open, State::HalfOpen),
            (State::HalfOpen, State::Closed)
        ]
    );

    // Normal traffic flows again.
    for _ in 0..5 {
        complete_one(resource, false).await;
    }

    circuitbreaker::clear_state_change_listeners();
    circuitbreaker::clear_rules();
}

#[tokio::test]
async fn failing_probe_reopens_the_breaker() {
    let _guard = RULES.lock().unwrap();
    let resource = "cb_reopen_res";
    circuitbreaker::load_rules(vec![CircuitBreakerRule {
        resource: resource.into(),
        strategy: BreakerStrategy::ErrorCount,
        retry_timeout_ms: 200,
        min_request_amount: 1,
        stat_interval_ms: 1000,
        threshold: 3.0,
        probe_num: 2,
        ..Default::default()
    }])
    .unwrap();

    for _ in 0..3 {
        complete_one(resource, true).await;
    }
    assert!(floodgate::entry(resource).await.is_err(), "three errors must open the breaker");

    tokio::time::sleep(Duration::from_millis(250)).await;
    // The probe fails, reopening the breaker and re-arming the timeout.
    complete_one(resource, true).await;
    let refusal = floodgate::entry(resource).await.expect_err("failed probe reopens");
    assert_eq!(refusal.block_type(), BlockType::CircuitBreaking);

    circuitbreaker::clear_rules();
}
