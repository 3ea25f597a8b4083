//! Concurrency isolation through the public gate.

use std::sync::Mutex;

use floodgate::isolation::{self, IsolationRule};
use floodgate::BlockType;

static RULES: Mutex<()> = Mutex::new(());

#[tokio::test]
async fn third_in_flight_call_is_refused() {
    let _guard = RULES.lock().unwrap();
    isolation::load_rules(vec![IsolationRule {
        resource: "iso_cap_res".into(),
        threshold: 2,
        ..Default::default()
    }])
    .unwrap();

    let first = floodgate::entry("iso_cap_res").await.expect("slot 1 free");
    let second = floodgate::entry("iso_cap_res").await.expect("slot 2 free");

    let refusal = floodgate::entry("iso_cap_res").await.expect_err("cap reached");
    assert_eq!(refusal.block_type(), BlockType::Isolation);
    assert_eq!(refusal.triggered_value(), Some(2.0));

    // Completing one call frees a slot.
    drop(first);
    let mut third = floodgate::entry("iso_cap_res").await.expect("slot freed");
    third.exit();
    drop(second);

    isolation::clear_rules();
}

#[tokio::test]
async fn batch_count_consumes_multiple_slots() {
    let _guard = RULES.lock().unwrap();
    isolation::load_rules(vec![IsolationRule {
        resource: "iso_batch_res".into(),
        threshold: 3,
        ..Default::default()
    }])
    .unwrap();

    let held = floodgate::entry("iso_batch_res").await.expect("one slot taken");
    // One call in flight: a batch of 3 would land at 4 > 3.
    let opts = floodgate::EntryOptions::new().with_batch_count(3);
    let refusal =
        floodgate::entry_with_opts("iso_batch_res", opts).await.expect_err("batch overflows cap");
    assert_eq!(refusal.block_type(), BlockType::Isolation);
    drop(held);

    isolation::clear_rules();
}
