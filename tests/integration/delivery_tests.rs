use std::time::Duration;

use super::*;

fn seeded_harness(items: &[&str]) -> TestHarness {
    let harness = create_harness(vec![test_site("Amazon Spain", &["Beauty"])]);
    harness
        .scraper
        .set("Beauty", items.iter().map(|item| raw(item, Some("€1.00"))).collect());
    harness
}

#[tokio::test]
async fn test_rate_limited_delivery_is_retried_once() {
    let harness = seeded_harness(&["A"]);
    harness.notifier.rate_limit_next(1);

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    assert_eq!(harness.notifier.attempts(), 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 0);
}

#[tokio::test]
async fn test_second_rate_limit_drops_only_that_notification() {
    let harness = seeded_harness(&["A", "B"]);
    harness.notifier.rate_limit_next(2);

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    // Two attempts for A, then B goes through
    assert_eq!(harness.notifier.attempts(), 3);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.delivered, 1);
    let sent: Vec<_> = harness.notifier.sent().into_iter().map(|e| e.listing.key.item_id).collect();
    assert_eq!(sent, vec!["B"]);

    // The record is persisted even though its notification was dropped
    assert_eq!(harness.store.len().await, 2);
}

#[tokio::test]
async fn test_other_delivery_failures_are_not_retried() {
    let harness = seeded_harness(&["A", "B"]);
    harness.notifier.break_delivery();

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    assert_eq!(harness.notifier.attempts(), 2);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.new_total(), 2);
}

#[tokio::test]
async fn test_stalled_notification_is_dropped_and_cycle_continues() {
    let mut settings = test_settings();
    settings.notify_timeout = Duration::from_millis(50);
    let harness = create_harness_with(vec![test_site("Amazon Spain", &["Beauty"])], settings);
    harness
        .scraper
        .set("Beauty", vec![raw("A", Some("€1.00")), raw("SLOW", Some("€2.00")), raw("C", Some("€3.00"))]);
    harness.notifier.stall_on("SLOW");

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    // A timeout is not a rate limit, so there is no second attempt
    assert_eq!(harness.notifier.attempts(), 3);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.delivered, 2);
    let sent: Vec<_> = harness.notifier.sent().into_iter().map(|e| e.listing.key.item_id).collect();
    assert_eq!(sent, vec!["A", "C"]);
    assert_eq!(harness.store.len().await, 3);
}
