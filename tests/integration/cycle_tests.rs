use std::time::Duration;

use deal_watcher::{ChangeKind, CyclePhase, IdentityKey, WatchedField};

use super::*;

#[tokio::test]
async fn test_failed_category_does_not_abort_cycle() {
    let harness = create_harness(vec![test_site("Amazon Spain", &["Beauty", "Books", "Toys"])]);
    harness.scraper.set("Beauty", vec![raw("B1", Some("€10.00"))]);
    harness.scraper.set("Books", vec![raw("K1", Some("€7.00"))]);
    harness.scraper.set("Toys", vec![raw("T1", Some("€15.00"))]);
    harness.scraper.fail("Books");

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    let failed: Vec<_> = report.failed_units().map(|o| o.category.clone()).collect();
    assert_eq!(failed, vec!["Books"]);
    assert_eq!(report.new_total(), 2);
    assert_eq!(report.delivered, 2);

    let sent: Vec<_> = harness
        .notifier
        .sent()
        .into_iter()
        .map(|event| event.listing.key.item_id)
        .collect();
    assert_eq!(sent, vec!["B1", "T1"]);
    assert_eq!(harness.store.len().await, 2);

    // The failed category is picked up again once it recovers
    harness.scraper.recover("Books");
    let report = harness.orchestrator.run_cycle("Scheduled hourly sync").await.unwrap();
    assert_eq!(report.new_total(), 1);
    assert_eq!(report.unchanged, 2);
}

#[tokio::test]
async fn test_categories_accumulate_across_cycles() {
    let harness = create_harness(vec![test_site("Amazon Spain", &["Beauty", "Gaming"])]);
    harness.scraper.set("Beauty", vec![raw("X", Some("€10.00"))]);

    harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    // Next cycle the item only shows up under Gaming
    harness.scraper.set("Beauty", vec![]);
    harness.scraper.set("Gaming", vec![raw("X", Some("€10.00"))]);
    let report = harness.orchestrator.run_cycle("Scheduled hourly sync").await.unwrap();

    // Category growth alone is not a watched change
    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 1);

    let records = harness.store.snapshot().await;
    assert_eq!(records.len(), 1);
    let categories: Vec<_> = records[0].categories.iter().cloned().collect();
    assert_eq!(categories, vec!["Beauty", "Gaming"]);
    assert!(records[0].last_seen >= records[0].first_seen);
}

#[tokio::test]
async fn test_price_change_emits_update_with_diff() {
    let harness = create_harness(vec![test_site("Amazon Spain", &["Beauty"])]);
    harness.scraper.set("Beauty", vec![raw("X", Some("€10.00"))]);
    harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    harness.scraper.set("Beauty", vec![raw("X", Some("€8.00"))]);
    let report = harness.orchestrator.run_cycle("Scheduled hourly sync").await.unwrap();
    assert_eq!(report.updated, 1);

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 2);
    let update = &sent[1];
    assert_eq!(update.change.kind, ChangeKind::Updated);
    let change = &update.change.changed_fields[&WatchedField::CurrentPrice];
    assert_eq!(change.old.as_deref(), Some("€10.00"));
    assert_eq!(change.new.as_deref(), Some("€8.00"));
}

#[tokio::test]
async fn test_missing_price_keeps_stored_value() {
    let harness = create_harness(vec![test_site("Amazon Spain", &["Beauty"])]);
    harness.scraper.set("Beauty", vec![raw("X", Some("€10.00"))]);
    harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    harness.scraper.set("Beauty", vec![raw("X", None)]);
    let report = harness.orchestrator.run_cycle("Scheduled hourly sync").await.unwrap();

    assert_eq!(report.updated, 0);
    assert_eq!(harness.notifier.sent().len(), 1);
    let records = harness.store.snapshot().await;
    assert_eq!(records[0].fields.current_price.as_deref(), Some("€10.00"));
}

#[tokio::test]
async fn test_same_item_on_two_sites_is_two_identities() {
    let harness = create_harness(vec![
        test_site("Amazon Spain", &["Beauty"]),
        test_site("Amazon Outlet", &["Beauty"]),
    ]);
    harness.scraper.set("Beauty", vec![raw("X", Some("€10.00"))]);

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    assert_eq!(report.unique, 2);
    assert_eq!(report.new_by_site.get("Amazon Spain"), Some(&1));
    assert_eq!(report.new_by_site.get("Amazon Outlet"), Some(&1));

    let keys: Vec<IdentityKey> = harness.notifier.sent().into_iter().map(|e| e.listing.key).collect();
    assert!(keys.contains(&IdentityKey::new(MARKETPLACE, "Amazon Spain", "X")));
    assert!(keys.contains(&IdentityKey::new(MARKETPLACE, "Amazon Outlet", "X")));
}

#[tokio::test]
async fn test_overlapping_trigger_is_skipped() {
    let harness = create_harness(vec![test_site("Amazon Spain", &["Beauty"])]);
    harness.scraper.set("Beauty", vec![raw("X", Some("€10.00"))]);
    harness.scraper.slow_down(Duration::from_millis(300));

    let orchestrator = harness.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.run_cycle("Initial sync").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.orchestrator.phase().await, CyclePhase::Scraping);
    let second = harness.orchestrator.run_cycle("Scheduled hourly sync").await;
    assert!(second.is_none());

    let first = first.await.unwrap();
    assert!(first.is_some());
    assert_eq!(harness.orchestrator.skipped_cycles(), 1);
    assert_eq!(harness.orchestrator.completed_cycles(), 1);
    assert_eq!(harness.scraper.calls(), 1);
    assert_eq!(harness.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_scrape_timeout_is_unit_failure() {
    let mut settings = test_settings();
    settings.scrape_timeout = Duration::from_millis(20);
    let harness = create_harness_with(vec![test_site("Amazon Spain", &["Beauty", "Toys"])], settings);
    harness.scraper.set("Beauty", vec![raw("X", Some("€10.00"))]);
    harness.scraper.slow_down(Duration::from_millis(200));

    let report = harness.orchestrator.run_cycle("Initial sync").await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes.iter().all(|o| !o.succeeded()));
    assert!(report.outcomes[0].error.as_deref().unwrap().contains("timed out"));
    assert_eq!(report.unique, 0);
}
