use super::*;
use flash_sale_watcher::models::{Fingerprint, OTHER_CATEGORY};
use flash_sale_watcher::PipelineOutcome;
use rust_decimal::Decimal;

const WINDOW: &str = "06/18 10:00 ~ 06/18 12:00";

fn fingerprint(brand: &str, name: &str) -> Fingerprint {
    Fingerprint::from_stored(format!("2024-06-18 10:00:00|2024-06-18 12:00:00|{brand}|{name}"))
}

fn two_offers() -> String {
    listing(&[(
        WINDOW,
        vec![Offer::new("101", "Acme", "Widget"), Offer::new("102", "Globex", "Gadget")],
    )])
}

fn report(outcome: PipelineOutcome) -> flash_sale_watcher::PipelineReport {
    match outcome {
        PipelineOutcome::Completed { report, .. } => report,
        PipelineOutcome::Failed { attempts, last_error } => {
            panic!("run failed after {attempts} attempts: {last_error}")
        }
    }
}

#[tokio::test]
async fn test_first_run_inserts_offers_with_categories() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(two_offers());
    h.browser.set_detail("101", DetailScript::Categories(vec!["3C", "手機"]));
    h.browser.set_detail("102", DetailScript::Categories(vec![]));

    let outcome = h.pipeline.run().await;
    assert!(matches!(outcome, PipelineOutcome::Completed { attempts: 1, .. }));

    let report = report(outcome);
    assert_eq!(report.extracted, 2);
    assert_eq!(report.new_records, 2);
    assert_eq!(report.known_records, 0);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.backlog, 0);
    assert_eq!(report.detail_failures, 0);

    let widget = h.store.find_by_fingerprint(&fingerprint("Acme", "Widget")).await?.unwrap();
    assert_eq!(widget.record.external_id(), "101");
    assert_eq!(widget.record.categories, Some(vec!["3C".to_string(), "手機".to_string()]));
    assert_eq!(widget.record.price, Some(Decimal::new(1000, 0)));
    assert_eq!(widget.record.image_url.as_deref(), Some("https://img.shop.test/101.jpg"));
    assert_eq!(widget.original_count, Some(50));

    let gadget = h.store.find_by_fingerprint(&fingerprint("Globex", "Gadget")).await?.unwrap();
    assert_eq!(gadget.record.categories, Some(vec![OTHER_CATEGORY.to_string()]));

    // One listing session plus one per detail page, all released
    assert_eq!(h.browser.sessions_opened(), 3);
    assert_eq!(h.browser.sessions_closed(), 3);
    Ok(())
}

#[tokio::test]
async fn test_repeat_runs_update_known_offers() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(two_offers());
    h.browser.set_detail("101", DetailScript::Categories(vec!["3C"]));
    h.browser.set_detail("102", DetailScript::Categories(vec!["家電"]));
    report(h.pipeline.run().await);

    h.browser.set_listing(listing(&[(
        WINDOW,
        vec![
            Offer::new("101", "Acme", "Widget").priced("$899", "12"),
            Offer::new("102", "Globex", "Gadget").priced("$1,500", "3"),
        ],
    )]));

    let second = report(h.pipeline.run().await);
    assert_eq!(second.new_records, 0);
    assert_eq!(second.known_records, 2);
    assert_eq!(second.updated, 2);
    assert_eq!(second.inserted, 0);

    let widget = h.store.find_by_fingerprint(&fingerprint("Acme", "Widget")).await?.unwrap();
    assert_eq!(widget.record.price, Some(Decimal::new(899, 0)));
    assert_eq!(widget.record.countdown, Some(12));
    assert_eq!(widget.original_count, Some(50));
    assert_eq!(widget.record.categories, Some(vec!["3C".to_string()]));

    let third = report(h.pipeline.run().await);
    assert_eq!(third, second);
    assert_eq!(row_count(&h.store).await?, 2);

    // Known offers never revisit their detail page
    assert_eq!(h.browser.detail_visits().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_detail_is_stored_then_backfilled() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(two_offers());
    h.browser.set_detail("101", DetailScript::Categories(vec!["3C"]));
    h.browser.set_detail("102", DetailScript::Broken);

    let first = report(h.pipeline.run().await);
    assert_eq!(first.inserted, 2);
    assert_eq!(first.backlog, 1);
    assert_eq!(first.backlog_categorized, 0);
    // Once as a new offer, once more from the backlog
    assert_eq!(first.detail_failures, 2);

    let gadget = h.store.find_by_fingerprint(&fingerprint("Globex", "Gadget")).await?.unwrap();
    assert_eq!(gadget.record.categories, Some(Vec::new()));
    assert!(gadget.record.needs_categories());

    h.browser.set_detail("102", DetailScript::Categories(vec!["美妝"]));
    let second = report(h.pipeline.run().await);
    assert_eq!(second.known_records, 2);
    assert_eq!(second.backlog, 1);
    assert_eq!(second.backlog_categorized, 1);
    assert_eq!(second.detail_failures, 0);

    let gadget = h.store.find_by_fingerprint(&fingerprint("Globex", "Gadget")).await?.unwrap();
    assert_eq!(gadget.record.categories, Some(vec!["美妝".to_string()]));

    let visits = h.browser.detail_visits();
    assert_eq!(visits.iter().filter(|id| id.as_str() == "102").count(), 3);
    assert_eq!(visits.iter().filter(|id| id.as_str() == "101").count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_offers_in_one_listing_are_stored_once() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(listing(&[(
        WINDOW,
        vec![Offer::new("201", "Acme", "Widget"), Offer::new("202", "Acme", "Widget")],
    )]));
    h.browser.set_detail("201", DetailScript::Categories(vec!["3C"]));
    h.browser.set_detail("202", DetailScript::Categories(vec!["3C"]));

    let report = report(h.pipeline.run().await);
    assert_eq!(report.new_records, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(row_count(&h.store).await?, 1);

    let stored = h.store.find_by_fingerprint(&fingerprint("Acme", "Widget")).await?.unwrap();
    assert_eq!(stored.record.external_id(), "201");
    Ok(())
}

#[tokio::test]
async fn test_missing_brand_leaves_empty_fingerprint_segment() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(listing(&[(WINDOW, vec![Offer::new("301", " ", "Widget")])]));
    h.browser.set_detail("301", DetailScript::Categories(vec!["3C"]));

    report(h.pipeline.run().await);

    let stored = h.store.find_by_fingerprint(&fingerprint("", "Widget")).await?.unwrap();
    assert_eq!(stored.record.brand(), None);
    assert_eq!(stored.record.product_name(), Some("Widget"));
    Ok(())
}

#[tokio::test]
async fn test_launch_failure_is_retried() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(two_offers());
    h.browser.set_detail("101", DetailScript::Categories(vec!["3C"]));
    h.browser.set_detail("102", DetailScript::Categories(vec!["3C"]));
    h.browser.fail_next_launches(1);

    let outcome = h.pipeline.run().await;
    assert!(matches!(outcome, PipelineOutcome::Completed { attempts: 2, .. }));
    assert_eq!(row_count(&h.store).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_listing_failure_restarts_run_and_releases_sessions() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(two_offers());
    h.browser.set_detail("101", DetailScript::Categories(vec!["3C"]));
    h.browser.set_detail("102", DetailScript::Categories(vec!["3C"]));
    h.browser.fail_next_listings(2);

    let outcome = h.pipeline.run().await;
    assert!(matches!(outcome, PipelineOutcome::Completed { attempts: 3, .. }));

    // Three listing sessions, two detail sessions
    assert_eq!(h.browser.sessions_opened(), 5);
    assert_eq!(h.browser.sessions_closed(), 5);
    assert_eq!(row_count(&h.store).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_attempts_end_in_failure() -> anyhow::Result<()> {
    let h = harness().await?;
    h.browser.set_listing(two_offers());
    h.browser.fail_next_listings(10);

    match h.pipeline.run().await {
        PipelineOutcome::Failed { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("ERR_TIMED_OUT"), "{last_error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(h.browser.sessions_opened(), 3);
    assert_eq!(h.browser.sessions_closed(), 3);
    assert_eq!(row_count(&h.store).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_single_attempt_configuration() -> anyhow::Result<()> {
    let mut config = test_config();
    config.pipeline.max_attempts = 1;
    let h = harness_with(config).await?;
    h.browser.fail_next_launches(1);

    let outcome = h.pipeline.run().await;
    assert!(matches!(outcome, PipelineOutcome::Failed { attempts: 1, .. }));
    Ok(())
}

#[tokio::test]
async fn test_zero_concurrency_is_refused_up_front() -> anyhow::Result<()> {
    let mut config = test_config();
    config.details.max_concurrent = 0;

    let result = harness_with(config).await;
    let error = result.err().expect("pipeline must not be built without detail permits");
    assert!(error.to_string().contains("max_concurrent"), "{error}");
    Ok(())
}
