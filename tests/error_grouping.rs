use adaptive_crawler::config::ErrorSettings;
use adaptive_crawler::diagnostics::{enable_error_backtraces, ErrorRecord, ErrorTracker};

fn fail_while_fetching() -> anyhow::Error {
    anyhow::anyhow!("connection reset")
}

fn fail_while_parsing() -> anyhow::Error {
    anyhow::anyhow!("connection reset")
}

#[tokio::test]
async fn same_message_from_different_places_forms_separate_groups() {
    enable_error_backtraces();
    let tracker = ErrorTracker::new(ErrorSettings::default(), None);

    let fetching = ErrorRecord::from_error(&fail_while_fetching());
    let parsing = ErrorRecord::from_error(&fail_while_parsing());

    let fetch_location = fetching.location.clone().expect("fetch error has a location");
    let parse_location = parsing.location.clone().expect("parse error has a location");
    assert!(fetch_location.contains("error_grouping.rs"), "{}", fetch_location);
    assert!(parse_location.contains("error_grouping.rs"), "{}", parse_location);
    assert_ne!(fetch_location, parse_location);

    tracker.add(&fetching).await;
    tracker.add(&parsing).await;
    tracker.add_error(&fail_while_fetching()).await;

    assert_eq!(tracker.group_count().await, 2);
    assert_eq!(tracker.total().await, 3);
}
