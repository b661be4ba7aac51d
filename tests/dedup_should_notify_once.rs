mod common;

use std::sync::Arc;

use common::{dispatcher, quick_dispatch, RecordingSink};
use zenwatch::application::usecases::{RunOnceUseCase, WatchService};
use zenwatch::domain::{Platform, UserId};
use zenwatch::infrastructure::{
    fake_source::FakeSource,
    memory_store::{InMemorySeenSet, InMemoryWatchStore},
};

#[tokio::test]
async fn should_notify_only_once_for_same_listing() {
    let store = Arc::new(InMemoryWatchStore::new(10));
    let seen = Arc::new(InMemorySeenSet::new());
    let source = FakeSource::new();
    let sink = RecordingSink::new();

    let service = WatchService::new(store.clone(), seen.clone());
    service
        .monitor(UserId(1), "yahoo", "figma hatsune miku", Some(10000.0))
        .await
        .unwrap();
    source.set_listings(
        Platform::Yahoo,
        "figma hatsune miku",
        vec![FakeSource::listing("1", 9000.0), FakeSource::listing("2", 12000.0)],
    );

    let dispatcher = dispatcher(&source, seen.clone(), &sink, quick_dispatch());
    let run_once = RunOnceUseCase {
        store: store.as_ref(),
        seen: seen.as_ref(),
        dispatcher: &dispatcher,
    };

    // first run: one notification, for the listing under the price bound
    let summary = run_once.execute().await.unwrap();
    assert_eq!(summary.notified, 1);
    // second run, same source output: nothing new
    let summary = run_once.execute().await.unwrap();
    assert_eq!(summary.notified, 0);

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("https://example.com/1"));
    assert_eq!(source.calls(), 2);
}
