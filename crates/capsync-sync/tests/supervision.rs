mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use capsync_core::{EndpointFamily, PipelineStage};
use capsync_storage::{EntityStore, MemoryStore};
use capsync_sync::{PhaseSelection, RetryPolicy, SyncConfig, SyncPipeline};
use serde_json::json;

use support::{
    directory_entry, fast_config, logo_url, metadata_entry, FlakyStore, ScriptedFeed,
};

fn only(directory: bool, metadata: bool, listings: bool) -> PhaseSelection {
    PhaseSelection {
        directory,
        metadata,
        listings,
    }
}

#[tokio::test]
async fn two_hundred_fifty_ids_take_three_metadata_requests() {
    let mut feed = ScriptedFeed {
        directory: (1..=250).map(directory_entry).collect(),
        ..ScriptedFeed::default()
    };
    for id in 1..=250 {
        feed.metadata.insert(id, metadata_entry(id, &[], &[]));
    }
    let feed = Arc::new(feed);
    let config = SyncConfig {
        batch_size: 100,
        phases: only(true, true, false),
        ..fast_config()
    };

    let summary = SyncPipeline::new(config, Arc::new(MemoryStore::new()), feed.clone())
        .unwrap()
        .run_once()
        .await
        .unwrap();

    assert_eq!(feed.metadata_request_sizes(), vec![100, 100, 50]);
    let mut requested: Vec<i64> = feed
        .metadata_requests
        .lock()
        .unwrap()
        .iter()
        .flatten()
        .copied()
        .collect();
    requested.sort_unstable();
    assert_eq!(requested, (1..=250).collect::<Vec<_>>());
    assert_eq!(summary.metadata.requests.succeeded, 3);
    assert_eq!(summary.metadata.records.succeeded, 250);
}

#[tokio::test]
async fn retry_exhaustion_abandons_one_record_and_spares_the_rest() {
    let mut feed = ScriptedFeed {
        directory: vec![directory_entry(1), directory_entry(2)],
        ..ScriptedFeed::default()
    };
    feed.metadata.insert(1, metadata_entry(1, &["pow"], &["ALGORITHM"]));
    feed.metadata.insert(2, metadata_entry(2, &["pos"], &["ALGORITHM"]));
    feed.assets.insert(logo_url(1), vec![1, 2, 3]);
    feed.failing_assets.insert(logo_url(2));
    let feed = Arc::new(feed);
    let store = Arc::new(MemoryStore::new());

    let summary = SyncPipeline::new(fast_config(), store.clone(), feed.clone())
        .unwrap()
        .run_once()
        .await
        .unwrap();

    assert_eq!(feed.asset_calls.load(Ordering::SeqCst), 1 + 3);
    assert_eq!(summary.metadata.records.succeeded, 1);
    assert_eq!(summary.metadata.records.abandoned, 1);
    assert_eq!(summary.metadata.records.retried, 1);

    let abandoned = &summary.abandoned[0];
    assert_eq!(abandoned.cap_id, Some(2));
    assert_eq!(abandoned.stage, Some(PipelineStage::AssetFetched));
    assert_eq!(abandoned.attempts, 3);
    assert!(abandoned.exhausted);
    assert_eq!(abandoned.error_kind, "transient_network");

    let healthy = store.coin(1).await.unwrap().unwrap();
    assert_eq!(healthy.metadata.unwrap().logo, Some(vec![1, 2, 3]));
    assert!(store.coin(2).await.unwrap().unwrap().metadata.is_none());
    assert!(store.linked_tags(2).await.is_empty());
}

#[tokio::test]
async fn write_contention_is_retried_at_the_same_stage() {
    let mut feed = ScriptedFeed {
        directory: vec![directory_entry(8)],
        ..ScriptedFeed::default()
    };
    feed.metadata.insert(8, metadata_entry(8, &["defi"], &["CATEGORY"]));
    let store = Arc::new(FlakyStore::failing(2));

    let summary = SyncPipeline::new(fast_config(), store.clone(), Arc::new(feed))
        .unwrap()
        .run_once()
        .await
        .unwrap();

    assert!(summary.abandoned.is_empty(), "{:?}", summary.abandoned);
    assert_eq!(summary.metadata.records.succeeded, 1);
    assert_eq!(summary.metadata.records.retried, 1);
    assert_eq!(store.failures.load(Ordering::SeqCst), 0);
    assert_eq!(store.inner.linked_tags(8).await.len(), 1);
}

#[tokio::test]
async fn failed_coercion_leaves_committed_fields_alone() {
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig {
        phases: only(true, true, false),
        ..fast_config()
    };

    let mut good = metadata_entry(9, &["defi"], &["CATEGORY"]);
    good["description"] = json!("v1");
    good["self_reported_market_cap"] = json!("1.5");
    let mut first = ScriptedFeed {
        directory: vec![directory_entry(9)],
        ..ScriptedFeed::default()
    };
    first.metadata.insert(9, good);
    SyncPipeline::new(config.clone(), store.clone(), Arc::new(first))
        .unwrap()
        .run_once()
        .await
        .unwrap();

    let mut bad = metadata_entry(9, &["defi", "new-tag"], &["CATEGORY", "CATEGORY"]);
    bad["description"] = json!("v2");
    bad["self_reported_market_cap"] = json!("n/a");
    let mut second = ScriptedFeed {
        directory: vec![directory_entry(9)],
        ..ScriptedFeed::default()
    };
    second.metadata.insert(9, bad);
    let summary = SyncPipeline::new(config, store.clone(), Arc::new(second))
        .unwrap()
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.metadata.records.abandoned, 1);
    assert_eq!(summary.abandoned[0].stage, Some(PipelineStage::MetadataUpserted));
    assert_eq!(summary.abandoned[0].error_kind, "field_coercion");
    assert_eq!(summary.abandoned[0].attempts, 1);

    let metadata = store.coin(9).await.unwrap().unwrap().metadata.unwrap();
    assert_eq!(metadata.description.as_deref(), Some("v1"));
    assert_eq!(metadata.self_reported_market_cap, Some(1.5));
    assert_eq!(summary.entities.tags, 1, "nothing from the rejected record is written");
}

#[tokio::test(start_paused = true)]
async fn requests_to_one_family_are_spaced_by_the_configured_delay() {
    let delay = Duration::from_millis(2100);
    let mut feed = ScriptedFeed {
        directory: (1..=5).map(directory_entry).collect(),
        ..ScriptedFeed::default()
    };
    for id in 1..=5 {
        feed.metadata.insert(id, metadata_entry(id, &[], &[]));
    }
    let feed = Arc::new(feed);
    let config = SyncConfig {
        page_size: 2,
        batch_size: 2,
        request_delay: delay,
        retry: RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        phases: only(true, true, false),
        ..fast_config()
    };

    let summary = SyncPipeline::new(config, Arc::new(MemoryStore::new()), feed.clone())
        .unwrap()
        .run_once()
        .await
        .unwrap();
    assert!(summary.abandoned.is_empty(), "{:?}", summary.abandoned);

    for family in [EndpointFamily::Directory, EndpointFamily::Metadata, EndpointFamily::Asset] {
        let mut sent = feed.requests_for(family);
        assert!(sent.len() >= 3, "{family}: {} requests", sent.len());
        sent.sort();
        for pair in sent.windows(2) {
            assert!(pair[1] - pair[0] >= delay, "{family} requests closer than {delay:?}");
        }
    }

    let directory = feed.requests_for(EndpointFamily::Directory);
    let metadata = feed.requests_for(EndpointFamily::Metadata);
    assert!(
        metadata[0] - directory[2] < delay,
        "a fresh family does not wait behind another family's slots"
    );
}
