//! Worker-pool harvesting of subject chunks

mod common;

use common::{items_for, subjects, test_client, Feed};
use harvest_ingest::harvester::{ChunkHarvest, ChunkedHarvester, SubjectOutcome};
use harvest_ingest::{ApiClient, RateLimiter};
use harvest_ingest::pagination::Endpoint;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

const THRESHOLD: usize = 5;
const PAGE_SIZE: usize = 4;

/// Even-numbered subjects have 6 or more bets, odd ones have 2
fn feed_for(n: usize) -> Feed {
    (0..n).fold(Feed::by_subject("userId"), |feed, i| {
        let id = format!("u{i:02}");
        let count = if i % 2 == 0 { 6 + i } else { 2 };
        feed.with_subject(&id, items_for(&id, count))
    })
}

async fn serve(feed: Feed) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bets"))
        .respond_with(feed)
        .mount(&server)
        .await;
    server
}

fn ids(harvest: &ChunkHarvest) -> BTreeSet<String> {
    harvest.payloads.iter().filter_map(|p| p.cursor("id")).collect()
}

#[tokio::test]
async fn test_parallel_matches_sequential() {
    let server = serve(feed_for(12)).await;
    let client = test_client(&server, 3);
    let harvester = ChunkedHarvester::new(client, Endpoint::BETS, PAGE_SIZE, THRESHOLD);
    let chunk = subjects(12);

    let sequential = harvester.process(&chunk, 1).await.unwrap();
    let parallel = harvester.process(&chunk, 4).await.unwrap();

    assert_eq!(sequential.qualifying_count, 6);
    assert_eq!(parallel.qualifying_count, 6);
    assert_eq!(sequential.skipped, 6);
    assert_eq!(parallel.skipped, 6);
    assert_eq!(ids(&sequential), ids(&parallel));
    assert_eq!(parallel.payloads.len(), ids(&parallel).len());

    let expected: usize = (0..12).step_by(2).map(|i| 6 + i).sum();
    assert_eq!(parallel.payloads.len(), expected);

    // Merged in sub-chunk order
    assert_eq!(sequential.qualifying_labels, parallel.qualifying_labels);
}

#[tokio::test]
async fn test_more_workers_than_subjects() {
    let server = serve(feed_for(3)).await;
    let client = test_client(&server, 3);
    let harvester = ChunkedHarvester::new(client, Endpoint::BETS, PAGE_SIZE, THRESHOLD);

    let harvest = harvester.process(&subjects(3), 16).await.unwrap();
    assert_eq!(harvest.qualifying_count, 2);
    assert_eq!(harvest.skipped, 1);
    assert_eq!(harvest.failed, 0);
}

#[tokio::test]
async fn test_empty_chunk() {
    let server = serve(feed_for(0)).await;
    let client = test_client(&server, 3);
    let harvester = ChunkedHarvester::new(client, Endpoint::BETS, PAGE_SIZE, THRESHOLD);

    let harvest = harvester.process(&[], 4).await.unwrap();
    assert!(harvest.payloads.is_empty());
    assert_eq!(harvest.qualifying_count, 0);
}

#[tokio::test]
async fn test_broken_subject_is_isolated() {
    // u02 passes the gate but its full pull is rejected
    let feed = feed_for(8).broken_for("u02", PAGE_SIZE);
    let server = serve(feed).await;
    let client = test_client(&server, 3);
    let harvester = ChunkedHarvester::new(client, Endpoint::BETS, PAGE_SIZE, THRESHOLD);

    let harvest = harvester.process(&subjects(8), 4).await.unwrap();

    assert_eq!(harvest.failed, 1);
    assert_eq!(harvest.qualifying_count, 3);
    assert_eq!(harvest.skipped, 4);
    assert!(!harvest.qualifying_labels.contains(&"user02".to_string()));
    assert!(ids(&harvest).iter().all(|id| !id.starts_with("u02-")));
}

#[tokio::test]
async fn test_subject_outcomes() {
    let feed = feed_for(2).broken_for("u00", PAGE_SIZE);
    let server = serve(feed.with_subject("u05", Vec::new())).await;
    let client = test_client(&server, 3);
    let harvester = ChunkedHarvester::new(client, Endpoint::BETS, PAGE_SIZE, THRESHOLD);
    let all = subjects(6);

    assert!(matches!(
        harvester.harvest_subject(&all[0]).await,
        SubjectOutcome::Failed(_)
    ));
    assert!(matches!(
        harvester.harvest_subject(&all[1]).await,
        SubjectOutcome::Skipped
    ));
    // Unknown subject
    assert!(matches!(
        harvester.harvest_subject(&all[3]).await,
        SubjectOutcome::Skipped
    ));
    // Known subject with no history
    assert!(matches!(
        harvester.harvest_subject(&all[5]).await,
        SubjectOutcome::Skipped
    ));
}

#[tokio::test]
async fn test_cancelled_chunk_is_an_error() {
    let server = serve(feed_for(4)).await;
    let cancel = CancellationToken::new();
    let client = ApiClient::builder(server.uri())
        .rate_limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
        .cancellation(cancel.clone())
        .build()
        .unwrap();
    let harvester = ChunkedHarvester::new(client, Endpoint::BETS, PAGE_SIZE, THRESHOLD);

    cancel.cancel();
    let err = harvester.process(&subjects(4), 2).await.unwrap_err();
    assert!(err.is_cancelled());
}
