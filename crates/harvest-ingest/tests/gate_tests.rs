mod common;

use common::{items_for, test_client, Feed};
use harvest_common::types::Subject;
use harvest_ingest::gate::quick_check;
use harvest_ingest::pagination::Endpoint;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_threshold_boundaries() {
    for threshold in [0usize, 1, 50] {
        let counts = [
            threshold.saturating_sub(1),
            threshold,
            threshold + 1,
            threshold + 20,
        ];

        for count in counts {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/bets"))
                .respond_with(Feed::by_subject("userId").with_subject("u1", items_for("u1", count)))
                .expect(1)
                .mount(&server)
                .await;

            let client = test_client(&server, 3);
            let passed = quick_check(&client, Endpoint::BETS, &Subject::new("u1", "alice"), threshold).await;

            assert_eq!(passed, count >= threshold, "threshold={threshold} count={count}");
        }
    }
}

#[tokio::test]
async fn test_gate_requests_threshold_plus_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bets"))
        .and(query_param("userId", "u1"))
        .and(query_param("limit", "51"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server, 3);
    assert!(!quick_check(&client, Endpoint::BETS, &Subject::new("u1", "alice"), 50).await);
}

#[tokio::test]
async fn test_unknown_subject_is_below_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bets"))
        .respond_with(Feed::by_subject("userId"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server, 3);
    assert!(!quick_check(&client, Endpoint::BETS, &Subject::new("ghost", "ghost"), 0).await);
}

#[tokio::test]
async fn test_exhausted_retries_are_below_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bets"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let client = test_client(&server, 2);
    assert!(!quick_check(&client, Endpoint::BETS, &Subject::new("u1", "alice"), 1).await);
}
