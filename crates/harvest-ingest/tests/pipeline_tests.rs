//! End-to-end stage runs against a mock API and the in-memory store

mod common;

use common::{comment, items_for, market, subjects, test_client, user, Feed, MemoryStore};
use harvest_ingest::config::{BetsStageConfig, TopUsersStageConfig, UsersStageConfig};
use harvest_ingest::normalize::bets::BETS_TABLE;
use harvest_ingest::normalize::comments::COMMENTS_TABLE;
use harvest_ingest::normalize::contracts::CONTRACTS_TABLE;
use harvest_ingest::normalize::users::USERS_TABLE;
use harvest_ingest::{Pipeline, Stages};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

const USERS: usize = 6;

fn users_config() -> UsersStageConfig {
    UsersStageConfig {
        page_size: 4,
        chunk_size: 4,
        limit: None,
        max_params_per_statement: 0,
    }
}

fn bets_config() -> BetsStageConfig {
    BetsStageConfig {
        page_size: 4,
        threshold: 5,
        worker_count: 2,
        user_chunk_size: 4,
        max_params_per_statement: 0,
    }
}

fn top_users(user_limit: usize, page_size: usize) -> TopUsersStageConfig {
    TopUsersStageConfig {
        user_limit,
        page_size,
        max_params_per_statement: 0,
    }
}

/// Six users; u00, u02 and u04 hold 6, 8 and 10 bets, the rest hold 2.
///
/// Markets: u04 created three (one more listed under it belongs to u99),
/// u02 one, u00 none. Comments: u04 wrote two, u00 one, and u02 is
/// unknown to the comments endpoint.
async fn mock_api() -> MockServer {
    let server = MockServer::start().await;

    let users = (0..USERS)
        .rev()
        .map(|i| user(&format!("u{i:02}"), &format!("user{i:02}")))
        .collect();
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(Feed::unfiltered(users))
        .mount(&server)
        .await;

    let bets = (0..USERS).fold(Feed::by_subject("userId"), |feed, i| {
        let id = format!("u{i:02}");
        let count = if i % 2 == 0 { 6 + i } else { 2 };
        feed.with_subject(&id, items_for(&id, count))
    });
    Mock::given(method("GET"))
        .and(path("/bets"))
        .respond_with(bets)
        .mount(&server)
        .await;

    let markets = Feed::by_subject("creatorId")
        .with_subject(
            "u04",
            vec![
                market("m04-2", "u04"),
                market("m99-0", "u99"),
                market("m04-1", "u04"),
                market("m04-0", "u04"),
            ],
        )
        .with_subject("u02", vec![market("m02-0", "u02")])
        .with_subject("u00", vec![]);
    Mock::given(method("GET"))
        .and(path("/markets"))
        .respond_with(markets)
        .mount(&server)
        .await;

    let comments = Feed::by_subject("userId")
        .with_subject("u04", vec![comment("c04-1", "u04"), comment("c04-0", "u04")])
        .with_subject("u00", vec![comment("c00-0", "u00")]);
    Mock::given(method("GET"))
        .and(path("/comments"))
        .respond_with(comments)
        .mount(&server)
        .await;

    server
}

fn store() -> MemoryStore {
    MemoryStore::new().with_subjects(subjects(USERS))
}

#[tokio::test]
async fn test_full_run() {
    let server = mock_api().await;
    let store = store();
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config());

    let reports = pipeline.run(Stages::All, None).await.unwrap();
    assert_eq!(reports.len(), 4);

    let users = &reports[0];
    assert_eq!(users.stage, "users");
    assert_eq!(users.payloads, USERS);
    assert_eq!(users.chunks, 2);
    assert_eq!(users.rows_upserted, USERS as u64);
    assert_eq!(store.rows(USERS_TABLE).len(), USERS);

    let bets = &reports[1];
    assert_eq!(bets.stage, "bets");
    assert_eq!(bets.chunks, 2);
    assert_eq!(bets.subjects_scanned, USERS);
    assert_eq!(bets.qualifying, 3);
    assert_eq!(bets.skipped, 3);
    assert_eq!(bets.failed, 0);
    assert_eq!(bets.payloads, 24);
    assert_eq!(bets.rows_upserted, 24);
    assert_eq!(bets.last_label.as_deref(), Some("user05"));
    assert_eq!(store.rows(BETS_TABLE).len(), 24);

    let contracts = &reports[2];
    assert_eq!(contracts.stage, "contracts");
    assert_eq!(contracts.subjects_scanned, 3);
    assert_eq!(contracts.qualifying, 2);
    assert_eq!(contracts.skipped, 1);
    assert_eq!(contracts.payloads, 4);
    assert_eq!(store.rows(CONTRACTS_TABLE).len(), 4);

    let comments = &reports[3];
    assert_eq!(comments.stage, "comments");
    assert_eq!(comments.subjects_scanned, 3);
    assert_eq!(comments.failed, 1);
    assert_eq!(comments.skipped, 0);
    assert_eq!(comments.payloads, 3);
    assert_eq!(store.rows(COMMENTS_TABLE).len(), 3);
}

#[tokio::test]
async fn test_contracts_follow_bet_ranking() {
    let server = mock_api().await;
    let store = store();
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config())
        .with_contracts(top_users(1, 2));

    pipeline.run_bets(None).await.unwrap();
    let reports = pipeline.run(Stages::ContractsOnly, None).await.unwrap();
    assert_eq!(reports.len(), 1);

    // Only u04, the heaviest bettor; its markets span two full pages
    let report = &reports[0];
    assert_eq!(report.subjects_scanned, 1);
    assert_eq!(report.payloads, 3);
    assert_eq!(report.last_label.as_deref(), Some("user04"));

    let rows = store.rows(CONTRACTS_TABLE);
    assert_eq!(rows.keys().collect::<Vec<_>>(), ["m04-0", "m04-1", "m04-2"]);
    assert!(!rows.contains_key("m99-0"));
}

#[tokio::test]
async fn test_comment_fetch_failure_stays_with_its_user() {
    let server = mock_api().await;
    let store = store();
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config())
        .with_comments(top_users(10, 1));

    pipeline.run_bets(None).await.unwrap();
    let report = pipeline.run_comments().await.unwrap();

    assert_eq!(report.subjects_scanned, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.qualifying, 2);
    assert_eq!(report.rows_upserted, 3);
    assert!(store.rows(COMMENTS_TABLE).keys().all(|id| !id.starts_with("c02")));
}

#[tokio::test]
async fn test_zero_user_limit_skips_stage() {
    let server = mock_api().await;
    let store = store();
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config())
        .with_comments(top_users(0, 10));

    pipeline.run_bets(None).await.unwrap();
    let before = server.received_requests().await.unwrap().len();

    let report = pipeline.run_comments().await.unwrap();
    assert_eq!(report.subjects_scanned, 0);
    assert!(store.rows(COMMENTS_TABLE).is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), before);
}

#[tokio::test]
async fn test_top_user_stage_without_bets_is_a_no_op() {
    let server = mock_api().await;
    let store = store();
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config());

    let report = pipeline.run_contracts().await.unwrap();
    assert_eq!(report.subjects_scanned, 0);
    assert_eq!(report.stage, "contracts");
    assert!(store.rows(CONTRACTS_TABLE).is_empty());
}

#[tokio::test]
async fn test_users_limit() {
    let server = mock_api().await;
    let store = store();
    let users = UsersStageConfig {
        limit: Some(5),
        ..users_config()
    };
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users, bets_config());

    let report = pipeline.run_users().await.unwrap();
    assert_eq!(report.payloads, 5);
    assert_eq!(store.rows(USERS_TABLE).len(), 5);
}

#[tokio::test]
async fn test_users_stage_honors_param_budget() {
    let server = mock_api().await;
    let store = store();
    // 39 columns per user row, so 100 parameters fit two rows per statement
    let users = UsersStageConfig {
        chunk_size: 6,
        max_params_per_statement: 100,
        ..users_config()
    };
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users, bets_config());

    let report = pipeline.run_users().await.unwrap();
    assert_eq!(report.rows_upserted, USERS as u64);
    assert_eq!(store.batch_sizes(), [2, 2, 2]);
}

#[tokio::test]
async fn test_bets_resume_from_username() {
    let server = mock_api().await;
    let store = store();
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config());

    let report = pipeline.run_bets(Some("user04")).await.unwrap();
    assert_eq!(report.subjects_scanned, 2);
    assert_eq!(report.qualifying, 1);
    assert_eq!(report.payloads, 10);

    let rows = store.rows(BETS_TABLE);
    assert!(rows.keys().all(|id| id.starts_with("u04-")));
}

#[tokio::test]
async fn test_bad_bet_is_dropped_not_fatal() {
    let server = mock_api().await;
    let store = store().poison(["u02-0003"]);
    let pipeline = Pipeline::new(test_client(&server, 3), store.clone(), users_config(), bets_config());

    let report = pipeline.run_bets(None).await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.rows_upserted, 23);
    assert!(!store.rows(BETS_TABLE).contains_key("u02-0003"));
}

#[tokio::test]
async fn test_cancelled_run_stops() {
    let server = mock_api().await;
    let store = store();
    let client = test_client(&server, 3);
    let cancel = client.cancellation().clone();
    let pipeline = Pipeline::new(client, store.clone(), users_config(), bets_config());

    cancel.cancel();
    let err = pipeline.run(Stages::BetsOnly, None).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(store.rows(BETS_TABLE).is_empty());
}
