//! Shared fixtures for the harvest integration tests
//!
//! - [`Feed`]: a wiremock responder serving a cursor-paginated list
//! - [`MemoryStore`]: in-memory `RecordSink`, `SubjectStore` and
//!   `RankedSubjects`
//! - [`test_client`]: a client with no throttle and millisecond backoff

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use harvest_common::types::{FieldValue, NormalizedRecord, Subject, TableSchema};
use harvest_common::{HarvestError, Result};
use harvest_ingest::client::{ApiClient, RateLimiter, RetryPolicy};
use harvest_ingest::normalize::bets::BETS_TABLE;
use harvest_ingest::source::{RankedSubject, RankedSubjects, StartPoint, SubjectStore};
use harvest_ingest::writer::RecordSink;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

// ============================================================================
// HTTP fixtures
// ============================================================================

pub fn test_client(server: &MockServer, max_retries: u32) -> ApiClient {
    ApiClient::builder(server.uri())
        .timeout(Duration::from_secs(5))
        .retry_policy(RetryPolicy::new(max_retries, 2.0).with_backoff_unit(Duration::from_millis(1)))
        .rate_limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
        .build()
        .expect("client should build")
}

/// Bet payload that passes normalization
pub fn item(id: &str, owner: &str) -> Value {
    json!({
        "id": id,
        "userId": owner,
        "contractId": "c1",
        "createdTime": 1_700_000_000_000_i64,
        "amount": 10,
        "outcome": "YES",
        "shares": 12.5,
        "probBefore": 0.4,
        "probAfter": 0.42,
        "fees": {"liquidityFee": 0, "creatorFee": 0.1, "platformFee": 0.1},
        "isRedemption": false
    })
}

/// User payload that passes normalization
pub fn user(id: &str, username: &str) -> Value {
    json!({
        "id": id,
        "username": username,
        "name": username,
        "createdTime": 1_700_000_000_000_i64,
        "balance": 100.0,
        "totalDeposits": 50,
        "creatorTraders": {"daily": 0}
    })
}

/// Market payload that passes normalization
pub fn market(id: &str, creator: &str) -> Value {
    json!({
        "id": id,
        "slug": id,
        "creatorId": creator,
        "question": format!("Question {id}?"),
        "visibility": "public",
        "token": "MANA",
        "outcomeType": "BINARY",
        "volume": 100,
        "createdTime": 1_700_000_000_000_i64,
        "groupSlugs": ["testing"]
    })
}

/// Comment payload that passes normalization
pub fn comment(id: &str, author: &str) -> Value {
    json!({
        "id": id,
        "commentType": "contract",
        "userId": author,
        "contractId": "c1",
        "createdTime": 1_700_000_000_000_i64,
        "content": {"type": "doc", "content": []},
        "userUsername": author,
        "userName": author
    })
}

/// `count` items for `owner`, newest first
pub fn items_for(owner: &str, count: usize) -> Vec<Value> {
    (0..count)
        .rev()
        .map(|i| item(&format!("{owner}-{i:04}"), owner))
        .collect()
}

/// Cursor-paginated list endpoint backed by fixed data.
///
/// Honors `limit`, `before` and an optional per-subject filter. Unknown
/// subjects get a 404 with a JSON message; `broken` subjects get a 400 for
/// any request whose `limit` equals `broken_limit`.
#[derive(Clone, Default)]
pub struct Feed {
    subject_param: Option<&'static str>,
    all: Vec<Value>,
    by_subject: HashMap<String, Vec<Value>>,
    broken: HashSet<String>,
    broken_limit: Option<usize>,
}

impl Feed {
    pub fn unfiltered(items: Vec<Value>) -> Self {
        Self {
            all: items,
            ..Default::default()
        }
    }

    pub fn by_subject(param: &'static str) -> Self {
        Self {
            subject_param: Some(param),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: &str, items: Vec<Value>) -> Self {
        self.by_subject.insert(subject.to_string(), items);
        self
    }

    pub fn broken_for(mut self, subject: &str, limit: usize) -> Self {
        self.broken.insert(subject.to_string());
        self.broken_limit = Some(limit);
        self
    }
}

impl Respond for Feed {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let params: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let limit: usize = params
            .get("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(1000);

        let items = match self.subject_param {
            None => &self.all,
            Some(param) => {
                let subject = params.get(param).cloned().unwrap_or_default();
                if self.broken.contains(&subject) && self.broken_limit == Some(limit) {
                    return ResponseTemplate::new(400).set_body_json(json!({"message": "bad request"}));
                }
                match self.by_subject.get(&subject) {
                    Some(items) => items,
                    None => {
                        return ResponseTemplate::new(404)
                            .set_body_json(json!({"message": format!("User {subject} not found")}))
                    },
                }
            },
        };

        let start = match params.get("before") {
            Some(before) => items
                .iter()
                .position(|v| v["id"].as_str() == Some(before.as_str()))
                .map_or(items.len(), |i| i + 1),
            None => 0,
        };

        let page: Vec<Value> = items.iter().skip(start).take(limit).cloned().collect();
        ResponseTemplate::new(200).set_body_json(page)
    }
}

// ============================================================================
// Storage fixtures
// ============================================================================

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<String, NormalizedRecord>>,
    batch_sizes: Vec<usize>,
}

/// In-memory record sink and subject store.
///
/// Any batch containing a poisoned id is rejected with a schema/constraint
/// error; `fail_all` makes every write fail fatally.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    subjects: Arc<Vec<Subject>>,
    poisoned: Arc<HashSet<String>>,
    fail_all: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subjects(mut self, mut subjects: Vec<Subject>) -> Self {
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        self.subjects = Arc::new(subjects);
        self
    }

    pub fn poison<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.poisoned = Arc::new(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn rows(&self, table: &str) -> BTreeMap<String, NormalizedRecord> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batch_sizes.clone()
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn column_count(&self, table: &TableSchema) -> Result<usize> {
        Ok(table.column_count())
    }

    async fn upsert(&self, table: &TableSchema, records: &[NormalizedRecord]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.batch_sizes.push(records.len());

        if self.fail_all {
            return Err(HarvestError::Database("connection reset".into()));
        }
        if let Some(bad) = records.iter().find(|r| self.poisoned.contains(r.id())) {
            return Err(HarvestError::schema_or_constraint(format!(
                "null value in column violates not-null constraint ({})",
                bad.id()
            )));
        }

        let rows = state.tables.entry(table.name.clone()).or_default();
        for record in records {
            rows.insert(record.id().to_string(), record.clone());
        }
        Ok(records.len() as u64)
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn resolve_label(&self, label: &str) -> Result<Option<String>> {
        Ok(self
            .subjects
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.id.clone()))
    }

    fn fetch(&self, start: StartPoint) -> BoxStream<'_, Result<Subject>> {
        let selected: Vec<Result<Subject>> = self
            .subjects
            .iter()
            .filter(|s| match &start {
                StartPoint::Beginning => true,
                StartPoint::AtId(id) => s.id >= *id,
                StartPoint::AfterLabel(label) => s.label > *label,
            })
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(selected).boxed()
    }
}

/// Ranks subjects by the `user_id` of their stored bets
#[async_trait]
impl RankedSubjects for MemoryStore {
    async fn top_subjects(&self, limit: usize) -> Result<Vec<RankedSubject>> {
        let bets = self.rows(BETS_TABLE);
        let mut ranked: Vec<RankedSubject> = self
            .subjects
            .iter()
            .map(|subject| RankedSubject {
                subject: subject.clone(),
                item_count: bets
                    .values()
                    .filter(|b| b.get("user_id") == &FieldValue::Text(subject.id.clone()))
                    .count() as u64,
            })
            .filter(|r| r.item_count > 0)
            .collect();

        ranked.sort_by(|a, b| {
            b.item_count
                .cmp(&a.item_count)
                .then_with(|| a.subject.id.cmp(&b.subject.id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}

/// Subjects `u00..u{n}` labelled `user00..`, so label and id orders agree
pub fn subjects(n: usize) -> Vec<Subject> {
    (0..n)
        .map(|i| Subject::new(format!("u{i:02}"), format!("user{i:02}")))
        .collect()
}
