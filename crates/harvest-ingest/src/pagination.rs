//! Cursor-driven pagination over list endpoints
//!
//! Each call sends `limit` and, once a cursor is held, `before=<cursor>`.
//! The cursor for the next call is read from the last payload of the
//! previous page. A page shorter than `limit` (or an empty one) ends the
//! sequence.

use harvest_common::types::RawPayload;
use harvest_common::{HarvestError, Result};
use tracing::{debug, warn};

use crate::client::ApiClient;

/// A paginated list endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub path: &'static str,
    /// Query parameter that filters the list down to one subject
    pub subject_param: Option<&'static str>,
    /// Payload field the next cursor is read from
    pub cursor_field: &'static str,
    /// Payload field naming the record's owner, for endpoints whose subject
    /// filter is not trusted
    pub owner_field: Option<&'static str>,
}

impl Endpoint {
    pub const BETS: Endpoint = Endpoint {
        path: "bets",
        subject_param: Some("userId"),
        cursor_field: "id",
        owner_field: None,
    };

    pub const USERS: Endpoint = Endpoint {
        path: "users",
        subject_param: None,
        cursor_field: "id",
        owner_field: None,
    };

    pub const MARKETS: Endpoint = Endpoint {
        path: "markets",
        subject_param: Some("creatorId"),
        cursor_field: "id",
        owner_field: Some("creatorId"),
    };

    pub const COMMENTS: Endpoint = Endpoint {
        path: "comments",
        subject_param: Some("userId"),
        cursor_field: "id",
        owner_field: Some("userId"),
    };

    /// Whether `payload` belongs to `subject_id`. Always true without an
    /// owner field.
    pub fn owned_by(&self, payload: &RawPayload, subject_id: &str) -> bool {
        match self.owner_field {
            None => true,
            Some(field) => payload.opt_str(field).ok().flatten() == Some(subject_id),
        }
    }
}

/// One page of results and the cursor derived from its last payload
#[derive(Debug, Clone)]
pub struct Page {
    pub payloads: Vec<RawPayload>,
    pub cursor: Option<String>,
    /// Shorter than the requested page size; nothing follows it. A full
    /// final page stays non-terminal and the empty response after it ends
    /// the sequence without yielding a page.
    pub terminal: bool,
}

impl Page {
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// Everything a paginator produced before it stopped
#[derive(Debug, Default)]
pub struct Drained {
    pub payloads: Vec<RawPayload>,
    pub pages: usize,
    /// Error that cut the sequence short; pages before it are kept
    pub stopped: Option<HarvestError>,
}

impl Drained {
    pub fn is_complete(&self) -> bool {
        self.stopped.is_none()
    }
}

/// Lazy, finite, non-restartable sequence of [`Page`]s for one endpoint
/// (and optionally one subject).
pub struct CursorPaginator<'a> {
    client: &'a ApiClient,
    endpoint: Endpoint,
    subject: Option<String>,
    page_size: usize,
    cursor: Option<String>,
    finished: bool,
}

impl<'a> CursorPaginator<'a> {
    pub fn new(client: &'a ApiClient, endpoint: Endpoint, page_size: usize) -> Self {
        Self {
            client,
            endpoint,
            subject: None,
            page_size: page_size.max(1),
            cursor: None,
            finished: false,
        }
    }

    /// Filter the endpoint to one subject's records
    pub fn for_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject = Some(subject_id.into());
        self
    }

    /// Start from an existing cursor instead of the newest record
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.page_size.to_string())];
        if let (Some(param), Some(subject)) = (self.endpoint.subject_param, &self.subject) {
            params.push((param, subject.clone()));
        }
        if let Some(ref cursor) = self.cursor {
            params.push(("before", cursor.clone()));
        }
        params
    }

    /// Fetch the next page.
    ///
    /// Returns `None` once the sequence has ended. An error is yielded once
    /// and ends the sequence.
    pub async fn next_page(&mut self) -> Option<Result<Page>> {
        if self.finished {
            return None;
        }

        let payloads: Vec<RawPayload> =
            match self.client.get_json(self.endpoint.path, &self.params()).await {
                Ok(payloads) => payloads,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                },
            };

        if payloads.is_empty() {
            self.finished = true;
            return None;
        }

        let terminal = payloads.len() < self.page_size;
        let cursor = payloads
            .last()
            .and_then(|p| p.cursor(self.endpoint.cursor_field));

        if terminal {
            self.finished = true;
        } else if cursor.is_none() {
            warn!(
                endpoint = self.endpoint.path,
                subject = ?self.subject,
                field = self.endpoint.cursor_field,
                "Last payload has no cursor; stopping pagination"
            );
            self.finished = true;
        } else {
            self.cursor = cursor.clone();
        }

        debug!(
            endpoint = self.endpoint.path,
            subject = ?self.subject,
            size = payloads.len(),
            terminal,
            "Fetched page"
        );

        Some(Ok(Page {
            payloads,
            cursor,
            terminal,
        }))
    }

    /// Pull every remaining page and concatenate the payloads
    pub async fn drain(mut self) -> Drained {
        let mut drained = Drained::default();

        while let Some(page) = self.next_page().await {
            match page {
                Ok(page) => {
                    drained.pages += 1;
                    drained.payloads.extend(page.payloads);
                },
                Err(e) => drained.stopped = Some(e),
            }
        }

        drained
    }
}
