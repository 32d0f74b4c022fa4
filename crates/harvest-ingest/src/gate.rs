//! Cheap volume check run before a subject's full history is pulled

use harvest_common::types::Subject;
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::pagination::{CursorPaginator, Endpoint};

/// Whether `subject` has at least `threshold` records on `endpoint`.
///
/// Issues a single request with `limit = threshold + 1`. Errors never reach
/// the caller: a missing subject or any failed request counts as "below
/// threshold" and is logged.
pub async fn quick_check(
    client: &ApiClient,
    endpoint: Endpoint,
    subject: &Subject,
    threshold: usize,
) -> bool {
    let mut sample = CursorPaginator::new(client, endpoint, threshold.saturating_add(1))
        .for_subject(subject.id.as_str());

    let count = match sample.next_page().await {
        None => 0,
        Some(Ok(page)) => page.len(),
        Some(Err(e)) if e.is_not_found() => {
            info!(subject = %subject, error = %e, "Subject not found");
            return false;
        },
        Some(Err(e)) => {
            warn!(subject = %subject, error = %e, "Threshold check failed");
            return false;
        },
    };

    debug!(subject = %subject, count, threshold, "Threshold check");
    count >= threshold
}
