use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::feed::{parse_feed, FetchError, FetchOutcome, Fetcher, ParseError};
use crate::reconcile::BatchStats;
use crate::storage::{CacheHints, Database, DatabaseError, Source};

/// A poll failure at any stage of fetch → parse → store.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The feed was fetched and reconciled
    Ingested(BatchStats),
    /// The server answered 304
    NotModified,
}

/// What one poll of one source did, after its bookkeeping was written.
#[derive(Debug)]
pub struct PollReport {
    pub source_id: i64,
    pub finished_at: DateTime<Utc>,
    pub outcome: Result<PollOutcome, PollError>,
    /// Consecutive failures after this poll (0 on success)
    pub failures: u32,
}

impl PollReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Fetch, parse and store one source. Never writes failure bookkeeping.
pub async fn poll_source(
    db: &Database,
    fetcher: &Fetcher,
    source: &Source,
) -> Result<PollOutcome, PollError> {
    let hints = CacheHints {
        etag: source.etag.clone(),
        last_modified: source.last_modified.clone(),
    };

    let payload = match fetcher.fetch(&source.url, &hints).await? {
        FetchOutcome::NotModified => {
            db.record_not_modified(source.id, Utc::now().timestamp())
                .await?;
            return Ok(PollOutcome::NotModified);
        }
        FetchOutcome::Fetched(payload) => payload,
    };

    let parsed = parse_feed(
        &payload.bytes,
        payload.content_type.as_deref(),
        Some(&source.url),
    )?;

    let stats = db
        .apply_poll(source.id, &parsed, &payload.cache, Utc::now().timestamp())
        .await?;
    Ok(PollOutcome::Ingested(stats))
}

/// Poll one source and record the result on the source row.
///
/// Failures are absorbed here: they are logged and counted, never propagated.
pub async fn run_poll(db: &Database, fetcher: &Fetcher, source: &Source) -> PollReport {
    let outcome = poll_source(db, fetcher, source).await;
    let finished_at = Utc::now();

    let failures = match &outcome {
        Ok(PollOutcome::Ingested(stats)) => {
            tracing::info!(
                source_id = source.id,
                inserted = stats.inserted,
                updated = stats.updated,
                unchanged = stats.unchanged,
                skipped = stats.skipped_malformed,
                duplicates = stats.duplicates,
                "Polled source"
            );
            0
        }
        Ok(PollOutcome::NotModified) => {
            tracing::debug!(source_id = source.id, "Source not modified");
            0
        }
        Err(e) => {
            let message = e.to_string();
            match db
                .record_poll_failure(source.id, &message, finished_at.timestamp())
                .await
            {
                Ok(count) => {
                    tracing::warn!(
                        source_id = source.id,
                        url = %source.url,
                        failures = count,
                        error = %message,
                        "Poll failed"
                    );
                    u32::try_from(count).unwrap_or(u32::MAX)
                }
                Err(db_err) => {
                    tracing::warn!(
                        source_id = source.id,
                        error = %message,
                        db_error = %db_err,
                        "Poll failed and failure could not be recorded"
                    );
                    u32::try_from(source.consecutive_failures.saturating_add(1)).unwrap_or(u32::MAX)
                }
            }
        }
    };

    PollReport {
        source_id: source.id,
        finished_at,
        outcome,
        failures,
    }
}
