use crate::feed::{FeedSession, PostRecord};
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 50;
pub const DEFAULT_SCAN_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    All,
    Limit,
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub mode: ScanMode,
    /// Only consulted when `mode` is `Limit`.
    pub limit: usize,
    pub page_size: usize,
}

pub fn build_scan_request(
    mode: ScanMode,
    limit: Option<usize>,
    page_size: Option<usize>,
) -> Result<ScanRequest> {
    let limit = match (mode, limit) {
        (ScanMode::Limit, None) => {
            return Err(EngineError::InvalidInput(
                "limit is required when mode is limit".to_string(),
            ));
        }
        (ScanMode::Limit, Some(0)) => {
            return Err(EngineError::InvalidInput(
                "limit must be at least 1".to_string(),
            ));
        }
        (ScanMode::Limit, Some(n)) => n,
        (ScanMode::All, _) => 0,
    };

    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    Ok(ScanRequest {
        mode,
        limit,
        page_size,
    })
}

/// One page of a creator's feed as handed back by the source.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub records: Vec<PostRecord>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// The source reported no more pages.
    Exhausted,
    /// A limit-mode scan reached its record limit.
    LimitReached,
    /// The stop handle was raised.
    Cancelled,
    /// The source returned an empty page while still claiming more remains.
    UpstreamStalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub pages_fetched: usize,
    pub records_added: usize,
    pub outcome: ScanOutcome,
}

/// Drives the cursor pagination loop against `fetch_page`, appending every
/// returned record to the session. The stop flag, the limit, and the
/// has-more state are each checked before a page is requested, in that
/// order, so at most one page is in flight after a stop and a limit-mode
/// scan can overshoot its limit by at most one page.
///
/// A page-fetch error aborts the loop; records collected so far stay in the
/// session.
pub fn run_feed_scan<FPage, FLog>(
    session: &mut FeedSession,
    request: &ScanRequest,
    mut fetch_page: FPage,
    mut log_line: FLog,
) -> Result<ScanSummary>
where
    FPage: FnMut(&str) -> Result<FeedPage>,
    FLog: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    session.begin_scan();

    let mut pages_fetched = 0usize;
    let mut records_added = 0usize;

    let outcome = loop {
        if session.is_stop_requested() {
            break ScanOutcome::Cancelled;
        }
        if request.mode == ScanMode::Limit && session.len() >= request.limit {
            break ScanOutcome::LimitReached;
        }
        if !session.has_more() {
            break ScanOutcome::Exhausted;
        }

        let page = fetch_page(session.cursor())?;
        pages_fetched += 1;

        let page_len = page.records.len();
        session.append_records(page.records, false);
        session.set_cursor_state(page.cursor, page.has_more);
        records_added += page_len;

        log_line(
            "info",
            "scan_page",
            serde_json::json!({
                "page": pages_fetched,
                "records": page_len,
                "collected": session.len(),
                "has_more": session.has_more(),
            }),
        )?;

        // An empty page with has_more still set would loop forever on the
        // same cursor; treat it as the end of the feed, not as an error.
        if page_len == 0 && session.has_more() {
            break ScanOutcome::UpstreamStalled;
        }
    };

    let summary = ScanSummary {
        pages_fetched,
        records_added,
        outcome,
    };

    log_line(
        "info",
        "scan_done",
        serde_json::json!({
            "outcome": summary.outcome,
            "pages": summary.pages_fetched,
            "records": summary.records_added,
        }),
    )?;

    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub reference: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFetchSummary {
    pub requested: usize,
    pub fetched: usize,
    pub failures: Vec<BatchFailure>,
}

/// Fetches one record per reference and appends each success to the session
/// with `selected` already set, so the batch can go straight to transfer. A
/// failed reference is recorded and the loop moves on.
pub fn run_batch_fetch<FPost, FLog>(
    session: &mut FeedSession,
    references: &[String],
    mut fetch_one: FPost,
    mut log_line: FLog,
) -> Result<BatchFetchSummary>
where
    FPost: FnMut(&str) -> Result<PostRecord>,
    FLog: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    session.begin_scan();

    let mut fetched = 0usize;
    let mut failures: Vec<BatchFailure> = Vec::new();

    for reference in references {
        if session.is_stop_requested() {
            break;
        }
        match fetch_one(reference) {
            Ok(record) => {
                session.append_records(vec![record], true);
                fetched += 1;
                log_line(
                    "info",
                    "batch_item",
                    serde_json::json!({
                        "reference": reference,
                        "collected": session.len(),
                    }),
                )?;
            }
            Err(err) => {
                log_line(
                    "warn",
                    "batch_item_failed",
                    serde_json::json!({
                        "reference": reference,
                        "error": err.to_string(),
                    }),
                )?;
                failures.push(BatchFailure {
                    reference: reference.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    Ok(BatchFetchSummary {
        requested: references.len(),
        fetched,
        failures,
    })
}

/// Appends one structured line to `logs/scans/{scan_id}.jsonl`.
pub fn scan_log_line(
    paths: &AppPaths,
    scan_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let dir = paths.scan_logs_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{scan_id}.jsonl"));
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "scan_id": scan_id,
        "level": level,
        "event": event,
        "data": data,
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
