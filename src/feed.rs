use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cursor value meaning "start from the newest post".
pub const CURSOR_START: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Video,
    Album,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub posted_at_ms: i64,
    pub description: String,
    pub author: String,
    pub cover_url: String,
    pub share_url: String,
    pub media_url: String,
    pub music_url: Option<String>,
    pub kind: PostKind,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
}

/// Per-row derived state. `visible` is owned by the date filter,
/// `selected` by the selection operations; the two never write each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowFlags {
    pub visible: bool,
    pub selected: bool,
}

#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn raise(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn lower(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One scan's worth of collected posts plus their row flags. Owned by the
/// caller and passed into scan/batch runs; rows are only ever appended, so an
/// index keeps pointing at the same record for the life of the scan.
#[derive(Debug)]
pub struct FeedSession {
    records: Vec<PostRecord>,
    flags: Vec<RowFlags>,
    filter_start_ms: Option<i64>,
    filter_end_ms: Option<i64>,
    cursor: String,
    has_more: bool,
    stop: StopHandle,
}

impl FeedSession {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            flags: Vec::new(),
            filter_start_ms: None,
            filter_end_ms: None,
            cursor: CURSOR_START.to_string(),
            has_more: true,
            stop: StopHandle::new(),
        }
    }

    /// Handle for requesting a cooperative stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_raised()
    }

    /// Clears everything from the previous run: records, flags, the active
    /// date filter, the cursor, and a previously raised stop flag.
    pub fn begin_scan(&mut self) {
        self.records.clear();
        self.flags.clear();
        self.filter_start_ms = None;
        self.filter_end_ms = None;
        self.cursor = CURSOR_START.to_string();
        self.has_more = true;
        self.stop.lower();
    }

    pub fn append_records(&mut self, batch: Vec<PostRecord>, selected_by_default: bool) {
        for record in batch {
            self.records.push(record);
            self.flags.push(RowFlags {
                visible: true,
                selected: selected_by_default,
            });
        }
        self.refilter();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PostRecord] {
        &self.records
    }

    pub fn flags(&self) -> &[RowFlags] {
        &self.flags
    }

    pub fn record(&self, index: usize) -> Option<&PostRecord> {
        self.records.get(index)
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.flags.get(index).map(|f| f.selected).unwrap_or(false)
    }

    pub fn is_visible(&self, index: usize) -> bool {
        self.flags.get(index).map(|f| f.visible).unwrap_or(false)
    }

    /// Sets `selected` for exactly one row. Out-of-range indices are ignored.
    pub fn set_selected(&mut self, index: usize, value: bool) {
        if let Some(flags) = self.flags.get_mut(index) {
            flags.selected = value;
        }
    }

    /// Sets `selected` for every row in the closed range between the two
    /// endpoints (either order). Indices past the end are ignored.
    pub fn set_selected_range(&mut self, a: usize, b: usize, value: bool) {
        if self.flags.is_empty() {
            return;
        }
        let lo = a.min(b);
        if lo >= self.flags.len() {
            return;
        }
        let hi = a.max(b).min(self.flags.len() - 1);
        for flags in &mut self.flags[lo..=hi] {
            flags.selected = value;
        }
    }

    /// Sets `selected` on visible rows only; hidden rows keep their flag.
    pub fn select_all_visible(&mut self, value: bool) {
        for flags in &mut self.flags {
            if flags.visible {
                flags.selected = value;
            }
        }
    }

    /// Recomputes `visible` for every row against the inclusive range
    /// `[start_ms, end_ms]`. A missing bound leaves that side open. The
    /// filter stays active and is re-applied to rows appended later.
    /// `selected` flags are never touched here.
    pub fn set_date_filter(&mut self, start_ms: Option<i64>, end_ms: Option<i64>) {
        self.filter_start_ms = start_ms;
        self.filter_end_ms = end_ms;
        self.refilter();
    }

    pub fn clear_date_filter(&mut self) {
        self.set_date_filter(None, None);
    }

    pub fn date_filter(&self) -> (Option<i64>, Option<i64>) {
        (self.filter_start_ms, self.filter_end_ms)
    }

    fn refilter(&mut self) {
        let start = self.filter_start_ms;
        let end = self.filter_end_ms;
        for (record, flags) in self.records.iter().zip(self.flags.iter_mut()) {
            let after_start = start.map_or(true, |s| record.posted_at_ms >= s);
            let before_end = end.map_or(true, |e| record.posted_at_ms <= e);
            flags.visible = after_start && before_end;
        }
    }

    pub fn visible_count(&self) -> usize {
        self.flags.iter().filter(|f| f.visible).count()
    }

    pub fn selected_visible_count(&self) -> usize {
        self.flags.iter().filter(|f| f.visible && f.selected).count()
    }

    /// Snapshot of the rows a transfer batch should see: visible and
    /// selected, in collection order.
    pub fn visible_selected_records(&self) -> Vec<PostRecord> {
        self.records
            .iter()
            .zip(self.flags.iter())
            .filter(|(_, f)| f.visible && f.selected)
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// Share links of the visible, selected rows, for clipboard export.
    pub fn selected_share_links(&self) -> Vec<String> {
        self.records
            .iter()
            .zip(self.flags.iter())
            .filter(|(r, f)| f.visible && f.selected && !r.share_url.is_empty())
            .map(|(r, _)| r.share_url.clone())
            .collect()
    }

    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub(crate) fn set_cursor_state(&mut self, cursor: String, has_more: bool) {
        self.cursor = cursor;
        self.has_more = has_more;
    }
}

impl Default for FeedSession {
    fn default() -> Self {
        Self::new()
    }
}
