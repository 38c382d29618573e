use crate::feed::{PostKind, PostRecord, StopHandle};
use crate::paths::AppPaths;
use crate::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const DEFAULT_TRANSFER_SLOTS: usize = 3;
pub const MAX_TRANSFER_SLOTS: usize = 16;

const SLOT_POLL_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub post_id: String,
    pub source_url: String,
    pub target_name: String,
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub jobs: Vec<TransferJob>,
    pub skipped_albums: usize,
}

pub fn target_name_for(record: &PostRecord) -> String {
    format!("video_{}.mp4", record.id)
}

/// Turns the dispatcher's input rows into jobs, in the given order. Album
/// posts need a different transfer path and are dropped here without
/// consuming a slot.
pub fn plan_transfers(records: &[PostRecord]) -> TransferPlan {
    let mut jobs = Vec::new();
    let mut skipped_albums = 0usize;
    for record in records {
        if record.kind == PostKind::Album {
            skipped_albums += 1;
            continue;
        }
        jobs.push(TransferJob {
            post_id: record.id.clone(),
            source_url: record.media_url.clone(),
            target_name: target_name_for(record),
        });
    }
    TransferPlan {
        jobs,
        skipped_albums,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub post_id: String,
    pub target_name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferBatchSummary {
    pub batch_id: String,
    pub requested: usize,
    pub issued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_albums: usize,
    /// In completion order, which concurrent slots do not preserve.
    pub outcomes: Vec<TransferOutcome>,
}

/// Runs the plan through `transfer` with at most `slots` calls outstanding
/// at any moment. A single admission loop owns the queue, so jobs leave it
/// strictly in plan order; each admitted job runs on its own thread and a
/// finished one (success or failure, both terminal) frees its slot for the
/// next. Returns once every admitted transfer has completed.
///
/// A raised `stop` handle stops admissions; in-flight transfers finish.
/// The scheduler keeps no state between calls: dispatching the same plan
/// twice performs two full passes.
pub fn run_transfer_batch<T>(
    plan: TransferPlan,
    slots: usize,
    stop: Option<&StopHandle>,
    transfer: T,
) -> TransferBatchSummary
where
    T: Fn(&TransferJob) -> Result<()> + Send + Sync,
{
    let slots = slots.clamp(1, MAX_TRANSFER_SLOTS);
    let requested = plan.jobs.len();
    let mut queue: VecDeque<TransferJob> = VecDeque::from(plan.jobs);

    let active = AtomicUsize::new(0);
    let outcomes: Mutex<Vec<TransferOutcome>> = Mutex::new(Vec::with_capacity(requested));
    let transfer = &transfer;
    let mut issued = 0usize;

    std::thread::scope(|scope| {
        loop {
            if queue.is_empty() {
                break;
            }
            if let Some(handle) = stop {
                if handle.is_raised() {
                    break;
                }
            }
            if active.load(Ordering::SeqCst) >= slots {
                std::thread::sleep(Duration::from_millis(SLOT_POLL_INTERVAL_MS));
                continue;
            }

            let job = match queue.pop_front() {
                Some(job) => job,
                None => break,
            };
            active.fetch_add(1, Ordering::SeqCst);
            issued += 1;

            let active_ref = &active;
            let outcomes_ref = &outcomes;
            scope.spawn(move || {
                let result = transfer(&job);
                let outcome = TransferOutcome {
                    post_id: job.post_id,
                    target_name: job.target_name,
                    error: result.err().map(|e| e.to_string()),
                };
                if let Ok(mut collected) = outcomes_ref.lock() {
                    collected.push(outcome);
                }
                active_ref.fetch_sub(1, Ordering::SeqCst);
            });
        }
        // Leaving the scope joins every in-flight worker.
    });

    let outcomes = match outcomes.into_inner() {
        Ok(collected) => collected,
        Err(poisoned) => poisoned.into_inner(),
    };
    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    let succeeded = outcomes.len() - failed;

    TransferBatchSummary {
        batch_id: Uuid::new_v4().to_string(),
        requested,
        issued,
        succeeded,
        failed,
        skipped_albums: plan.skipped_albums,
        outcomes,
    }
}

/// Appends the batch result to `logs/transfers/{batch_id}.jsonl`, one line
/// per outcome followed by a closing summary line.
pub fn write_transfer_log(paths: &AppPaths, summary: &TransferBatchSummary) -> Result<()> {
    let dir = paths.transfer_logs_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.jsonl", summary.batch_id));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    for outcome in &summary.outcomes {
        let (level, event) = match outcome.error {
            None => ("info", "transfer_done"),
            Some(_) => ("warn", "transfer_failed"),
        };
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "batch_id": summary.batch_id,
            "level": level,
            "event": event,
            "data": outcome,
        });
        writeln!(file, "{line}")?;
    }

    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "batch_id": summary.batch_id,
        "level": "info",
        "event": "batch_done",
        "data": {
            "requested": summary.requested,
            "issued": summary.issued,
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "skipped_albums": summary.skipped_albums,
        },
    });
    writeln!(file, "{line}")?;
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use std::sync::mpsc;

    fn video(id: &str) -> PostRecord {
        PostRecord {
            id: id.to_string(),
            posted_at_ms: 0,
            description: String::new(),
            author: String::new(),
            cover_url: String::new(),
            share_url: String::new(),
            media_url: format!("https://cdn.example.com/{id}.mp4"),
            music_url: None,
            kind: PostKind::Video,
            likes: 0,
            comments: 0,
            shares: 0,
        }
    }

    fn album(id: &str) -> PostRecord {
        PostRecord {
            kind: PostKind::Album,
            media_url: String::new(),
            ..video(id)
        }
    }

    #[test]
    fn planning_skips_albums_without_consuming_anything() {
        let records = vec![video("v1"), album("a1"), video("v2"), album("a2")];
        let plan = plan_transfers(&records);

        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.skipped_albums, 2);
        assert_eq!(plan.jobs[0].post_id, "v1");
        assert_eq!(plan.jobs[0].target_name, "video_v1.mp4");
        assert_eq!(plan.jobs[1].source_url, "https://cdn.example.com/v2.mp4");
    }

    #[test]
    fn active_transfers_never_exceed_the_slot_count() {
        let records: Vec<PostRecord> = (0..12).map(|i| video(&format!("v{i}"))).collect();
        let plan = plan_transfers(&records);

        let current = AtomicUsize::new(0);
        let high_water = AtomicUsize::new(0);

        let summary = run_transfer_batch(plan, 3, None, |_job| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(25));
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(summary.requested, 12);
        assert_eq!(summary.succeeded, 12);
        assert_eq!(summary.failed, 0);
        assert!(
            high_water.load(Ordering::SeqCst) <= 3,
            "saw {} concurrent transfers",
            high_water.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn more_slots_than_jobs_is_bounded_by_the_jobs() {
        let records = vec![video("v1"), video("v2")];
        let plan = plan_transfers(&records);

        let current = AtomicUsize::new(0);
        let high_water = AtomicUsize::new(0);

        let summary = run_transfer_batch(plan, 8, None, |_job| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(summary.succeeded, 2);
        assert!(high_water.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn a_slot_must_free_before_the_next_job_starts() {
        let records: Vec<PostRecord> = (0..5).map(|i| video(&format!("v{i}"))).collect();
        let plan = plan_transfers(&records);

        let started = AtomicUsize::new(0);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let started_before_release = AtomicUsize::new(usize::MAX);

        std::thread::scope(|s| {
            let started_ref = &started;
            let observed_ref = &started_before_release;
            s.spawn(move || {
                // Long enough for the scheduler to admit everything it may.
                std::thread::sleep(Duration::from_millis(200));
                observed_ref.store(started_ref.load(Ordering::SeqCst), Ordering::SeqCst);
                for _ in 0..5 {
                    let _ = release_tx.send(());
                }
            });

            let summary = run_transfer_batch(plan, 2, None, |_job| {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.lock().expect("rx lock").recv();
                Ok(())
            });
            assert_eq!(summary.issued, 5);
            assert_eq!(summary.succeeded, 5);
        });

        assert_eq!(
            started_before_release.load(Ordering::SeqCst),
            2,
            "only the two slots may start until one completes"
        );
        assert_eq!(started.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failures_free_their_slot_and_are_counted() {
        let records = vec![video("ok1"), video("bad"), video("ok2")];
        let plan = plan_transfers(&records);

        let summary = run_transfer_batch(plan, 2, None, |job| {
            if job.post_id == "bad" {
                Err(EngineError::TransferFailed {
                    name: job.target_name.clone(),
                    reason: "http 403".to_string(),
                })
            } else {
                Ok(())
            }
        });

        assert_eq!(summary.issued, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        let failed: Vec<&TransferOutcome> = summary
            .outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].post_id, "bad");
        assert!(
            failed[0].error.as_deref().unwrap_or("").contains("http 403"),
            "unexpected outcome: {failed:?}"
        );
    }

    #[test]
    fn raised_stop_handle_blocks_further_admissions() {
        let records: Vec<PostRecord> = (0..4).map(|i| video(&format!("v{i}"))).collect();
        let plan = plan_transfers(&records);
        let stop = StopHandle::new();
        let stop_ref = &stop;

        let summary = run_transfer_batch(plan, 1, Some(&stop), |_job| {
            stop_ref.raise();
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        });

        assert_eq!(summary.issued, 1, "no admission after the stop");
        assert_eq!(summary.succeeded, 1, "the in-flight transfer finishes");
        assert_eq!(summary.requested, 4);
    }

    #[test]
    fn empty_plan_completes_immediately() {
        let plan = plan_transfers(&[]);
        let summary = run_transfer_batch(plan, 4, None, |_job| Ok(()));

        assert_eq!(summary.requested, 0);
        assert_eq!(summary.issued, 0);
        assert!(summary.outcomes.is_empty());
    }

    #[test]
    fn dispatching_twice_runs_two_full_passes() {
        let records = vec![video("v1"), video("v2")];

        let first = run_transfer_batch(plan_transfers(&records), 2, None, |_job| Ok(()));
        let second = run_transfer_batch(plan_transfers(&records), 2, None, |_job| Ok(()));

        assert_eq!(first.succeeded, 2);
        assert_eq!(second.succeeded, 2);
        assert_ne!(first.batch_id, second.batch_id);
    }

    #[test]
    fn transfer_log_has_one_line_per_outcome_plus_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let records = vec![video("v1"), video("v2")];
        let summary = run_transfer_batch(plan_transfers(&records), 2, None, |job| {
            if job.post_id == "v2" {
                Err(EngineError::TransferFailed {
                    name: job.target_name.clone(),
                    reason: "timeout".to_string(),
                })
            } else {
                Ok(())
            }
        });

        write_transfer_log(&paths, &summary).expect("write log");

        let raw = std::fs::read_to_string(
            paths
                .transfer_logs_dir()
                .join(format!("{}.jsonl", summary.batch_id)),
        )
        .expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);

        let last: serde_json::Value = serde_json::from_str(lines[2]).expect("parse");
        assert_eq!(last["event"], "batch_done");
        assert_eq!(last["data"]["succeeded"], 1);
        assert_eq!(last["data"]["failed"], 1);
    }
}
