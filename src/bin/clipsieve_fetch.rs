use std::path::PathBuf;

use clipsieve_engine::dispatch::{self, plan_transfers, run_transfer_batch};
use clipsieve_engine::paths::AppPaths;
use clipsieve_engine::scan::{
    build_scan_request, run_batch_fetch, run_feed_scan, scan_log_line, ScanMode,
};
use clipsieve_engine::tikhub::{parse_reference_lines, TikhubClient};
use clipsieve_engine::transfer::MediaDownloader;
use clipsieve_engine::{feed::FeedSession, settings};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut creator: Option<String> = None;
    let mut batch_file: Option<PathBuf> = None;
    let mut limit: Option<usize> = None;
    let mut after_ms: Option<i64> = None;
    let mut before_ms: Option<i64> = None;
    let mut slots: Option<usize> = None;
    let mut set_token: Option<String> = None;
    let mut check_key = false;
    let mut list_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--creator" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--creator requires a value".to_string())?;
                creator = Some(v.to_string());
            }
            "--batch-file" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--batch-file requires a value".to_string())?;
                batch_file = Some(PathBuf::from(v));
            }
            "--limit" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--limit requires a value".to_string())?;
                limit = Some(v.parse().map_err(|_| format!("bad --limit: {v}"))?);
            }
            "--after-ms" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--after-ms requires a value".to_string())?;
                after_ms = Some(v.parse().map_err(|_| format!("bad --after-ms: {v}"))?);
            }
            "--before-ms" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--before-ms requires a value".to_string())?;
                before_ms = Some(v.parse().map_err(|_| format!("bad --before-ms: {v}"))?);
            }
            "--slots" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--slots requires a value".to_string())?;
                slots = Some(v.parse().map_err(|_| format!("bad --slots: {v}"))?);
            }
            "--set-token" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--set-token requires a value".to_string())?;
                set_token = Some(v.to_string());
            }
            "--check-key" => check_key = true,
            "--list-only" => list_only = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    if let Some(token) = set_token {
        settings::write_api_token(&paths, &token).map_err(|e| e.to_string())?;
        println!("Token saved to {}", paths.api_token_path().to_string_lossy());
        if !check_key && creator.is_none() && batch_file.is_none() {
            return Ok(());
        }
    }

    let token = settings::read_api_token(&paths)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no api token; pass --set-token first".to_string())?;
    let client = TikhubClient::new(&token);

    if check_key {
        let status = client.verify_key().map_err(|e| e.to_string())?;
        println!(
            "Key ok: {} (balance {:.2}, active={})",
            status.email, status.balance, status.active
        );
        if creator.is_none() && batch_file.is_none() {
            return Ok(());
        }
    }

    let app_settings = settings::load_settings(&paths).map_err(|e| e.to_string())?;
    let mut session = FeedSession::new();
    let scan_id = uuid::Uuid::new_v4().to_string();

    match (&creator, &batch_file) {
        (Some(reference), None) => {
            let sec_uid = client.resolve_creator(reference).map_err(|e| e.to_string())?;
            println!("Resolved creator: {}", sec_uid.as_str());

            let (mode, limit) = match limit {
                Some(n) => (ScanMode::Limit, Some(n)),
                None => (app_settings.scan_mode, Some(app_settings.scan_limit)),
            };
            let request = build_scan_request(mode, limit, Some(app_settings.page_size))
                .map_err(|e| e.to_string())?;

            let summary = run_feed_scan(
                &mut session,
                &request,
                |cursor| client.fetch_creator_page(&sec_uid, cursor, request.page_size),
                |level, event, data| scan_log_line(&paths, &scan_id, level, event, data),
            )
            .map_err(|e| e.to_string())?;
            println!(
                "Scan: {} posts over {} pages ({:?})",
                summary.records_added, summary.pages_fetched, summary.outcome
            );
            // Feed scans collect everything; select the lot, then let the
            // date filter narrow it down.
            session.select_all_visible(true);
        }
        (None, Some(file)) => {
            let raw = std::fs::read_to_string(file).map_err(|e| e.to_string())?;
            let references = parse_reference_lines(&raw);
            if references.is_empty() {
                return Err(format!("no references in {}", file.to_string_lossy()));
            }
            let summary = run_batch_fetch(
                &mut session,
                &references,
                |reference| client.fetch_post(reference),
                |level, event, data| scan_log_line(&paths, &scan_id, level, event, data),
            )
            .map_err(|e| e.to_string())?;
            println!(
                "Batch: {}/{} fetched, {} failed",
                summary.fetched,
                summary.requested,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("  {}: {}", failure.reference, failure.error);
            }
        }
        (Some(_), Some(_)) => {
            return Err("--creator and --batch-file are mutually exclusive".to_string());
        }
        (None, None) => {
            return Err("nothing to do (pass --creator or --batch-file)".to_string());
        }
    }

    if after_ms.is_some() || before_ms.is_some() {
        session.set_date_filter(after_ms, before_ms);
        println!(
            "Filter: {} of {} posts visible",
            session.visible_count(),
            session.len()
        );
    }

    let plan = plan_transfers(&session.visible_selected_records());
    if plan.skipped_albums > 0 {
        println!("Skipping {} album posts", plan.skipped_albums);
    }

    if list_only {
        for link in session.selected_share_links() {
            println!("{link}");
        }
        return Ok(());
    }

    if plan.jobs.is_empty() {
        println!("Nothing to download");
        return Ok(());
    }

    let download_dir = paths.effective_download_dir().map_err(|e| e.to_string())?;
    let downloader = MediaDownloader::new(download_dir.clone(), 0);
    let slots = slots.unwrap_or(app_settings.transfer_slots);

    println!(
        "Downloading {} posts with {} slots into {}",
        plan.jobs.len(),
        slots.clamp(1, dispatch::MAX_TRANSFER_SLOTS),
        download_dir.to_string_lossy()
    );
    let summary = run_transfer_batch(plan, slots, None, |job| {
        downloader.download(job).map(|_| ())
    });
    dispatch::write_transfer_log(&paths, &summary).map_err(|e| e.to_string())?;

    println!(
        "Done: {} ok, {} failed (batch {})",
        summary.succeeded, summary.failed, summary.batch_id
    );
    for outcome in summary.outcomes.iter().filter(|o| o.error.is_some()) {
        eprintln!(
            "  {}: {}",
            outcome.target_name,
            outcome.error.as_deref().unwrap_or("unknown")
        );
    }
    if summary.failed > 0 {
        return Err(format!("{} transfers failed", summary.failed));
    }
    Ok(())
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("CLIPSIEVE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("com.clipsieve.clipsieve"));
            }
        }
    } else if let Ok(home) = std::env::var("HOME") {
        let t = home.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t).join(".clipsieve"));
        }
    }

    None
}

fn print_help() {
    println!(
        r#"clipsieve_fetch

Collects Douyin post metadata through TikHub and downloads a filtered subset.

Usage:
  cargo run --bin clipsieve_fetch -- --set-token <key> --check-key
  cargo run --bin clipsieve_fetch -- --creator <profile-url> --limit 50
  cargo run --bin clipsieve_fetch -- --batch-file links.txt --slots 5

Options:
  --base-dir <path>    Override base dir (default: CLIPSIEVE_BASE_DIR or ~/.clipsieve)
  --creator <ref>      Profile link or share blob to scan
  --batch-file <path>  File with one post link per line
  --limit <n>          Stop the scan once n posts are collected
  --after-ms <ms>      Keep only posts at or after this epoch-ms timestamp
  --before-ms <ms>     Keep only posts at or before this epoch-ms timestamp
  --slots <n>          Concurrent downloads (default from settings, max {})
  --set-token <key>    Store the TikHub API key and exit (unless combined)
  --check-key          Verify the stored key and show the balance
  --list-only          Print share links of the selection instead of downloading
"#,
        dispatch::MAX_TRANSFER_SLOTS
    );
}
