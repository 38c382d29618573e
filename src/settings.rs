use crate::paths::AppPaths;
use crate::scan::{ScanMode, DEFAULT_PAGE_SIZE, DEFAULT_SCAN_LIMIT};
use crate::{dispatch, EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub transfer_slots: usize,
    pub scan_mode: ScanMode,
    pub scan_limit: usize,
    pub page_size: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            transfer_slots: dispatch::DEFAULT_TRANSFER_SLOTS,
            scan_mode: ScanMode::All,
            scan_limit: DEFAULT_SCAN_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<AppSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: AppSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidInput(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &AppSettings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

pub fn write_api_token(paths: &AppPaths, token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(EngineError::InvalidInput("api token is empty".to_string()));
    }
    let path = paths.api_token_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{token}\n"))?;
    Ok(())
}

pub fn read_api_token(paths: &AppPaths) -> Result<Option<String>> {
    let path = paths.api_token_path();
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(trimmed.to_string()))
}

pub fn clear_api_token(paths: &AppPaths) -> Result<()> {
    let path = paths.api_token_path();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
