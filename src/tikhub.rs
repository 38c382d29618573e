use crate::feed::{PostKind, PostRecord, CURSOR_START};
use crate::scan::{FeedPage, MAX_PAGE_SIZE};
use crate::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use std::io::Read;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.tikhub.io";

const SINGLE_POST_PATH: &str = "/api/v1/douyin/app/v3/fetch_one_video_by_share_url";
const SEC_USER_ID_PATH: &str = "/api/v1/douyin/web/get_sec_user_id";
const USER_POSTS_PATH: &str = "/api/v1/douyin/app/v3/fetch_user_post_videos";
const ACCOUNT_INFO_PATH: &str = "/api/v1/tikhub/user/get_user_info";

const API_USER_AGENT: &str = "ClipSieve/0.1.0";
const API_TIMEOUT_SECS: u64 = 30;
const MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;
const COVER_PLACEHOLDER: &str = "https://placehold.co/300x400/png?text=No+Preview";

/// Douyin's stable per-creator id, resolved from a profile link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecUid(pub String);

impl SecUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct KeyStatus {
    pub email: String,
    pub balance: f64,
    pub active: bool,
}

pub struct TikhubClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl TikhubClient {
    pub fn new(token: &str) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(API_TIMEOUT_SECS)))
            .user_agent(API_USER_AGENT);
        Self {
            agent: config.build().into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        }
    }

    /// Resolves a pasted profile reference (a bare link or a share blob
    /// containing one) to the creator's sec_uid.
    pub fn resolve_creator(&self, reference: &str) -> Result<SecUid> {
        let reference = normalize_reference(reference)?;
        let body = self.get_json(SEC_USER_ID_PATH, &[("url", reference.as_str())])?;
        let sec_uid = body
            .get("data")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::SourceUnresolved(reference.clone()))?;
        Ok(SecUid(sec_uid.to_string()))
    }

    /// One page of a creator's posts. `cursor` is passed back verbatim from
    /// the previous page (`"0"` for the first request).
    pub fn fetch_creator_page(
        &self,
        sec_uid: &SecUid,
        cursor: &str,
        count: usize,
    ) -> Result<FeedPage> {
        let count = count.clamp(1, MAX_PAGE_SIZE).to_string();
        let body = self.get_json(
            USER_POSTS_PATH,
            &[
                ("sec_user_id", sec_uid.as_str()),
                ("count", count.as_str()),
                ("max_cursor", cursor),
            ],
        )?;
        page_from_value(&body)
    }

    pub fn fetch_post(&self, reference: &str) -> Result<PostRecord> {
        let reference = normalize_reference(reference)?;
        let body = self.get_json(SINGLE_POST_PATH, &[("share_url", reference.as_str())])?;
        let data = body
            .get("data")
            .ok_or_else(|| EngineError::ApiPayload("post response missing data".to_string()))?;
        clean_post(data).ok_or_else(|| {
            EngineError::ApiPayload(format!("post payload missing id for {reference}"))
        })
    }

    /// Checks the client's token against the account endpoint. Useful both
    /// for validating a candidate key and for showing the credit balance.
    pub fn verify_key(&self) -> Result<KeyStatus> {
        let body = self.get_json(ACCOUNT_INFO_PATH, &[])?;
        let user_data = body
            .get("user_data")
            .or_else(|| body.get("data").and_then(|d| d.get("user_data")))
            .ok_or_else(|| {
                EngineError::ApiPayload("account info missing user_data".to_string())
            })?;
        Ok(KeyStatus {
            email: user_data
                .get("email")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            balance: user_data
                .get("balance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            active: truthy(user_data.get("is_active")),
        })
    }

    fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = self.endpoint_url(path, params)?;
        let auth = format!("Bearer {}", self.token);
        let mut response = self
            .agent
            .get(url.as_str())
            .header("Authorization", auth.as_str())
            .header("Accept", "application/json")
            .call()
            .map_err(|err| {
                EngineError::ApiRequest(format!(
                    "request failed for {}: {err}",
                    redact_url_for_log(url.as_str())
                ))
            })?;

        let status = response.status().as_u16();
        let mut body = String::new();
        response
            .body_mut()
            .as_reader()
            .take(MAX_BODY_BYTES)
            .read_to_string(&mut body)?;

        if status >= 400 {
            return Err(EngineError::ApiStatus {
                status,
                message: error_message_from_body(&body),
            });
        }
        if body.trim().is_empty() {
            return Err(EngineError::ApiPayload(format!(
                "empty body for {}",
                redact_url_for_log(url.as_str())
            )));
        }
        serde_json::from_str(&body).map_err(|err| {
            EngineError::ApiPayload(format!(
                "invalid json for {}: {err}",
                redact_url_for_log(url.as_str())
            ))
        })
    }

    fn endpoint_url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| EngineError::ApiRequest(format!("invalid endpoint url: {e}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

fn normalize_reference(reference: &str) -> Result<String> {
    let extracted =
        share_url_from_text(reference).unwrap_or_else(|| reference.trim().to_string());
    if extracted.is_empty() {
        return Err(EngineError::SourceUnresolved(
            "empty reference".to_string(),
        ));
    }
    Ok(extracted)
}

/// First http(s) link inside a pasted share blob, if any. Share sheets wrap
/// the link in promo text and trailing punctuation.
pub fn share_url_from_text(text: &str) -> Option<String> {
    let re = Regex::new(r#"https?://[^\s<>"']+"#).expect("share url regex");
    re.find(text).map(|m| {
        m.as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | '）' | '。'))
            .to_string()
    })
}

/// One reference per non-empty line, in input order, duplicates kept.
pub fn parse_reference_lines(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| share_url_from_text(line).unwrap_or_else(|| line.to_string()))
        .collect()
}

/// Maps one raw post object to a record. Items without an id are dropped,
/// matching what the feed actually returns for withdrawn posts.
fn clean_post(raw: &Value) -> Option<PostRecord> {
    let item = raw.get("aweme_detail").unwrap_or(raw);
    let id = string_field(item, "aweme_id")?;

    let video = item.get("video");
    let media_url = video
        .and_then(|v| v.get("play_addr"))
        .map(url_list)
        .and_then(|urls| urls.into_iter().next())
        .unwrap_or_default();
    let has_images = item
        .get("images")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    let kind = if media_url.is_empty() && has_images {
        PostKind::Album
    } else {
        PostKind::Video
    };

    let music_url = item
        .get("music")
        .and_then(|m| m.get("play_url"))
        .map(url_list)
        .and_then(|urls| urls.into_iter().next());

    let statistics = item.get("statistics");

    Some(PostRecord {
        id,
        posted_at_ms: item
            .get("create_time")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .saturating_mul(1000),
        description: item
            .get("desc")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        author: item
            .get("author")
            .and_then(|a| a.get("nickname"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        cover_url: pick_cover(item),
        share_url: item
            .get("share_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        media_url,
        music_url,
        kind,
        likes: stat_count(statistics, "digg_count"),
        comments: stat_count(statistics, "comment_count"),
        shares: stat_count(statistics, "share_count"),
    })
}

/// Cover candidates in display preference order: the first album image,
/// then the still, animated and original covers. iOS uploads fill the
/// lists with HEIC variants most clients cannot show, so the first
/// non-HEIC/HEIF url wins.
fn pick_cover(item: &Value) -> String {
    let video = item.get("video");
    let mut candidates: Vec<&Value> = Vec::new();
    if let Some(first_image) = item
        .get("images")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
    {
        candidates.push(first_image);
    }
    for key in ["cover", "dynamic_cover", "origin_cover"] {
        if let Some(obj) = video.and_then(|v| v.get(key)) {
            candidates.push(obj);
        }
    }

    for candidate in candidates {
        for url in url_list(candidate) {
            let lower = url.to_ascii_lowercase();
            if !lower.contains(".heic") && !lower.contains(".heif") {
                return url;
            }
        }
    }

    COVER_PLACEHOLDER.to_string()
}

fn page_from_value(body: &Value) -> Result<FeedPage> {
    let data = body
        .get("data")
        .ok_or_else(|| EngineError::ApiPayload("page response missing data".to_string()))?;
    let records = data
        .get("aweme_list")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(clean_post).collect())
        .unwrap_or_default();
    Ok(FeedPage {
        records,
        cursor: cursor_string(data.get("max_cursor")),
        has_more: truthy(data.get("has_more")),
    })
}

/// The feed reports its cursor as a large integer; it is carried as an
/// opaque string so nothing downstream does arithmetic on it.
fn cursor_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => CURSOR_START.to_string(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "True"),
        _ => false,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn url_list(value: &Value) -> Vec<String> {
    value
        .get("url_list")
        .and_then(|v| v.as_array())
        .map(|urls| {
            urls.iter()
                .filter_map(|u| u.as_str())
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn stat_count(statistics: Option<&Value>, key: &str) -> i64 {
    statistics
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["msg", "message", "detail"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
        }
    }
    "request rejected".to_string()
}

fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(url) => {
            let scheme = url.scheme();
            let host = url.host_str().unwrap_or("unknown-host");
            format!("{scheme}://{host}/...")
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}
