use crate::dispatch::TransferJob;
use crate::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const TRANSFER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const DOUYIN_REFERER: &str = "https://www.douyin.com/";
const MAX_TARGET_NAME_CHARS: usize = 128;

#[derive(Debug, Clone)]
pub struct SavedTransfer {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Downloads post media straight from the CDN. The CDN refuses requests
/// without a Douyin referer and a browser user agent, so both are always
/// sent. Completion of `download` is the real transfer completion; the
/// optional delay only paces back-to-back downloads on one slot.
pub struct MediaDownloader {
    agent: ureq::Agent,
    output_dir: PathBuf,
    delay_ms: u64,
}

impl MediaDownloader {
    pub fn new(output_dir: PathBuf, delay_ms: u64) -> Self {
        Self {
            agent: build_media_agent(),
            output_dir,
            delay_ms,
        }
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    pub fn download(&self, job: &TransferJob) -> Result<SavedTransfer> {
        let url = normalize_media_url(&job.source_url)?;
        std::fs::create_dir_all(&self.output_dir)?;

        let file_name = sanitize_target_name(&job.target_name);
        let dst = self.output_dir.join(&file_name);
        let tmp_path = dst.with_extension("part");

        let response = self
            .agent
            .get(url.as_str())
            .header("Referer", DOUYIN_REFERER)
            .header("Sec-Fetch-Dest", sec_fetch_dest_for(&file_name))
            .header("Sec-Fetch-Mode", "cors")
            .call()
            .map_err(|e| EngineError::TransferFailed {
                name: job.target_name.clone(),
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(EngineError::TransferFailed {
                name: job.target_name.clone(),
                reason: format!("http {status}"),
            });
        }

        let mut reader = response.into_body().into_reader();
        let mut file = std::fs::File::create(&tmp_path)?;
        let mut hasher = Sha256::new();
        let mut total = 0_u64;
        let mut buf = [0u8; 1024 * 64];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        file.flush()?;
        drop(file);

        if total == 0 {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(EngineError::TransferFailed {
                name: job.target_name.clone(),
                reason: "empty body".to_string(),
            });
        }

        std::fs::rename(&tmp_path, &dst)?;

        if self.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
        }

        Ok(SavedTransfer {
            path: dst,
            bytes: total,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

fn build_media_agent() -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .user_agent(TRANSFER_USER_AGENT);
    config.build().into()
}

fn normalize_media_url(value: &str) -> Result<Url> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput(
            "transfer source url is empty".to_string(),
        ));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| EngineError::InvalidInput(format!("invalid transfer url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(EngineError::InvalidInput(format!(
            "unsupported transfer url scheme: {other}"
        ))),
    }
}

fn sanitize_target_name(value: &str) -> String {
    let mut out = String::new();
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('_');
        }
        if out.len() >= MAX_TARGET_NAME_CHARS {
            break;
        }
    }
    let out = out.trim_matches('.').to_string();
    if out.is_empty() {
        return "media.bin".to_string();
    }
    out
}

fn sec_fetch_dest_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if [".jpg", ".jpeg", ".png", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        "image"
    } else if lower.ends_with(".mp3") {
        "audio"
    } else {
        "video"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;

    fn job(source_url: &str, target_name: &str) -> TransferJob {
        TransferJob {
            post_id: "1".to_string(),
            source_url: source_url.to_string(),
            target_name: target_name.to_string(),
        }
    }

    /// Serves exactly one canned HTTP response and returns the raw request.
    fn one_shot_server(status_line: &str, body: &[u8]) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let status_line = status_line.to_string();
        let body = body.to_vec();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).expect("read request");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let head = format!(
                "{status_line}\r\nContent-Type: video/mp4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).expect("write head");
            stream.write_all(&body).expect("write body");
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn download_streams_to_disk_and_reports_digest() {
        let (base, server) = one_shot_server("HTTP/1.1 200 OK", b"hello clip");

        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = MediaDownloader::new(dir.path().to_path_buf(), 0);
        let saved = downloader
            .download(&job(&format!("{base}/v.mp4"), "video_1.mp4"))
            .expect("download");

        assert_eq!(saved.bytes, 10);
        assert_eq!(saved.path, dir.path().join("video_1.mp4"));
        assert_eq!(
            std::fs::read(&saved.path).expect("read saved"),
            b"hello clip"
        );

        let mut hasher = Sha256::new();
        hasher.update(b"hello clip");
        assert_eq!(saved.sha256, hex::encode(hasher.finalize()));
        assert!(
            !dir.path().join("video_1.part").exists(),
            "tmp file must be renamed away"
        );

        let request = server.join().expect("server");
        assert!(request.contains("Referer: https://www.douyin.com/"));
        assert!(request.contains("Sec-Fetch-Dest: video"));
    }

    #[test]
    fn download_surfaces_http_errors_without_leftovers() {
        let (base, server) = one_shot_server("HTTP/1.1 403 Forbidden", b"");

        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = MediaDownloader::new(dir.path().to_path_buf(), 0);
        let err = downloader
            .download(&job(&format!("{base}/v.mp4"), "video_1.mp4"))
            .expect_err("must fail");

        assert!(
            err.to_string().contains("http 403"),
            "unexpected error: {err}"
        );
        assert!(!dir.path().join("video_1.mp4").exists());
        assert!(!dir.path().join("video_1.part").exists());
        let _ = server.join();
    }

    #[test]
    fn download_rejects_empty_bodies() {
        let (base, server) = one_shot_server("HTTP/1.1 200 OK", b"");

        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = MediaDownloader::new(dir.path().to_path_buf(), 0);
        let err = downloader
            .download(&job(&format!("{base}/v.mp4"), "video_1.mp4"))
            .expect_err("must fail");

        assert!(
            err.to_string().contains("empty body"),
            "unexpected error: {err}"
        );
        assert!(!dir.path().join("video_1.part").exists());
        let _ = server.join();
    }

    #[test]
    fn media_urls_must_be_http_or_https() {
        assert!(normalize_media_url("https://cdn.example.com/v.mp4").is_ok());
        assert!(normalize_media_url("http://cdn.example.com/v.mp4").is_ok());
        assert!(normalize_media_url("ftp://cdn.example.com/v.mp4").is_err());
        assert!(normalize_media_url("file:///etc/passwd").is_err());
        assert!(normalize_media_url("   ").is_err());
        assert!(normalize_media_url("IMAGE_SLIDER").is_err());
    }

    #[test]
    fn target_names_are_sanitized() {
        assert_eq!(sanitize_target_name("video_123.mp4"), "video_123.mp4");
        assert_eq!(sanitize_target_name("a b/c.mp4"), "a_b_c.mp4");
        let traversal = sanitize_target_name("../../etc/passwd");
        assert!(!traversal.contains('/'));
        assert!(!traversal.starts_with('.'));
        assert_eq!(sanitize_target_name("   "), "media.bin");
        assert_eq!(sanitize_target_name("..."), "media.bin");
    }

    #[test]
    fn fetch_dest_matches_the_file_kind() {
        assert_eq!(sec_fetch_dest_for("video_1.mp4"), "video");
        assert_eq!(sec_fetch_dest_for("cover_1.JPG"), "image");
        assert_eq!(sec_fetch_dest_for("cover_1.webp"), "image");
        assert_eq!(sec_fetch_dest_for("music_1.mp3"), "audio");
        assert_eq!(sec_fetch_dest_for("no_extension"), "video");
    }
}
