//! yt-dlp based video fetcher.

use std::path::Path;

use async_trait::async_trait;
use clip_types::{Resolution, VideoArtifact};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::run_with_cancel;
use super::{FetchError, Fetcher};

/// Videos at or under this length in portrait orientation are shorts.
const SHORT_MAX_DURATION_S: f64 = 60.0;

/// Downloads videos through the `yt-dlp` command-line tool.
pub struct YtDlpFetcher {
    binary: String,
}

impl YtDlpFetcher {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn format_spec(quality: &str) -> &'static str {
        match quality {
            "360p" => "bestvideo[height<=360]+bestaudio/best[height<=360]",
            "480p" => "bestvideo[height<=480]+bestaudio/best[height<=480]",
            "720p" => "bestvideo[height<=720]+bestaudio/best[height<=720]",
            "1440p" => "bestvideo[height<=1440]+bestaudio/best[height<=1440]",
            "2160p" => "bestvideo[height<=2160]+bestaudio/best[height<=2160]",
            _ => "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
        }
    }

    fn classify_failure(stderr: &str) -> FetchError {
        let lowered = stderr.to_lowercase();
        if lowered.contains("video unavailable") || lowered.contains("404") {
            FetchError::NotFound
        } else if lowered.contains("not available in your country")
            || lowered.contains("geo restricted")
        {
            FetchError::GeoBlocked
        } else if lowered.contains("age") && lowered.contains("restrict") {
            FetchError::AgeRestricted
        } else if lowered.contains("no space left") {
            FetchError::DiskSpace
        } else {
            FetchError::DownloadFailed(last_lines(stderr, 3))
        }
    }
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        url: &str,
        output_dir: &Path,
        quality: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoArtifact, FetchError> {
        let video_id =
            extract_video_id(url).ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| FetchError::DownloadFailed(format!("creating output dir: {e}")))?;

        let template = output_dir.join("%(id)s.%(ext)s");
        let mut command = Command::new(&self.binary);
        command
            .arg(url)
            .args(["-f", Self::format_spec(quality)])
            .args(["-o", &template.to_string_lossy()])
            .args(["--merge-output-format", "mp4"])
            .args(["--no-warnings", "--no-progress", "--print-json"]);

        info!(url = %url, video_id = %video_id, quality = %quality, "fetching video");
        let output = run_with_cancel(command, cancel)
            .await
            .map_err(|e| FetchError::DownloadFailed(format!("spawning {}: {e}", self.binary)))?
            .ok_or(FetchError::Cancelled)?;

        if !output.success() {
            return Err(Self::classify_failure(&output.stderr));
        }

        let info: Value = serde_json::from_str(output.stdout.trim()).map_err(|e| {
            FetchError::DownloadFailed(format!("unparseable yt-dlp metadata: {e}"))
        })?;

        let duration_s = info["duration"].as_f64().unwrap_or(0.0);
        let width = info["width"].as_u64().unwrap_or(0) as u32;
        let height = info["height"].as_u64().unwrap_or(0) as u32;
        let resolution = Resolution::new(width, height);

        let path = output_dir.join(format!("{video_id}.mp4"));
        let path = if path.exists() {
            path
        } else {
            // Merge can fall back to the source container.
            ["webm", "mkv"]
                .iter()
                .map(|ext| output_dir.join(format!("{video_id}.{ext}")))
                .find(|p| p.exists())
                .ok_or_else(|| {
                    FetchError::DownloadFailed("downloaded file not found".to_string())
                })?
        };

        debug!(path = %path.display(), duration_s, "fetch complete");
        Ok(VideoArtifact {
            path,
            title: info["title"].as_str().unwrap_or_default().to_string(),
            video_id,
            duration_s,
            resolution,
            is_short: url.contains("/shorts/")
                || (duration_s > 0.0 && duration_s <= SHORT_MAX_DURATION_S
                    && resolution.is_portrait()),
        })
    }
}

/// Extract the 11-character video id from the URL forms the original tool
/// accepts: `watch?v=`, `youtu.be/`, `/shorts/`, `/embed/`.
pub fn extract_video_id(url: &str) -> Option<String> {
    let candidate = if let Some(rest) = url.split_once("v=").map(|(_, rest)| rest) {
        Some(rest)
    } else {
        ["youtu.be/", "/shorts/", "/embed/"]
            .iter()
            .find_map(|marker| url.split_once(marker).map(|(_, rest)| rest))
    }?;

    let id: String = candidate
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (id.len() == 11).then_some(id)
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().rev().take(count).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_video_id_variants() {
        let id = Some("dQw4w9WgXcQ".to_string());
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            id
        );
        assert_eq!(extract_video_id("https://youtu.be/dQw4w9WgXcQ"), id);
        assert_eq!(
            extract_video_id("https://www.youtube.com/shorts/dQw4w9WgXcQ"),
            id
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ?rel=0"),
            id
        );
    }

    #[test]
    fn test_extract_video_id_rejects_garbage() {
        assert_eq!(extract_video_id("https://example.com/"), None);
        assert_eq!(extract_video_id("https://youtu.be/short"), None);
    }

    #[test]
    fn test_classify_geo_block() {
        let err =
            YtDlpFetcher::classify_failure("ERROR: this video is not available in your country");
        assert!(matches!(err, FetchError::GeoBlocked));
    }

    #[test]
    fn test_classify_age_restriction() {
        let err = YtDlpFetcher::classify_failure("ERROR: age-restricted video");
        assert!(matches!(err, FetchError::AgeRestricted));
    }

    #[test]
    fn test_classify_default_is_download_failure() {
        let err = YtDlpFetcher::classify_failure("ERROR: connection reset by peer");
        assert!(matches!(err, FetchError::DownloadFailed(_)));
    }

    #[test]
    fn test_format_spec_fallback() {
        assert!(YtDlpFetcher::format_spec("999p").contains("height<=1080"));
    }
}
