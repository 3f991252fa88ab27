use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("no usable transcript: {0}")]
    Unavailable(String),
    #[error("access to the video is denied")]
    AccessDenied,
    #[error("video not found")]
    NotFound,
}

/// Where transcripts come from; the pipeline only ever sees plain text
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch_transcript(&self, url: &str) -> Result<String, TranscriptError>;
}

static VIDEO_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"youtube\.com/watch\?(?:[^&\s]*&)*v=([0-9A-Za-z_-]{11})").unwrap(),
        Regex::new(r"youtu\.be/([0-9A-Za-z_-]{11})").unwrap(),
        Regex::new(r"youtube\.com/(?:embed|shorts|live)/([0-9A-Za-z_-]{11})").unwrap(),
        Regex::new(r"^([0-9A-Za-z_-]{11})$").unwrap(),
    ]
});

static CAPTION_TRACKS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""captionTracks":(\[.*?\])"#).unwrap());

static TEXT_NODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<text[^>]*>(.*?)</text>").unwrap());

/// Pull the 11-character video id out of the common YouTube URL shapes
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    for pattern in VIDEO_ID_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(input) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// One entry of the player response's captionTracks array
#[derive(Deserialize)]
struct CaptionTrack {
    #[serde(rename = "baseUrl")]
    base_url: String,
    #[serde(rename = "languageCode")]
    language_code: String,
}

fn parse_caption_tracks(page: &str) -> Result<Vec<CaptionTrack>, TranscriptError> {
    let captures = CAPTION_TRACKS_PATTERN
        .captures(page)
        .ok_or_else(|| TranscriptError::Unavailable("no caption tracks on the page".to_string()))?;

    serde_json::from_str(&captures[1])
        .map_err(|e| TranscriptError::Unavailable(format!("unparseable caption tracks: {}", e)))
}

/// Prefer a native French track; otherwise ask YouTube to translate the first one
fn select_french_track(tracks: &[CaptionTrack]) -> Option<String> {
    if let Some(track) = tracks.iter().find(|t| t.language_code.starts_with("fr")) {
        debug!("📜 Native French captions found");
        return Some(track.base_url.clone());
    }
    tracks.first().map(|track| {
        debug!(
            "📜 No French captions, translating from '{}'",
            track.language_code
        );
        format!("{}&tlang=fr", track.base_url)
    })
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;#39;", "'")
        .replace("&amp;quot;", "\"")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Flatten a timedtext XML document into one plain-text transcript
fn flatten_timedtext(xml: &str) -> String {
    let pieces: Vec<String> = TEXT_NODE_PATTERN
        .captures_iter(xml)
        .map(|c| decode_entities(c[1].trim()))
        .filter(|piece| !piece.is_empty())
        .collect();
    pieces.join(" ")
}

/// Scrapes YouTube's caption tracks straight off the watch page,
/// the same way the subtitle endpoints themselves do.
pub struct YoutubeCaptionSource {
    client: reqwest::Client,
}

impl YoutubeCaptionSource {
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    async fn get_text(&self, url: &str) -> Result<(u16, String), TranscriptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TranscriptError::Unavailable(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TranscriptError::Unavailable(e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl TranscriptSource for YoutubeCaptionSource {
    async fn fetch_transcript(&self, url: &str) -> Result<String, TranscriptError> {
        let video_id = extract_video_id(url).ok_or(TranscriptError::NotFound)?;
        let watch_url = format!("https://www.youtube.com/watch?v={}", video_id);

        let (status, page) = self.get_text(&watch_url).await?;
        match status {
            401 | 403 => return Err(TranscriptError::AccessDenied),
            404 | 410 => return Err(TranscriptError::NotFound),
            s if s >= 400 => {
                return Err(TranscriptError::Unavailable(format!("watch page HTTP {}", s)))
            }
            _ => {}
        }

        let tracks = parse_caption_tracks(&page)?;
        let track_url = select_french_track(&tracks)
            .ok_or_else(|| TranscriptError::Unavailable("empty caption track list".to_string()))?;

        let (status, xml) = self.get_text(&track_url).await?;
        if status >= 400 {
            return Err(TranscriptError::Unavailable(format!("timedtext HTTP {}", status)));
        }

        let transcript = flatten_timedtext(&xml);
        if transcript.trim().is_empty() {
            return Err(TranscriptError::Unavailable("empty transcript".to_string()));
        }

        info!("📜 Transcript for {} fetched ({} chars)", video_id, transcript.len());
        Ok(transcript)
    }
}
