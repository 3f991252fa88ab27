use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One watched channel, keyed by channel id in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub conversation_id: String,
    pub last_video_id: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// A fresh upload spotted by the watcher
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub conversation_id: String,
    pub video_url: String,
}

/// JSON-backed map of channel subscriptions, saved whole on every change
pub struct SubscriptionStore {
    path: PathBuf,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let subscriptions = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, Subscription>>(&content) {
                Ok(map) => {
                    info!("📂 Loaded {} subscription(s) from {}", map.len(), path.display());
                    map
                }
                Err(e) => {
                    error!("❌ Corrupt subscription file {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => {
                debug!("📂 No subscription file at {}, starting empty", path.display());
                HashMap::new()
            }
        };
        Self { path, subscriptions: Mutex::new(subscriptions) }
    }

    async fn save(&self, subscriptions: &HashMap<String, Subscription>) {
        match serde_json::to_string_pretty(subscriptions) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    error!("❌ Failed to save subscriptions to {}: {}", self.path.display(), e);
                }
            }
            Err(e) => error!("❌ Failed to serialize subscriptions: {}", e),
        }
    }

    /// Returns false when the channel is already watched
    pub async fn add(&self, channel_id: &str, conversation_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(channel_id) {
            return false;
        }
        subscriptions.insert(
            channel_id.to_string(),
            Subscription {
                conversation_id: conversation_id.to_string(),
                last_video_id: None,
                added_at: Utc::now(),
            },
        );
        self.save(&subscriptions).await;
        true
    }

    pub async fn remove(&self, channel_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        let removed = subscriptions.remove(channel_id).is_some();
        if removed {
            self.save(&subscriptions).await;
        }
        removed
    }

    pub async fn list(&self) -> Vec<(String, Subscription)> {
        let subscriptions = self.subscriptions.lock().await;
        let mut entries: Vec<_> =
            subscriptions.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub async fn mark_seen(&self, channel_id: &str, video_id: &str) {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(subscription) = subscriptions.get_mut(channel_id) {
            subscription.last_video_id = Some(video_id.to_string());
            self.save(&subscriptions).await;
        }
    }
}

static FEED_VIDEO_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<yt:videoId>([0-9A-Za-z_-]{11})</yt:videoId>").unwrap());

/// Newest entry comes first in the Atom feed
fn parse_latest_video_id(feed_xml: &str) -> Option<String> {
    FEED_VIDEO_ID_PATTERN
        .captures(feed_xml)
        .map(|c| c[1].to_string())
}

async fn fetch_latest_video_id(
    client: &reqwest::Client,
    channel_id: &str,
) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
    let feed_url = format!(
        "https://www.youtube.com/feeds/videos.xml?channel_id={}",
        channel_id
    );
    let response = client.get(&feed_url).send().await?;
    if !response.status().is_success() {
        return Err(format!("feed HTTP {}", response.status().as_u16()).into());
    }
    let body = response.text().await?;
    Ok(parse_latest_video_id(&body))
}

/// Periodically polls every subscribed channel's upload feed. The first
/// sighting of a channel only records a baseline; later changes are sent
/// through `notify`. Feed failures are logged and skipped, never fatal.
pub fn spawn_watcher(
    store: Arc<SubscriptionStore>,
    client: reqwest::Client,
    interval: Duration,
    notify: UnboundedSender<NewVideo>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (channel_id, subscription) in store.list().await {
                match fetch_latest_video_id(&client, &channel_id).await {
                    Ok(Some(video_id)) => {
                        if subscription.last_video_id.as_deref() == Some(video_id.as_str()) {
                            continue;
                        }
                        store.mark_seen(&channel_id, &video_id).await;
                        if subscription.last_video_id.is_none() {
                            debug!("👀 Baseline for {}: {}", channel_id, video_id);
                            continue;
                        }
                        info!("🆕 New upload on {}: {}", channel_id, video_id);
                        let event = NewVideo {
                            conversation_id: subscription.conversation_id.clone(),
                            video_url: format!("https://www.youtube.com/watch?v={}", video_id),
                        };
                        if notify.send(event).is_err() {
                            // receiver gone, the bot is shutting down
                            return;
                        }
                    }
                    Ok(None) => warn!("⚠️ Feed for {} lists no videos", channel_id),
                    Err(e) => warn!("⚠️ Feed check for {} failed: {}", channel_id, e),
                }
            }
        }
    })
}
