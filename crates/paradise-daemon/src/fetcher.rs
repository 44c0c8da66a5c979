//! Now-playing metadata client.
//!
//! Two endpoints per channel:
//!
//! - quick (`now_playing`): low latency, tells whether a song or a break is on
//!   and how many seconds until the next change.  Cover URLs are absolute.
//!   Never carries a song id.
//! - detail (`nowplaying_list_v2022`, `list_num=1`): the stable song id.  Cover
//!   paths are relative to the image host.  Only a single-entry list is
//!   usable.
//!
//! Both calls are one-shot.  Retry policy lives in the player core.

use async_trait::async_trait;
use paradise_proto::channels::Channel;
use paradise_proto::config::ApiConfig;
use paradise_proto::protocol::SongSnapshot;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// Network unreachable, timeout, non-success status.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed or unexpected JSON shape.
    #[error("malformed payload: {0}")]
    Parse(String),
    /// Detail endpoint returned zero or several songs.
    #[error("detail endpoint returned {0} song entries, expected exactly one")]
    Ambiguous(usize),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Parse(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Parse(e.to_string())
    }
}

/// Result of a quick poll.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPoll {
    /// `None` during a break (no artist and no title).
    pub snapshot: Option<SongSnapshot>,
    /// Server-advertised seconds until the next change, clamped to >= 0.
    pub next_poll_secs: f64,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_current(&self, channel: &Channel) -> Result<CurrentPoll, FetchError>;
    async fn fetch_details(&self, channel: &Channel) -> Result<SongSnapshot, FetchError>;
}

// ── wire payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QuickPayload {
    #[serde(default, deserialize_with = "lenient_f64")]
    time: Option<f64>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    cover: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailPayload {
    song: Vec<DetailSong>,
}

#[derive(Debug, Deserialize)]
struct DetailSong {
    #[serde(default, deserialize_with = "lenient_string")]
    song_id: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    cover: Option<String>,
}

/// Accepts `12.5`, `12` or `"12.5"`.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Accepts `"1234"` or `1234`; empty strings become `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ── parsing ───────────────────────────────────────────────────────────────────

pub fn parse_current(body: &[u8]) -> Result<CurrentPoll, FetchError> {
    let payload: QuickPayload = serde_json::from_slice(body)?;

    let time = payload
        .time
        .filter(|t| t.is_finite())
        .ok_or_else(|| FetchError::Parse("missing or invalid `time`".to_string()))?;

    let artist = payload.artist.unwrap_or_default();
    let title = payload.title.unwrap_or_default();
    let snapshot = if artist.is_empty() && title.is_empty() {
        None
    } else {
        Some(SongSnapshot::new(artist, title).with_cover(payload.cover.unwrap_or_default()))
    };

    Ok(CurrentPoll {
        snapshot,
        next_poll_secs: time.max(0.0),
    })
}

pub fn parse_details(body: &[u8], image_host: &Url) -> Result<SongSnapshot, FetchError> {
    let payload: DetailPayload = serde_json::from_slice(body)?;

    let mut songs = payload.song;
    if songs.len() != 1 {
        return Err(FetchError::Ambiguous(songs.len()));
    }
    let song = songs.remove(0);

    let cover = match song.cover.as_deref() {
        Some(path) if !path.is_empty() => qualify_cover(image_host, path)?,
        _ => String::new(),
    };

    Ok(
        SongSnapshot::new(song.artist.unwrap_or_default(), song.title.unwrap_or_default())
            .with_song_id(song.song_id.unwrap_or_default())
            .with_cover(cover),
    )
}

/// Joins a relative cover path onto the image host.  Already-absolute URLs are
/// kept as they are.
pub fn qualify_cover(image_host: &Url, path: &str) -> Result<String, FetchError> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Ok(path.to_string());
    }
    image_host
        .join(path.trim_start_matches('/'))
        .map(|u| u.to_string())
        .map_err(|e| FetchError::Parse(format!("bad cover path {:?}: {}", path, e)))
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct MetadataFetcher {
    client: reqwest::Client,
    now_playing_url: String,
    details_url: String,
    image_host: Url,
    player_id: String,
}

impl MetadataFetcher {
    pub fn new(client: reqwest::Client, api: &ApiConfig) -> anyhow::Result<Self> {
        let mut host = api.image_host.clone();
        if !host.ends_with('/') {
            host.push('/');
        }
        Ok(Self {
            client,
            now_playing_url: api.now_playing_url.clone(),
            details_url: api.details_url.clone(),
            image_host: Url::parse(&host)?,
            player_id: api.player_id.clone(),
        })
    }

    pub fn build_client(api: &ApiConfig) -> anyhow::Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .user_agent(concat!("paradise-daemon/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(api.request_timeout_secs))
            .build()?)
    }

    async fn get_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).query(query).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Transport(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl MetadataSource for MetadataFetcher {
    async fn fetch_current(&self, channel: &Channel) -> Result<CurrentPoll, FetchError> {
        let query = [
            ("chan", channel.channel_id.to_string()),
            ("player_id", self.player_id.clone()),
        ];
        let body = self.get_bytes(&self.now_playing_url, &query).await?;
        let poll = parse_current(&body)?;
        debug!(
            "quick poll chan={} song={:?} next={}s",
            channel.channel_id,
            poll.snapshot.as_ref().map(|s| s.display()),
            poll.next_poll_secs
        );
        Ok(poll)
    }

    async fn fetch_details(&self, channel: &Channel) -> Result<SongSnapshot, FetchError> {
        let query = [
            ("chan", channel.channel_id.to_string()),
            ("list_num", "1".to_string()),
            ("player_id", self.player_id.clone()),
        ];
        let body = self.get_bytes(&self.details_url, &query).await?;
        let snapshot = parse_details(&body, &self.image_host)?;
        debug!(
            "detail poll chan={} song_id={:?}",
            channel.channel_id, snapshot.song_id
        );
        Ok(snapshot)
    }
}
