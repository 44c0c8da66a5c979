use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Start playing the selected channel as soon as the daemon is up.
    #[serde(default = "default_autoplay")]
    pub autoplay: bool,
    /// Shown as the artist of the degraded "paused too long" placeholder.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

/// Remote endpoints.  Channel-specific query parameters are appended by the
/// fetcher, so these are bare URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_now_playing_url")]
    pub now_playing_url: String,
    #[serde(default = "default_details_url")]
    pub details_url: String,
    /// Prefix for the relative cover paths returned by the detail endpoint.
    #[serde(default = "default_image_host")]
    pub image_host: String,
    #[serde(default = "default_stream_base")]
    pub stream_base: String,
    #[serde(default = "default_song_page_base")]
    pub song_page_base: String,
    #[serde(default = "default_player_id")]
    pub player_id: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_song_capacity")]
    pub song_capacity: usize,
    #[serde(default = "default_artwork_capacity")]
    pub artwork_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            autoplay: default_autoplay(),
            service_name: default_service_name(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            now_playing_url: default_now_playing_url(),
            details_url: default_details_url(),
            image_host: default_image_host(),
            stream_base: default_stream_base(),
            song_page_base: default_song_page_base(),
            player_id: default_player_id(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            song_capacity: default_song_capacity(),
            artwork_capacity: default_artwork_capacity(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_autoplay() -> bool {
    true
}

fn default_service_name() -> String {
    "Radio Paradise".to_string()
}

fn default_now_playing_url() -> String {
    "https://api.radioparadise.com/api/now_playing".to_string()
}

fn default_details_url() -> String {
    "https://api.radioparadise.com/api/nowplaying_list_v2022".to_string()
}

fn default_image_host() -> String {
    "https://img.radioparadise.com/".to_string()
}

fn default_stream_base() -> String {
    "http://stream.radioparadise.com/".to_string()
}

fn default_song_page_base() -> String {
    "https://radioparadise.com/music/song/".to_string()
}

fn default_player_id() -> String {
    "paradise-daemon".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9797
}

fn default_volume() -> f32 {
    0.8
}

fn default_song_capacity() -> usize {
    100
}

fn default_artwork_capacity() -> usize {
    3
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
