//! Catalog preload: looks the current song up in the music catalog ahead of
//! time so add-to-playlist is instant when the user reaches for it.

use crate::cache::BoundedCache;
use crate::core::PlayerEvent;
use async_trait::async_trait;
use paradise_proto::protocol::SongSnapshot;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A match in the external catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSong {
    pub catalog_id: String,
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    /// `Ok(None)` means the catalog has no match.
    async fn lookup(&self, title: &str, artist: &str) -> anyhow::Result<Option<CatalogSong>>;

    /// Adds `song` to the user's station playlist, creating it if needed.
    /// Returns the playlist name.
    async fn add_to_playlist(&self, song: &CatalogSong) -> anyhow::Result<String>;
}

/// Result of an add-to-playlist request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistOutcome {
    Added { playlist: String },
    NotFound,
    /// No catalog account connected.
    Unavailable,
    Failed(String),
}

impl PlaylistOutcome {
    /// Toast title and body for the user.
    pub fn toast(&self, title: &str, artist: &str) -> (String, String) {
        match self {
            PlaylistOutcome::Added { playlist } => (
                "Song Added".to_string(),
                format!("Added \"{}\" to \"{}\" playlist", title, playlist),
            ),
            PlaylistOutcome::NotFound => (
                "Song Not Found".to_string(),
                format!("Could not find \"{}\" by {} in the catalog", title, artist),
            ),
            PlaylistOutcome::Unavailable => (
                "Not Authorized".to_string(),
                "Connect a music catalog account to add songs to a playlist.".to_string(),
            ),
            PlaylistOutcome::Failed(reason) => (
                "Error".to_string(),
                format!("Could not add song to playlist: {}", reason),
            ),
        }
    }
}

pub fn cache_key(title: &str, artist: &str) -> String {
    format!("{}|{}", artist.to_lowercase(), title.to_lowercase())
}

pub struct SongPreloader {
    /// `None` when no catalog account is connected.
    catalog: Option<Arc<dyn CatalogService>>,
    cache: Arc<BoundedCache<String, CatalogSong>>,
    token: Option<CancellationToken>,
    event_tx: mpsc::Sender<PlayerEvent>,
}

impl SongPreloader {
    pub fn new(
        catalog: Option<Arc<dyn CatalogService>>,
        capacity: usize,
        event_tx: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            catalog,
            cache: Arc::new(BoundedCache::new(capacity)),
            token: None,
            event_tx,
        }
    }

    /// Starts a preload for `snapshot`, cancelling whatever was running.
    ///
    /// Returns `Some(ready)` when the answer is known right away, `None` when a
    /// lookup task was started; that task reports `PlayerEvent::PreloadFinished`.
    pub fn preload(&mut self, snapshot: &SongSnapshot) -> Option<bool> {
        self.cancel();

        let Some(song_id) = snapshot.song_id.clone() else {
            return Some(false);
        };
        let Some(catalog) = self.catalog.clone() else {
            // Actions stay enabled so the user can connect an account.
            return Some(true);
        };

        let key = cache_key(&snapshot.title, &snapshot.artist);
        if self.cache.get(&key).is_some() {
            debug!("catalog: {} already cached", key);
            return Some(true);
        }

        let token = CancellationToken::new();
        self.token = Some(token.clone());
        let cache = self.cache.clone();
        let tx = self.event_tx.clone();
        let title = snapshot.title.clone();
        let artist = snapshot.artist.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = catalog.lookup(&title, &artist) => result,
            };
            let ready = match result {
                Ok(Some(song)) => {
                    debug!("catalog: preloaded {} as {}", key, song.catalog_id);
                    cache.put(key, song);
                    true
                }
                Ok(None) => {
                    debug!("catalog: no match for {}", key);
                    false
                }
                Err(e) => {
                    warn!("catalog: lookup for {} failed: {}", key, e);
                    false
                }
            };
            if token.is_cancelled() {
                return;
            }
            let _ = tx.send(PlayerEvent::PreloadFinished { song_id, ready }).await;
        });
        None
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    /// Cached catalog match for a song.
    pub fn cached(&self, title: &str, artist: &str) -> Option<CatalogSong> {
        self.cache.get(&cache_key(title, artist))
    }

    /// Adds a song to the playlist, reusing the preloaded match when there is
    /// one.  The returned future owns everything it needs and can be spawned.
    pub fn add_to_playlist(
        &self,
        title: &str,
        artist: &str,
    ) -> impl Future<Output = PlaylistOutcome> + Send + 'static {
        let catalog = self.catalog.clone();
        let cache = self.cache.clone();
        let hit = self.cached(title, artist);
        let title = title.to_string();
        let artist = artist.to_string();

        async move {
            let Some(catalog) = catalog else {
                return PlaylistOutcome::Unavailable;
            };
            let song = match hit {
                Some(song) => song,
                None => match catalog.lookup(&title, &artist).await {
                    Ok(Some(song)) => {
                        cache.put(cache_key(&title, &artist), song.clone());
                        song
                    }
                    Ok(None) => return PlaylistOutcome::NotFound,
                    Err(e) => {
                        warn!("catalog: lookup for {} - {} failed: {}", artist, title, e);
                        return PlaylistOutcome::Failed(e.to_string());
                    }
                },
            };
            match catalog.add_to_playlist(&song).await {
                Ok(playlist) => {
                    debug!("catalog: added {} to {}", song.catalog_id, playlist);
                    PlaylistOutcome::Added { playlist }
                }
                Err(e) => {
                    warn!("catalog: adding {} failed: {}", song.catalog_id, e);
                    PlaylistOutcome::Failed(e.to_string())
                }
            }
        }
    }
}

impl Drop for SongPreloader {
    fn drop(&mut self) {
        self.cancel();
    }
}
