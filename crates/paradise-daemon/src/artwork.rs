//! Cover art fetch + decode with a small LRU in front.
//!
//! Failures are silent: the caller keeps showing the placeholder image until
//! a decoded entry exists for the current cover URL.

use crate::cache::BoundedCache;
use crate::core::PlayerEvent;
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Artwork {
    pub url: String,
    pub image: Arc<DynamicImage>,
}

impl Artwork {
    pub fn width(&self) -> u32 {
        self.image.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.image.dimensions().1
    }
}

#[async_trait]
pub trait ArtworkSource: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct HttpArtworkSource {
    client: reqwest::Client,
}

impl HttpArtworkSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtworkSource for HttpArtworkSource {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

pub struct ArtworkLoader {
    source: Arc<dyn ArtworkSource>,
    cache: Arc<BoundedCache<String, Artwork>>,
    /// URLs with a fetch running.  Kept apart from the cache so a pending
    /// fetch neither counts as a hit nor touches recency.
    in_flight: Arc<Mutex<HashSet<String>>>,
    event_tx: mpsc::Sender<PlayerEvent>,
}

impl ArtworkLoader {
    pub fn new(
        source: Arc<dyn ArtworkSource>,
        capacity: usize,
        event_tx: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            source,
            cache: Arc::new(BoundedCache::new(capacity)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            event_tx,
        }
    }

    /// Cached artwork for `url`, or `None` after making sure a fetch is
    /// running.  A completed fetch reports `PlayerEvent::ArtworkLoaded`.
    pub fn resolve(&self, url: &str) -> Option<Artwork> {
        if let Some(artwork) = self.cache.get(&url.to_string()) {
            return Some(artwork);
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(url.to_string()) {
                debug!("artwork: fetch for {} already in flight", url);
                return None;
            }
        }

        let url = url.to_string();
        let source = self.source.clone();
        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let loaded = fetch_and_decode(source.as_ref(), &url).await;
            if let Some(artwork) = &loaded {
                cache.put(url.clone(), artwork.clone());
            }
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&url);
            if let Some(artwork) = loaded {
                let _ = tx.send(PlayerEvent::ArtworkLoaded { url, artwork }).await;
            }
        });
        None
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(url)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

async fn fetch_and_decode(source: &dyn ArtworkSource, url: &str) -> Option<Artwork> {
    let bytes = match source.fetch(url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("artwork: fetch {} failed: {}", url, e);
            return None;
        }
    };
    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await;
    match decoded {
        Ok(Ok(image)) => Some(Artwork {
            url: url.to_string(),
            image: Arc::new(image),
        }),
        Ok(Err(e)) => {
            debug!("artwork: decode {} failed: {}", url, e);
            None
        }
        Err(e) => {
            debug!("artwork: decode task for {} failed: {}", url, e);
            None
        }
    }
}
