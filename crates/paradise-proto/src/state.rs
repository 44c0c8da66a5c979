use crate::protocol::{PlaybackPhase, PlayerStatus, SongSnapshot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::warn;

/// What survives a restart.  Kept as a raw integer so a hand-edited or stale
/// file can hold anything; the channel registry validates it on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub selected_channel: Option<i64>,
}

/// Narrow read/write access to the persisted channel selection.
pub trait SelectionStore: Send + Sync {
    fn load_index(&self) -> Option<i64>;
    fn save_index(&self, index: usize) -> anyhow::Result<()>;
}

/// JSON state file, e.g. `~/.local/share/paradise/state.json`.
pub struct FileSelectionStore {
    state_file: PathBuf,
}

impl FileSelectionStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    fn load_persistent(&self) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(&self.state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}

impl SelectionStore for FileSelectionStore {
    fn load_index(&self) -> Option<i64> {
        self.load_persistent().selected_channel
    }

    fn save_index(&self, index: usize) -> anyhow::Result<()> {
        let mut persistent = self.load_persistent();
        persistent.selected_channel = Some(index as i64);

        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&persistent)?;
        std::fs::write(&self.state_file, json)?;
        Ok(())
    }
}

/// In-memory store for tests and for running without a writable data dir.
#[derive(Default)]
pub struct MemorySelectionStore {
    index: Mutex<Option<i64>>,
}

impl MemorySelectionStore {
    pub fn with_raw(index: Option<i64>) -> Self {
        Self {
            index: Mutex::new(index),
        }
    }
}

impl SelectionStore for MemorySelectionStore {
    fn load_index(&self) -> Option<i64> {
        *self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save_index(&self, index: usize) -> anyhow::Result<()> {
        *self.index.lock().unwrap_or_else(|e| e.into_inner()) = Some(index as i64);
        Ok(())
    }
}

/// Read side of the player for socket clients.  Only the player core writes.
pub struct StatusBoard {
    state: Arc<RwLock<PlayerStatus>>,
}

impl StatusBoard {
    pub fn new(channel_index: usize, channel_title: String) -> Self {
        let status = PlayerStatus {
            rev: 1,
            channel_index,
            channel_title,
            ..PlayerStatus::default()
        };
        Self {
            state: Arc::new(RwLock::new(status)),
        }
    }

    pub async fn get(&self) -> PlayerStatus {
        self.state.read().await.clone()
    }

    pub async fn set_phase(&self, phase: PlaybackPhase) {
        let mut state = self.state.write().await;
        state.phase = phase;
        state.is_playing = phase.is_playing();
        state.rev += 1;
    }

    pub async fn set_channel(&self, index: usize, title: String) {
        let mut state = self.state.write().await;
        state.channel_index = index;
        state.channel_title = title;
        state.rev += 1;
    }

    pub async fn set_snapshot(&self, snapshot: SongSnapshot, song_page_url: Option<String>) {
        let mut state = self.state.write().await;
        state.snapshot = snapshot;
        state.song_page_url = song_page_url;
        state.song_ready = false;
        state.artwork_url = None;
        state.rev += 1;
    }

    pub async fn set_song_ready(&self, ready: bool) {
        let mut state = self.state.write().await;
        state.song_ready = ready;
        state.rev += 1;
    }

    pub async fn set_artwork_url(&self, url: Option<String>) {
        let mut state = self.state.write().await;
        state.artwork_url = url;
        state.rev += 1;
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(0, String::new())
    }
}

/// Best-effort persistence helper for callers that must not fail on I/O.
pub fn save_selection_or_warn(store: &dyn SelectionStore, index: usize) {
    if let Err(e) = store.save_index(index) {
        warn!("Failed to persist selected channel {}: {}", index, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_file(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("paradise-state-test-{}-{}", std::process::id(), name))
            .join("state.json")
    }

    #[test]
    fn test_file_store_persists_index() {
        let path = temp_state_file("persist");
        let store = FileSelectionStore::new(path.clone());
        assert_eq!(store.load_index(), None);

        store.save_index(4).unwrap();
        assert_eq!(store.load_index(), Some(4));
        assert_eq!(FileSelectionStore::new(path.clone()).load_index(), Some(4));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_file_store_tolerates_garbage() {
        let path = temp_state_file("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        let store = FileSelectionStore::new(path.clone());
        assert_eq!(store.load_index(), None);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_status_board_bumps_rev() {
        let board = StatusBoard::new(2, "Rock Mix".into());
        let before = board.get().await.rev;
        board.set_phase(PlaybackPhase::Playing).await;
        board
            .set_snapshot(
                SongSnapshot::new("A", "T").with_song_id("9"),
                Some("https://radioparadise.com/music/song/9".into()),
            )
            .await;
        let status = board.get().await;
        assert_eq!(status.rev, before + 2);
        assert!(status.is_playing);
        assert_eq!(status.channel_title, "Rock Mix");
        assert_eq!(status.snapshot.song_id.as_deref(), Some("9"));
        assert!(status.song_page_url.unwrap().ends_with("/9"));
    }
}
