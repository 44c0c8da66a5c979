//! Channel list and the persisted selection.
//!
//! The order of [`CHANNELS`] is the order clients show them in, and the
//! persisted selection is an index into it.

use crate::state::{save_selection_or_warn, SelectionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub title: String,
    /// Path segment of the audio stream, e.g. `aac-320`.
    pub stream_id: String,
    /// Numeric id used by the metadata API (`chan=`).
    pub channel_id: u32,
}

impl Channel {
    pub fn new(title: &str, stream_id: &str, channel_id: u32) -> Self {
        Self {
            title: title.to_string(),
            stream_id: stream_id.to_string(),
            channel_id,
        }
    }

    pub fn stream_url(&self, stream_base: &str) -> String {
        format!("{}{}", stream_base, self.stream_id)
    }
}

const CHANNELS: [(&str, &str, u32); 7] = [
    ("Main Mix", "aac-320", 0),
    ("Mellow Mix", "mellow-320", 1),
    ("Rock Mix", "rock-320", 2),
    ("Global Mix", "global-320", 3),
    ("Beyond...", "beyond-320", 5),
    ("Serenity", "serenity", 42),
    ("Radio 2050", "radio2050-320", 2050),
];

pub fn default_channels() -> Vec<Channel> {
    CHANNELS
        .iter()
        .map(|(title, stream_id, id)| Channel::new(title, stream_id, *id))
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel index {index} out of range (have {len} channels)")]
    OutOfRange { index: usize, len: usize },
}

pub struct ChannelRegistry {
    channels: Vec<Channel>,
    store: Arc<dyn SelectionStore>,
    /// Always a valid index into `channels`.
    current: usize,
}

impl ChannelRegistry {
    /// `channels` must not be empty.
    pub fn new(channels: Vec<Channel>, store: Arc<dyn SelectionStore>) -> Self {
        assert!(!channels.is_empty(), "channel registry needs at least one channel");
        let current = validate_index(store.load_index(), channels.len());
        Self {
            channels,
            store,
            current,
        }
    }

    pub fn with_default_channels(store: Arc<dyn SelectionStore>) -> Self {
        Self::new(default_channels(), store)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// The full list, in menu order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &Channel {
        &self.channels[self.current]
    }

    /// Selects and persists `index`.  The store is only written here; reads
    /// are served from memory.
    pub fn select(&mut self, index: usize) -> Result<&Channel, RegistryError> {
        if index >= self.channels.len() {
            return Err(RegistryError::OutOfRange {
                index,
                len: self.channels.len(),
            });
        }
        self.current = index;
        save_selection_or_warn(self.store.as_ref(), index);
        let channel = &self.channels[index];
        info!("Selected channel {} ({})", index, channel.title);
        Ok(channel)
    }
}

/// Anything absent, negative or too large falls back to the first channel.
fn validate_index(raw: Option<i64>, len: usize) -> usize {
    match raw {
        Some(raw) if raw >= 0 && (raw as usize) < len => raw as usize,
        Some(raw) => {
            debug!("Stored channel index {} out of range, using 0", raw);
            0
        }
        None => 0,
    }
}
