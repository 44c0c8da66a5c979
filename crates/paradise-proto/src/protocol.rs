use crate::channels::Channel;
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 2;

/// Largest frame body either side accepts.  A longer length header means the
/// stream is out of sync and the connection is dropped.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Commands sent from a client (menu UI, media-remote bridge) to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    Pause,
    TogglePlayPause,
    SwitchChannel { index: usize },
    Stop,
    GetState,
    /// Look the current song up in the music catalog and add it to the
    /// user's playlist.
    AddToPlaylist,
    /// Ask for the song page link to hand to a share sheet.
    Share,
    /// Ask for the song page link to open in a browser.
    ViewOnline,
}

/// What a client should do with a [`Broadcast::SongLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SongAction {
    Share,
    ViewOnline,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full status.
    Hello {
        protocol_version: u32,
        status: PlayerStatus,
        /// Channel menu, in selection-index order.
        #[serde(default)]
        channels: Vec<Channel>,
    },
    Status {
        data: PlayerStatus,
    },
    PlayState {
        is_playing: bool,
    },
    NowPlaying {
        snapshot: SongSnapshot,
    },
    /// `url` is `None` when the display should fall back to the placeholder image.
    Artwork {
        url: Option<String>,
        width: u32,
        height: u32,
    },
    SongReady {
        ready: bool,
    },
    Toast {
        title: String,
        body: String,
    },
    /// Answer to `Share` / `ViewOnline`.
    SongLink {
        action: SongAction,
        url: String,
    },
    Log {
        message: String,
    },
}

/// What is known about the song on air.
///
/// Either a real song, a break/interstitial (everything empty) or "no info yet"
/// (also everything empty).  Snapshots are replaced wholesale; fields are never
/// patched after construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SongSnapshot {
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub song_id: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
}

impl SongSnapshot {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            song_id: None,
            cover_url: None,
        }
    }

    pub fn with_song_id(mut self, song_id: impl Into<String>) -> Self {
        let id = song_id.into();
        self.song_id = if id.is_empty() { None } else { Some(id) };
        self
    }

    pub fn with_cover(mut self, cover_url: impl Into<String>) -> Self {
        let url = cover_url.into();
        self.cover_url = if url.is_empty() { None } else { Some(url) };
        self
    }

    /// No artist and no title: a break, or nothing known yet.
    pub fn is_empty(&self) -> bool {
        self.artist.is_empty() && self.title.is_empty()
    }

    /// Two snapshots are the same song only when both carry the same id.
    /// An unknown id never matches anything, including another unknown id.
    pub fn same_song(&self, other: &SongSnapshot) -> bool {
        match (&self.song_id, &other.song_id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// "Title - Artist", the way the status line shows it.
    pub fn display(&self) -> String {
        match (self.title.is_empty(), self.artist.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.title.clone(),
            (true, false) => self.artist.clone(),
            (false, false) => format!("{} - {}", self.title, self.artist),
        }
    }

    /// Link for the share / "view online" affordances.
    pub fn song_page_url(&self, song_page_base: &str) -> Option<String> {
        self.song_id
            .as_ref()
            .map(|id| format!("{}{}", song_page_base, id))
    }
}

/// Playback state machine phase.  Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackPhase {
    #[default]
    Stopped,
    Starting,
    Playing,
    Buffering,
    /// Paused for less than the degrade delay; real song data still shown.
    PausedRecent,
    /// Paused long enough that the display shows the channel placeholder.
    PausedDegraded,
    /// Engine failed; a reinit + replay is scheduled.
    ErrorRecovering,
}

impl PlaybackPhase {
    /// What the play/pause button should show.
    pub fn is_playing(self) -> bool {
        matches!(
            self,
            PlaybackPhase::Starting | PlaybackPhase::Playing | PlaybackPhase::Buffering
        )
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            PlaybackPhase::PausedRecent | PlaybackPhase::PausedDegraded
        )
    }
}

/// Full status as mirrored for clients.  `rev` increments on every change so
/// clients can detect missed updates and request a resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStatus {
    #[serde(default)]
    pub rev: u64,
    pub phase: PlaybackPhase,
    pub channel_index: usize,
    pub channel_title: String,
    pub snapshot: SongSnapshot,
    pub is_playing: bool,
    pub song_ready: bool,
    #[serde(default)]
    pub artwork_url: Option<String>,
    /// Share / "view online" link, once the song id is confirmed.
    #[serde(default)]
    pub song_page_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Unrecoverable: the reader cannot find the next frame boundary.
    #[error("frame of {0} bytes exceeds the {} byte limit", MAX_FRAME_LEN)]
    TooLarge(usize),
    /// A complete frame whose body is not a valid message.  `consumed` bytes
    /// can be skipped to reach the next frame.
    #[error("malformed frame: {source}")]
    Malformed {
        consumed: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decodes one frame from the front of `data`.
    ///
    /// `Ok(None)` means more bytes are needed.  On success the second value is
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, DecodeError> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::TooLarge(len));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Ok(Some((msg, 4 + len))),
            Err(source) => Err(DecodeError::Malformed {
                consumed: 4 + len,
                source,
            }),
        }
    }
}
