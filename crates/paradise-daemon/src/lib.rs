pub mod artwork;
pub mod cache;
pub mod catalog;
pub mod core;
pub mod engine;
pub mod fetcher;
pub mod mpv;
pub mod scheduler;
pub mod socket;

use artwork::Artwork;
use paradise_proto::protocol::{SongAction, SongSnapshot};

/// Outbound notifications from the player core to every connected client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    PlayStateChanged(bool),
    NowPlayingChanged(SongSnapshot),
    /// `None` means show the placeholder image.
    ArtworkChanged(Option<Artwork>),
    /// Gates share / add-to-playlist / view-online.
    SongReadyForActions(bool),
    Toast { title: String, body: String },
    /// Song page link for a share sheet or a browser.
    SongLink { action: SongAction, url: String },
    /// A WARN/ERROR log line forwarded from the tracing layer.
    Log(String),
}
