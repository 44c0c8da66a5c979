//! Audio engine seam.  The player core only talks to this trait; the mpv
//! driver is one implementation, tests use a recording fake.

use async_trait::async_trait;

/// Engine state changes, already marshaled onto the core's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Stream opened; audio not necessarily flowing yet.
    Ready,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Error(String),
}

#[async_trait]
pub trait AudioEngine: Send + Sync {
    async fn play(&self, url: &str) -> anyhow::Result<()>;
    async fn pause(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    /// Tear down and rebuild the backend after a fatal error.
    async fn reinitialize(&self) -> anyhow::Result<()>;
    async fn is_playing(&self) -> bool;
}
