/// PlayerCore: single-owner event loop for all playback and now-playing state.
///
/// Every input (client commands, audio engine events, timer firings, fetch
/// completions) arrives as a `PlayerEvent` on one mpsc channel and is handled
/// to completion before the next one.  PlayerCore owns the phase, the current
/// snapshot, the channel-switch guard and every timer slot; nothing else
/// mutates them, so no locks are needed here.
///
/// Network work runs in spawned tasks that report back through the same
/// channel.  Each fetch carries the `epoch` it was started under; switching
/// channel, degrading or stopping bumps the epoch, so a late answer from the
/// previous context is dropped instead of overwriting the new one.
use std::ops::ControlFlow;
use std::sync::Arc;

use paradise_proto::channels::{Channel, ChannelRegistry};
use paradise_proto::config::Config;
use paradise_proto::protocol::{Command, PlaybackPhase, SongAction, SongSnapshot};
use paradise_proto::state::StatusBoard;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artwork::{Artwork, ArtworkLoader, ArtworkSource};
use crate::catalog::{CatalogService, SongPreloader};
use crate::engine::{AudioEngine, EngineEvent};
use crate::fetcher::{CurrentPoll, FetchError, MetadataSource};
use crate::scheduler::{
    Scheduler, TimerFired, TimerSlot, ENGINE_RECOVERY_DELAY, PAUSE_DEGRADE_DELAY,
    SWITCH_SETTLE_DELAY,
};
use crate::BroadcastMessage;

// ── PlayerEvent ───────────────────────────────────────────────────────────────

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum PlayerEvent {
    /// A command from a socket client or from startup wiring.
    Command(Command),
    /// Audio engine state change, marshaled from the engine's own task.
    Engine(EngineEvent),
    Timer(TimerFired),
    CurrentFetched {
        epoch: u64,
        result: Result<CurrentPoll, FetchError>,
    },
    DetailsFetched {
        epoch: u64,
        result: Result<SongSnapshot, FetchError>,
    },
    ArtworkLoaded {
        url: String,
        artwork: Artwork,
    },
    PreloadFinished {
        song_id: String,
        ready: bool,
    },
    Shutdown,
}

/// External collaborators, injected at construction.
pub struct Collaborators {
    pub engine: Arc<dyn AudioEngine>,
    pub metadata: Arc<dyn MetadataSource>,
    pub artwork: Arc<dyn ArtworkSource>,
    /// `None` when no catalog account is connected.
    pub catalog: Option<Arc<dyn CatalogService>>,
}

// ── PlayerCore ────────────────────────────────────────────────────────────────

pub struct PlayerCore {
    registry: ChannelRegistry,
    engine: Arc<dyn AudioEngine>,
    metadata: Arc<dyn MetadataSource>,
    artwork: ArtworkLoader,
    preloader: SongPreloader,
    scheduler: Scheduler,
    status: Arc<StatusBoard>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    event_tx: mpsc::Sender<PlayerEvent>,
    service_name: String,
    stream_base: String,
    song_page_base: String,
    phase: PlaybackPhase,
    snapshot: SongSnapshot,
    /// True from a channel switch until the engine confirms the new stream.
    switch_guard: bool,
    epoch: u64,
    /// Cancels the in-flight quick/detail fetch pair.
    poll_token: Option<CancellationToken>,
    /// Last play state sent to clients (to avoid redundant broadcasts).
    last_is_playing: bool,
}

impl PlayerCore {
    pub fn new(
        config: &Config,
        registry: ChannelRegistry,
        collaborators: Collaborators,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        let status = Arc::new(StatusBoard::new(
            registry.current_index(),
            registry.current().title.clone(),
        ));
        let artwork = ArtworkLoader::new(
            collaborators.artwork,
            config.cache.artwork_capacity,
            event_tx.clone(),
        );
        let preloader = SongPreloader::new(
            collaborators.catalog,
            config.cache.song_capacity,
            event_tx.clone(),
        );

        Self {
            registry,
            engine: collaborators.engine,
            metadata: collaborators.metadata,
            artwork,
            preloader,
            scheduler: Scheduler::new(event_tx.clone()),
            status,
            broadcast_tx,
            event_tx,
            service_name: config.daemon.service_name.clone(),
            stream_base: config.api.stream_base.clone(),
            song_page_base: config.api.song_page_base.clone(),
            phase: PlaybackPhase::Stopped,
            snapshot: SongSnapshot::default(),
            switch_guard: false,
            epoch: 0,
            poll_token: None,
            last_is_playing: false,
        }
    }

    /// Read side for the socket server.
    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn snapshot(&self) -> &SongSnapshot {
        &self.snapshot
    }

    pub fn switch_guard(&self) -> bool {
        self.switch_guard
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run the event loop.  Returns on `Shutdown` or when every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<PlayerEvent>) -> anyhow::Result<()> {
        info!("PlayerCore: starting event loop");

        while let Some(evt) = event_rx.recv().await {
            if self.handle_event(evt).await.is_break() {
                info!("PlayerCore: shutdown requested");
                break;
            }
        }

        self.cleanup().await;
        Ok(())
    }

    pub async fn handle_event(&mut self, evt: PlayerEvent) -> ControlFlow<()> {
        match evt {
            PlayerEvent::Shutdown => return ControlFlow::Break(()),
            PlayerEvent::Command(cmd) => {
                info!("PlayerCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            PlayerEvent::Engine(evt) => self.handle_engine_event(evt).await,
            PlayerEvent::Timer(fired) => {
                if self.scheduler.take_fired(fired) {
                    self.handle_timer(fired.slot).await;
                }
            }
            PlayerEvent::CurrentFetched { epoch, result } => {
                self.on_current_fetched(epoch, result).await;
            }
            PlayerEvent::DetailsFetched { epoch, result } => {
                self.on_details_fetched(epoch, result).await;
            }
            PlayerEvent::ArtworkLoaded { url, artwork } => {
                if self.snapshot.cover_url.as_deref() == Some(url.as_str()) {
                    self.publish_artwork(Some(artwork)).await;
                } else {
                    debug!("PlayerCore: artwork for {} arrived after song changed", url);
                }
            }
            PlayerEvent::PreloadFinished { song_id, ready } => {
                if self.snapshot.song_id.as_deref() == Some(song_id.as_str()) {
                    self.set_song_ready(ready).await;
                } else {
                    debug!("PlayerCore: preload for {} is stale", song_id);
                }
            }
        }
        ControlFlow::Continue(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play => self.play().await,
            Command::Pause => self.pause().await,
            Command::TogglePlayPause => {
                if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Buffering) {
                    self.pause().await;
                } else {
                    self.play().await;
                }
            }
            Command::SwitchChannel { index } => self.switch_channel(index).await,
            Command::Stop => self.stop().await,
            // The socket answers with a Status frame after every command.
            Command::GetState => {}
            Command::AddToPlaylist => self.add_to_playlist(),
            Command::Share => self.send_song_link(SongAction::Share),
            Command::ViewOnline => self.send_song_link(SongAction::ViewOnline),
        }
    }

    async fn play(&mut self) {
        if self.switch_guard && self.scheduler.is_armed(TimerSlot::SwitchSettle) {
            debug!("PlayerCore: play already scheduled after channel switch");
            return;
        }
        self.scheduler.cancel(TimerSlot::PauseDegrade);
        self.scheduler.cancel(TimerSlot::EngineRecovery);
        self.scheduler.cancel(TimerSlot::SwitchSettle);

        // The placeholder is discarded, not swapped back: the real song may
        // have changed while we were paused, so the poll below refills it.
        if self.phase == PlaybackPhase::PausedDegraded {
            self.replace_snapshot(SongSnapshot::default()).await;
        }

        let channel = self.registry.current().clone();
        let url = channel.stream_url(&self.stream_base);
        self.set_phase(PlaybackPhase::Starting).await;
        info!("PlayerCore: play {} ({})", channel.title, url);

        if let Err(e) = self.engine.play(&url).await {
            self.enter_error_recovery(&e.to_string()).await;
            return;
        }
        self.trigger_poll();
    }

    async fn pause(&mut self) {
        if !matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Buffering) {
            debug!("PlayerCore: pause ignored in {:?}", self.phase);
            return;
        }
        if let Err(e) = self.engine.pause().await {
            warn!("PlayerCore: engine pause failed: {}", e);
        }
        self.enter_paused_recent().await;
    }

    async fn switch_channel(&mut self, index: usize) {
        let channel = match self.registry.select(index) {
            Ok(channel) => channel.clone(),
            Err(e) => {
                warn!("PlayerCore: {}", e);
                return;
            }
        };
        info!("PlayerCore: switching to channel {} ({})", index, channel.title);

        self.switch_guard = true;
        self.scheduler.cancel_all();
        self.cancel_poll();
        self.preloader.cancel();
        self.epoch += 1;

        self.set_phase(PlaybackPhase::Stopped).await;
        if let Err(e) = self.engine.stop().await {
            warn!("PlayerCore: engine stop failed: {}", e);
        }
        self.replace_snapshot(SongSnapshot::default()).await;
        self.status.set_channel(index, channel.title.clone()).await;
        self.toast("Channel Changed", format!("Now playing {}", channel.title));

        // The engine tears down asynchronously; starting the new stream
        // before that finishes can leave it hung.
        self.scheduler.arm(TimerSlot::SwitchSettle, SWITCH_SETTLE_DELAY);
    }

    async fn stop(&mut self) {
        self.scheduler.cancel_all();
        self.cancel_poll();
        self.preloader.cancel();
        self.epoch += 1;
        self.switch_guard = false;

        if let Err(e) = self.engine.stop().await {
            warn!("PlayerCore: engine stop failed: {}", e);
        }
        self.set_phase(PlaybackPhase::Stopped).await;
    }

    // ── engine events ─────────────────────────────────────────────────────────

    async fn handle_engine_event(&mut self, evt: EngineEvent) {
        debug!("PlayerCore: engine {:?} in {:?}", evt, self.phase);
        match evt {
            EngineEvent::Ready => {
                if self.phase == PlaybackPhase::Starting {
                    self.clear_switch_guard();
                }
            }
            EngineEvent::Buffering => {
                if matches!(self.phase, PlaybackPhase::Starting | PlaybackPhase::Playing) {
                    self.clear_switch_guard();
                    self.set_phase(PlaybackPhase::Buffering).await;
                }
            }
            EngineEvent::Playing => match self.phase {
                PlaybackPhase::Starting | PlaybackPhase::Buffering => {
                    self.clear_switch_guard();
                    self.set_phase(PlaybackPhase::Playing).await;
                }
                PlaybackPhase::ErrorRecovering => {
                    info!("PlayerCore: engine recovered on its own");
                    self.scheduler.cancel(TimerSlot::EngineRecovery);
                    self.set_phase(PlaybackPhase::Playing).await;
                }
                PlaybackPhase::PausedRecent | PlaybackPhase::PausedDegraded => {
                    self.resume_from_engine().await;
                }
                PlaybackPhase::Playing | PlaybackPhase::Stopped => {}
            },
            EngineEvent::Paused | EngineEvent::Stopped => {
                // Tearing down the old stream looks like a pause; it is not one.
                if self.switch_guard {
                    debug!("PlayerCore: {:?} ignored during channel switch", evt);
                    return;
                }
                if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Buffering) {
                    info!("PlayerCore: engine reported {:?}, treating as pause", evt);
                    self.enter_paused_recent().await;
                }
            }
            EngineEvent::Error(reason) => {
                if self.phase == PlaybackPhase::Stopped || self.phase.is_paused() {
                    debug!("PlayerCore: engine error while idle ignored: {}", reason);
                } else {
                    self.enter_error_recovery(&reason).await;
                }
            }
        }
    }

    /// The engine resumed by itself (media key, output device came back).
    /// Same bookkeeping as `play()` minus telling the engine to play.
    async fn resume_from_engine(&mut self) {
        self.scheduler.cancel(TimerSlot::PauseDegrade);
        if self.phase == PlaybackPhase::PausedDegraded {
            self.replace_snapshot(SongSnapshot::default()).await;
        }
        self.set_phase(PlaybackPhase::Playing).await;
        self.trigger_poll();
    }

    async fn enter_paused_recent(&mut self) {
        self.set_phase(PlaybackPhase::PausedRecent).await;
        if self.switch_guard {
            return;
        }
        self.scheduler.arm(TimerSlot::PauseDegrade, PAUSE_DEGRADE_DELAY);
    }

    async fn enter_error_recovery(&mut self, reason: &str) {
        warn!(
            "PlayerCore: audio engine error ({}), reinitialising in {:?}",
            reason, ENGINE_RECOVERY_DELAY
        );
        self.scheduler.cancel(TimerSlot::PauseDegrade);
        self.scheduler.cancel(TimerSlot::SwitchSettle);
        self.clear_switch_guard();
        self.set_phase(PlaybackPhase::ErrorRecovering).await;
        self.scheduler.arm(TimerSlot::EngineRecovery, ENGINE_RECOVERY_DELAY);
    }

    fn clear_switch_guard(&mut self) {
        if self.switch_guard {
            self.switch_guard = false;
            info!("PlayerCore: channel switch settled");
            self.notify_play_state();
        }
    }

    // ── timers ────────────────────────────────────────────────────────────────

    async fn handle_timer(&mut self, slot: TimerSlot) {
        debug!("PlayerCore: timer {:?} fired in {:?}", slot, self.phase);
        match slot {
            TimerSlot::Update => self.trigger_poll(),
            TimerSlot::PauseDegrade => self.degrade_pause().await,
            TimerSlot::SwitchSettle => self.play().await,
            TimerSlot::EngineRecovery => {
                if self.phase != PlaybackPhase::ErrorRecovering {
                    return;
                }
                info!("PlayerCore: reinitialising audio engine");
                if let Err(e) = self.engine.reinitialize().await {
                    warn!("PlayerCore: engine reinitialise failed: {}", e);
                }
                self.play().await;
            }
        }
    }

    async fn degrade_pause(&mut self) {
        if self.switch_guard || self.phase != PlaybackPhase::PausedRecent {
            return;
        }
        if self.engine.is_playing().await {
            debug!("PlayerCore: engine is playing again, not degrading");
            return;
        }

        info!("PlayerCore: paused too long, showing channel placeholder");
        self.set_phase(PlaybackPhase::PausedDegraded).await;
        self.scheduler.cancel(TimerSlot::Update);
        self.cancel_poll();
        self.epoch += 1;

        let channel = self.registry.current().clone();
        let placeholder = SongSnapshot::new(self.service_name.clone(), channel.title);
        self.replace_snapshot(placeholder).await;
    }

    // ── polling ───────────────────────────────────────────────────────────────

    fn cancel_poll(&mut self) {
        if let Some(token) = self.poll_token.take() {
            token.cancel();
        }
    }

    /// Quick poll now, superseding any pending timer or in-flight fetch.
    fn trigger_poll(&mut self) {
        self.scheduler.cancel(TimerSlot::Update);
        self.cancel_poll();

        let token = CancellationToken::new();
        self.poll_token = Some(token.clone());
        let channel = self.registry.current().clone();
        let source = self.metadata.clone();
        let tx = self.event_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = source.fetch_current(&channel) => result,
            };
            let _ = tx.send(PlayerEvent::CurrentFetched { epoch, result }).await;
        });
    }

    fn spawn_details(&self, channel: Channel) {
        let Some(token) = self.poll_token.clone() else {
            return;
        };
        let source = self.metadata.clone();
        let tx = self.event_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = source.fetch_details(&channel) => result,
            };
            let _ = tx.send(PlayerEvent::DetailsFetched { epoch, result }).await;
        });
    }

    fn accepts_fetch(&self, epoch: u64) -> bool {
        if epoch != self.epoch {
            debug!("PlayerCore: dropping fetch from epoch {} (now {})", epoch, self.epoch);
            return false;
        }
        !matches!(
            self.phase,
            PlaybackPhase::Stopped | PlaybackPhase::PausedDegraded
        )
    }

    async fn on_current_fetched(&mut self, epoch: u64, result: Result<CurrentPoll, FetchError>) {
        if !self.accepts_fetch(epoch) {
            return;
        }

        let poll = match result {
            Ok(poll) => poll,
            Err(e) => {
                warn!("PlayerCore: quick poll failed: {}; retrying in 30s", e);
                self.scheduler.arm_retry();
                return;
            }
        };

        // Detail failures must not stall the cadence, so arm first.
        self.scheduler.arm_update(poll.next_poll_secs);
        info!(
            "PlayerCore: next poll in {:.1}s",
            self.scheduler
                .armed_delay(TimerSlot::Update)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default()
        );

        match poll.snapshot {
            None => {
                self.replace_snapshot(SongSnapshot::default()).await;
            }
            Some(quick) => {
                let merged = carry_confirmed_id(&self.snapshot, quick);
                self.replace_snapshot(merged).await;
                self.spawn_details(self.registry.current().clone());
            }
        }
    }

    async fn on_details_fetched(&mut self, epoch: u64, result: Result<SongSnapshot, FetchError>) {
        if !self.accepts_fetch(epoch) {
            return;
        }

        let details = match result {
            Ok(details) => details,
            Err(FetchError::Ambiguous(n)) => {
                debug!("PlayerCore: detail poll unusable ({} entries)", n);
                return;
            }
            Err(e) => {
                warn!("PlayerCore: detail poll failed: {}", e);
                return;
            }
        };
        if self.snapshot.is_empty() {
            debug!("PlayerCore: break started before details arrived");
            return;
        }

        match merge_details(&self.snapshot, details) {
            Some(merged) => self.replace_snapshot(merged).await,
            None => debug!(
                "PlayerCore: detail poll still describes another song, keeping {:?}",
                self.snapshot.display()
            ),
        }
    }

    // ── song actions ──────────────────────────────────────────────────────────

    /// The song the share / playlist actions apply to.  Nothing during a break
    /// or while the channel placeholder is shown.
    fn actionable_song(&self) -> Option<&SongSnapshot> {
        let song = &self.snapshot;
        if self.phase == PlaybackPhase::PausedDegraded
            || song.title.is_empty()
            || song.artist.is_empty()
        {
            return None;
        }
        Some(song)
    }

    fn toast(&self, title: &str, body: impl Into<String>) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Toast {
            title: title.to_string(),
            body: body.into(),
        });
    }

    fn add_to_playlist(&self) {
        let Some(song) = self.actionable_song() else {
            self.toast("Cannot Add Song", "No song information available");
            return;
        };
        let title = song.title.clone();
        let artist = song.artist.clone();
        info!("PlayerCore: adding {:?} to playlist", song.display());

        let task = self.preloader.add_to_playlist(&title, &artist);
        let tx = self.broadcast_tx.clone();
        tokio::spawn(async move {
            let (title, body) = task.await.toast(&title, &artist);
            let _ = tx.send(BroadcastMessage::Toast { title, body });
        });
    }

    fn send_song_link(&self, action: SongAction) {
        let url = self
            .actionable_song()
            .and_then(|song| song.song_page_url(&self.song_page_base));
        let Some(url) = url else {
            let title = match action {
                SongAction::Share => "Cannot Share Song",
                SongAction::ViewOnline => "Cannot View Song",
            };
            self.toast(title, "No song information available");
            return;
        };
        debug!("PlayerCore: {:?} link {}", action, url);
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::SongLink { action, url });
    }

    // ── snapshot + notifications ──────────────────────────────────────────────

    /// Installs `snapshot` unless it is the same song as the current one.
    /// A new song refreshes artwork and restarts the catalog preload.
    async fn replace_snapshot(&mut self, snapshot: SongSnapshot) {
        if self.snapshot.same_song(&snapshot) {
            return;
        }

        info!(
            "PlayerCore: now playing {:?} (id {:?})",
            snapshot.display(),
            snapshot.song_id
        );
        self.snapshot = snapshot.clone();
        let page = snapshot.song_page_url(&self.song_page_base);
        self.status.set_snapshot(snapshot.clone(), page).await;
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::NowPlayingChanged(snapshot.clone()));

        let artwork = snapshot
            .cover_url
            .as_deref()
            .and_then(|url| self.artwork.resolve(url));
        self.publish_artwork(artwork).await;

        let ready = self.preloader.preload(&snapshot).unwrap_or(false);
        self.set_song_ready(ready).await;
    }

    async fn publish_artwork(&mut self, artwork: Option<Artwork>) {
        self.status
            .set_artwork_url(artwork.as_ref().map(|a| a.url.clone()))
            .await;
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::ArtworkChanged(artwork));
    }

    async fn set_song_ready(&mut self, ready: bool) {
        self.status.set_song_ready(ready).await;
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::SongReadyForActions(ready));
    }

    async fn set_phase(&mut self, phase: PlaybackPhase) {
        if self.phase == phase {
            return;
        }
        info!("PlayerCore: phase {:?} → {:?}", self.phase, phase);
        self.phase = phase;
        self.status.set_phase(phase).await;
        self.notify_play_state();
    }

    /// Suppressed while switching so the play button does not flicker.
    fn notify_play_state(&mut self) {
        if self.switch_guard {
            return;
        }
        let playing = self.phase.is_playing();
        if playing != self.last_is_playing {
            self.last_is_playing = playing;
            let _ = self
                .broadcast_tx
                .send(BroadcastMessage::PlayStateChanged(playing));
        }
    }

    async fn cleanup(&mut self) {
        self.scheduler.cancel_all();
        self.cancel_poll();
        self.preloader.cancel();
        if let Err(e) = self.engine.stop().await {
            warn!("PlayerCore: engine stop on shutdown failed: {}", e);
        }
        self.set_phase(PlaybackPhase::Stopped).await;
    }
}

fn names_match(a: &SongSnapshot, b: &SongSnapshot) -> bool {
    a.artist.to_lowercase() == b.artist.to_lowercase()
        && a.title.to_lowercase() == b.title.to_lowercase()
}

/// The quick endpoint never carries an id.  If it names the song we already
/// confirmed, keep the confirmed id and cover so it stays the same song.
fn carry_confirmed_id(current: &SongSnapshot, quick: SongSnapshot) -> SongSnapshot {
    match &current.song_id {
        Some(id) if names_match(current, &quick) => {
            let cover = current.cover_url.clone().or(quick.cover_url);
            SongSnapshot::new(quick.artist, quick.title)
                .with_song_id(id.clone())
                .with_cover(cover.unwrap_or_default())
        }
        _ => quick,
    }
}

/// The quick poll decides what is on air; details only add the id and the
/// qualified cover.  Details naming a different song lag behind the feed and
/// give `None`.
fn merge_details(current: &SongSnapshot, details: SongSnapshot) -> Option<SongSnapshot> {
    if !names_match(current, &details) {
        return None;
    }
    let cover = details.cover_url.or_else(|| current.cover_url.clone());
    Some(
        SongSnapshot::new(current.artist.clone(), current.title.clone())
            .with_song_id(details.song_id.unwrap_or_default())
            .with_cover(cover.unwrap_or_default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSong;
    use crate::scheduler::{FUDGE, RETRY_DELAY};
    use async_trait::async_trait;
    use paradise_proto::state::MemorySelectionStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    // ── fakes ────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedSource {
        current: Mutex<VecDeque<Result<CurrentPoll, FetchError>>>,
        details: Mutex<VecDeque<Result<SongSnapshot, FetchError>>>,
        current_calls: AtomicUsize,
        details_calls: AtomicUsize,
        channels: Mutex<Vec<u32>>,
    }

    impl ScriptedSource {
        fn push_current(&self, result: Result<CurrentPoll, FetchError>) {
            self.current.lock().unwrap().push_back(result);
        }

        fn push_details(&self, result: Result<SongSnapshot, FetchError>) {
            self.details.lock().unwrap().push_back(result);
        }

        fn current_calls(&self) -> usize {
            self.current_calls.load(Ordering::SeqCst)
        }

        fn details_calls(&self) -> usize {
            self.details_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        async fn fetch_current(&self, channel: &Channel) -> Result<CurrentPoll, FetchError> {
            self.current_calls.fetch_add(1, Ordering::SeqCst);
            self.channels.lock().unwrap().push(channel.channel_id);
            self.current
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transport("unscripted".into())))
        }

        async fn fetch_details(&self, _channel: &Channel) -> Result<SongSnapshot, FetchError> {
            self.details_calls.fetch_add(1, Ordering::SeqCst);
            self.details
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transport("unscripted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<String>>,
        playing: AtomicBool,
        fail_play: AtomicBool,
    }

    impl RecordingEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl AudioEngine for RecordingEngine {
        async fn play(&self, url: &str) -> anyhow::Result<()> {
            self.record(format!("play {}", url));
            if self.fail_play.load(Ordering::SeqCst) {
                anyhow::bail!("no audio device");
            }
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> anyhow::Result<()> {
            self.record("pause".into());
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.record("stop".into());
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn reinitialize(&self) -> anyhow::Result<()> {
            self.record("reinitialize".into());
            Ok(())
        }

        async fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
    }

    /// Counts fetches and always fails, so no decode work races the clock.
    #[derive(Default)]
    struct CountingArtwork {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtworkSource for CountingArtwork {
        async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            self.urls.lock().unwrap().push(url.to_string());
            anyhow::bail!("offline")
        }
    }

    #[derive(Default)]
    struct CountingCatalog {
        lookups: AtomicUsize,
        added: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CatalogService for CountingCatalog {
        async fn lookup(&self, title: &str, _artist: &str) -> anyhow::Result<Option<CatalogSong>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(Some(CatalogSong {
                catalog_id: format!("cat-{}", title),
            }))
        }

        async fn add_to_playlist(&self, song: &CatalogSong) -> anyhow::Result<String> {
            self.added.lock().unwrap().push(song.catalog_id.clone());
            Ok("Radio Paradise".to_string())
        }
    }

    // ── harness ──────────────────────────────────────────────────────────────

    struct Harness {
        core: PlayerCore,
        rx: mpsc::Receiver<PlayerEvent>,
        notes: broadcast::Receiver<BroadcastMessage>,
        engine: Arc<RecordingEngine>,
        source: Arc<ScriptedSource>,
        artwork: Arc<CountingArtwork>,
        catalog: Arc<CountingCatalog>,
    }

    impl Harness {
        fn new() -> Self {
            let (event_tx, rx) = mpsc::channel(256);
            let (broadcast_tx, notes) = broadcast::channel(256);
            let engine = Arc::new(RecordingEngine::default());
            let source = Arc::new(ScriptedSource::default());
            let artwork = Arc::new(CountingArtwork::default());
            let catalog = Arc::new(CountingCatalog::default());
            let registry =
                ChannelRegistry::with_default_channels(Arc::new(MemorySelectionStore::default()));
            let core = PlayerCore::new(
                &Config::default(),
                registry,
                Collaborators {
                    engine: engine.clone(),
                    metadata: source.clone(),
                    artwork: artwork.clone(),
                    catalog: Some(catalog.clone()),
                },
                broadcast_tx,
                event_tx,
            );
            Self {
                core,
                rx,
                notes,
                engine,
                source,
                artwork,
                catalog,
            }
        }

        /// Lets spawned tasks run and feeds everything they send back into
        /// the core until the queue stays empty.  Never advances the clock.
        async fn settle(&mut self) {
            loop {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                let mut handled = false;
                while let Ok(evt) = self.rx.try_recv() {
                    let _ = self.core.handle_event(evt).await;
                    handled = true;
                }
                if !handled {
                    break;
                }
            }
        }

        async fn advance(&mut self, duration: Duration) {
            tokio::time::advance(duration).await;
            self.settle().await;
        }

        async fn command(&mut self, cmd: Command) {
            let _ = self.core.handle_event(PlayerEvent::Command(cmd)).await;
            self.settle().await;
        }

        async fn engine_event(&mut self, evt: EngineEvent) {
            let _ = self.core.handle_event(PlayerEvent::Engine(evt)).await;
            self.settle().await;
        }

        fn update_delay(&self) -> Option<Duration> {
            self.core.scheduler.armed_delay(TimerSlot::Update)
        }

        fn drain_notes(&mut self) -> Vec<BroadcastMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.notes.try_recv() {
                out.push(msg);
            }
            out
        }

        /// Play, script one song with a confirmed id, and reach Playing.
        async fn playing_song(&mut self, id: &str) {
            self.source.push_current(Ok(quick("A", "T", 42.0)));
            self.source.push_details(Ok(detail(id, "A", "T")));
            self.command(Command::Play).await;
            self.engine_event(EngineEvent::Playing).await;
            assert_eq!(self.core.phase(), PlaybackPhase::Playing);
            assert_eq!(self.core.snapshot().song_id.as_deref(), Some(id));
        }
    }

    fn quick(artist: &str, title: &str, time: f64) -> CurrentPoll {
        CurrentPoll {
            snapshot: Some(
                SongSnapshot::new(artist, title)
                    .with_cover(format!("https://img.radioparadise.com/quick/{}.jpg", title)),
            ),
            next_poll_secs: time,
        }
    }

    fn detail(id: &str, artist: &str, title: &str) -> SongSnapshot {
        SongSnapshot::new(artist, title)
            .with_song_id(id)
            .with_cover(format!("https://img.radioparadise.com/covers/l/{}.jpg", id))
    }

    fn play_states(notes: &[BroadcastMessage]) -> Vec<bool> {
        notes
            .iter()
            .filter_map(|n| match n {
                BroadcastMessage::PlayStateChanged(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    // ── poll cycle ───────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_quick_poll_song_arms_fudged_update_and_fetches_details() {
        let mut h = Harness::new();
        h.source.push_current(Ok(CurrentPoll {
            snapshot: Some(SongSnapshot::new("A", "T")),
            next_poll_secs: 42.0,
        }));
        h.command(Command::Play).await;

        assert_eq!(h.core.phase(), PlaybackPhase::Starting);
        assert_eq!(h.engine.calls(), vec!["play http://stream.radioparadise.com/aac-320"]);
        assert_eq!(h.core.snapshot(), &SongSnapshot::new("A", "T"));
        assert_eq!(h.update_delay(), Some(Duration::from_millis(49_500)));
        assert_eq!(h.source.details_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_arms_update_without_details() {
        let mut h = Harness::new();
        h.source.push_current(Ok(CurrentPoll {
            snapshot: None,
            next_poll_secs: 12.0,
        }));
        h.command(Command::Play).await;

        assert!(h.core.snapshot().is_empty());
        assert_eq!(h.source.details_calls(), 0);
        assert_eq!(h.update_delay(), Some(Duration::from_millis(19_500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_details_keep_quick_cadence() {
        let mut h = Harness::new();
        h.source.push_current(Ok(quick("A", "T", 42.0)));
        h.source.push_details(Err(FetchError::Ambiguous(2)));
        h.command(Command::Play).await;

        assert_eq!(h.source.details_calls(), 1);
        assert_eq!(h.core.snapshot().song_id, None);
        assert_eq!(h.core.snapshot().title, "T");
        assert_eq!(h.update_delay(), Some(Duration::from_secs(42) + FUDGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retries_in_exactly_thirty_seconds() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        assert_eq!(h.update_delay(), Some(Duration::from_millis(49_500)));

        h.source.push_current(Err(FetchError::Transport("connection reset".into())));
        h.advance(Duration::from_millis(49_500)).await;
        assert_eq!(h.source.current_calls(), 2);
        assert_eq!(h.update_delay(), Some(RETRY_DELAY));

        // Retry fires after 30s and recovers the normal cadence.
        h.source.push_current(Ok(quick("A", "T", 100.0)));
        h.advance(Duration::from_secs(30)).await;
        assert_eq!(h.source.current_calls(), 3);
        assert_eq!(h.update_delay(), Some(Duration::from_millis(107_500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_details_merge_confirmed_id_and_cover() {
        let mut h = Harness::new();
        h.playing_song("1234").await;
        let snap = h.core.snapshot().clone();
        assert_eq!(snap.artist, "A");
        assert_eq!(
            snap.cover_url.as_deref(),
            Some("https://img.radioparadise.com/covers/l/1234.jpg")
        );
        let status = h.core.status_board().get().await;
        assert_eq!(status.snapshot, snap);
        assert_eq!(
            status.song_page_url.as_deref(),
            Some("https://radioparadise.com/music/song/1234")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_song_does_not_refetch_artwork_or_preload() {
        let mut h = Harness::new();
        h.playing_song("77").await;
        let art_before = h.artwork.urls.lock().unwrap().len();
        let lookups_before = h.catalog.lookups.load(Ordering::SeqCst);
        assert_eq!(lookups_before, 1);
        h.drain_notes();

        // Next cycle reports the same song again.
        h.source.push_current(Ok(quick("A", "T", 42.0)));
        h.source.push_details(Ok(detail("77", "A", "T")));
        h.advance(Duration::from_millis(49_500)).await;

        assert_eq!(h.source.details_calls(), 2);
        assert_eq!(h.artwork.urls.lock().unwrap().len(), art_before);
        assert_eq!(h.catalog.lookups.load(Ordering::SeqCst), lookups_before);
        assert!(!h
            .drain_notes()
            .iter()
            .any(|n| matches!(n, BroadcastMessage::NowPlayingChanged(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_song_triggers_artwork_and_preload() {
        let mut h = Harness::new();
        h.playing_song("1").await;

        h.source.push_current(Ok(quick("B", "U", 42.0)));
        h.source.push_details(Ok(detail("2", "B", "U")));
        h.advance(Duration::from_millis(49_500)).await;

        assert_eq!(h.core.snapshot().song_id.as_deref(), Some("2"));
        assert_eq!(h.catalog.lookups.load(Ordering::SeqCst), 2);
        assert!(h
            .artwork
            .urls
            .lock()
            .unwrap()
            .contains(&"https://img.radioparadise.com/covers/l/2.jpg".to_string()));
        assert!(h.core.status_board().get().await.song_ready);
    }

    // ── pause / degrade ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_pause_degrades_after_fifteen_seconds() {
        let mut h = Harness::new();
        h.playing_song("1").await;

        h.command(Command::Pause).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedRecent);
        assert!(h.core.scheduler().is_armed(TimerSlot::Update));
        assert_eq!(h.core.snapshot().song_id.as_deref(), Some("1"));

        h.advance(Duration::from_secs(14)).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedRecent);

        h.advance(Duration::from_secs(1)).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedDegraded);
        assert!(!h.core.scheduler().is_armed(TimerSlot::Update));
        assert_eq!(
            h.core.snapshot(),
            &SongSnapshot::new("Radio Paradise", "Main Mix")
        );

        // No poll fires after degradation, however long we wait.
        let polls = h.source.current_calls();
        h.advance(Duration::from_secs(600)).await;
        assert_eq!(h.source.current_calls(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_within_degrade_window_keeps_song() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Pause).await;
        h.advance(Duration::from_secs(10)).await;

        h.source.push_current(Ok(quick("A", "T", 30.0)));
        h.command(Command::Play).await;
        h.advance(Duration::from_secs(20)).await;

        assert_eq!(h.core.phase(), PlaybackPhase::Starting);
        assert!(!h.core.scheduler().is_armed(TimerSlot::PauseDegrade));
        assert_eq!(h.core.snapshot().song_id.as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_after_degrade_discards_placeholder_and_refetches() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Pause).await;
        h.advance(Duration::from_secs(15)).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedDegraded);

        h.source.push_current(Ok(quick("C", "V", 42.0)));
        h.source.push_details(Ok(detail("3", "C", "V")));
        let polls = h.source.current_calls();
        h.command(Command::Play).await;

        assert_eq!(h.source.current_calls(), polls + 1);
        assert_eq!(h.core.snapshot().song_id.as_deref(), Some("3"));
        assert_ne!(h.core.snapshot().artist, "Radio Paradise");
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrade_skipped_if_engine_still_playing() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Pause).await;
        h.engine.playing.store(true, Ordering::SeqCst);

        h.advance(Duration::from_secs(15)).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedRecent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_resume_while_paused_returns_to_playing() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Pause).await;
        let plays = h
            .engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("play"))
            .count();

        h.source.push_current(Ok(quick("A", "T", 42.0)));
        h.engine_event(EngineEvent::Playing).await;

        assert_eq!(h.core.phase(), PlaybackPhase::Playing);
        assert!(!h.core.scheduler().is_armed(TimerSlot::PauseDegrade));
        let plays_after = h
            .engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("play"))
            .count();
        assert_eq!(plays, plays_after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_stop_while_playing_counts_as_pause() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.engine_event(EngineEvent::Stopped).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedRecent);
        assert!(h.core.scheduler().is_armed(TimerSlot::PauseDegrade));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_play_pause() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::TogglePlayPause).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedRecent);
        h.command(Command::TogglePlayPause).await;
        assert_eq!(h.core.phase(), PlaybackPhase::Starting);
    }

    // ── channel switch ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_switch_waits_for_settle_before_playing() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.drain_notes();

        h.command(Command::SwitchChannel { index: 2 }).await;
        assert!(h.core.switch_guard());
        assert_eq!(h.core.phase(), PlaybackPhase::Stopped);
        assert!(h.core.snapshot().is_empty());
        assert_eq!(h.engine.calls().last().map(String::as_str), Some("stop"));
        assert!(!h.core.scheduler().is_armed(TimerSlot::Update));

        h.advance(Duration::from_millis(400)).await;
        assert_eq!(h.core.phase(), PlaybackPhase::Stopped);

        h.source.push_current(Ok(quick("R", "Rock", 60.0)));
        h.advance(Duration::from_millis(100)).await;
        assert_eq!(h.core.phase(), PlaybackPhase::Starting);
        assert_eq!(
            h.engine.calls().last().map(String::as_str),
            Some("play http://stream.radioparadise.com/rock-320")
        );
        assert_eq!(h.source.channels.lock().unwrap().last(), Some(&2));
        assert!(h.core.switch_guard());

        h.engine_event(EngineEvent::Ready).await;
        assert!(!h.core.switch_guard());

        let notes = h.drain_notes();
        assert!(notes.iter().any(|n| matches!(
            n,
            BroadcastMessage::Toast { title, body }
                if title == "Channel Changed" && body == "Now playing Rock Mix"
        )));
        // Playing → Stopped → Starting never reached clients as "not playing".
        assert!(!play_states(&notes).contains(&false));

        let status = h.core.status_board().get().await;
        assert_eq!(status.channel_index, 2);
        assert_eq!(status.channel_title, "Rock Mix");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_degrade_during_switch() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Pause).await;
        assert!(h.core.scheduler().is_armed(TimerSlot::PauseDegrade));

        h.command(Command::SwitchChannel { index: 1 }).await;
        assert!(!h.core.scheduler().is_armed(TimerSlot::PauseDegrade));

        // Teardown of the old stream looks like pause/stop.
        h.engine_event(EngineEvent::Paused).await;
        h.engine_event(EngineEvent::Stopped).await;
        assert!(!h.core.scheduler().is_armed(TimerSlot::PauseDegrade));

        // The new stream never confirms, for well past the degrade delay.
        h.advance(Duration::from_secs(20)).await;
        assert!(h.core.switch_guard());
        assert_ne!(h.core.phase(), PlaybackPhase::PausedDegraded);
        assert_ne!(h.core.snapshot().artist, "Radio Paradise");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fetch_from_previous_channel_is_dropped() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        let old_epoch = h.core.epoch;

        h.command(Command::SwitchChannel { index: 3 }).await;
        let _ = h
            .core
            .handle_event(PlayerEvent::CurrentFetched {
                epoch: old_epoch,
                result: Ok(quick("Old", "Song", 5.0)),
            })
            .await;
        let _ = h
            .core
            .handle_event(PlayerEvent::DetailsFetched {
                epoch: old_epoch,
                result: Ok(detail("99", "Old", "Song")),
            })
            .await;

        assert!(h.core.snapshot().is_empty());
        assert!(!h.core.scheduler().is_armed(TimerSlot::Update));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_switch_is_ignored() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::SwitchChannel { index: 99 }).await;
        assert!(!h.core.switch_guard());
        assert_eq!(h.core.phase(), PlaybackPhase::Playing);
        assert_eq!(h.core.status_board().get().await.channel_index, 0);
    }

    // ── engine errors ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_engine_error_reinitialises_after_five_seconds() {
        let mut h = Harness::new();
        h.playing_song("1").await;

        h.engine_event(EngineEvent::Error("network".into())).await;
        assert_eq!(h.core.phase(), PlaybackPhase::ErrorRecovering);

        h.advance(Duration::from_millis(4_900)).await;
        assert!(!h.engine.calls().contains(&"reinitialize".to_string()));

        h.source.push_current(Ok(quick("A", "T", 42.0)));
        h.advance(Duration::from_millis(100)).await;
        let calls = h.engine.calls();
        let n = calls.len();
        assert_eq!(calls[n - 2], "reinitialize");
        assert!(calls[n - 1].starts_with("play "));
        assert_eq!(h.core.phase(), PlaybackPhase::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_play_enters_recovery() {
        let mut h = Harness::new();
        h.engine.fail_play.store(true, Ordering::SeqCst);
        h.command(Command::Play).await;
        assert_eq!(h.core.phase(), PlaybackPhase::ErrorRecovering);
        assert!(h.core.scheduler().is_armed(TimerSlot::EngineRecovery));
        assert_eq!(h.source.current_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_error_after_stop_is_ignored() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Stop).await;
        h.engine_event(EngineEvent::Error("eof".into())).await;
        assert_eq!(h.core.phase(), PlaybackPhase::Stopped);
        assert!(!h.core.scheduler().is_armed(TimerSlot::EngineRecovery));
    }

    // ── misc ─────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_stale_preload_result_is_ignored() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.drain_notes();
        let _ = h
            .core
            .handle_event(PlayerEvent::PreloadFinished {
                song_id: "other".into(),
                ready: false,
            })
            .await;
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_breaks_loop() {
        let mut h = Harness::new();
        assert!(h.core.handle_event(PlayerEvent::Shutdown).await.is_break());
    }

    #[test]
    fn test_quick_result_keeps_confirmed_id_for_same_song() {
        let current = detail("5", "A", "T");
        let merged = carry_confirmed_id(&current, SongSnapshot::new("A", "T"));
        assert!(merged.same_song(&current));

        let other = carry_confirmed_id(&current, SongSnapshot::new("A", "Other"));
        assert_eq!(other.song_id, None);
    }

    #[test]
    fn test_details_merge_only_into_matching_song() {
        let current = SongSnapshot::new("Miles Davis", "So What")
            .with_cover("https://img.radioparadise.com/quick/a.jpg");

        let merged = merge_details(&current, detail("9", "MILES DAVIS", "so what")).unwrap();
        assert_eq!(merged.artist, "Miles Davis");
        assert_eq!(merged.title, "So What");
        assert_eq!(merged.song_id.as_deref(), Some("9"));
        assert_eq!(
            merged.cover_url.as_deref(),
            Some("https://img.radioparadise.com/covers/l/9.jpg")
        );

        assert_eq!(merge_details(&current, detail("8", "Coltrane", "Naima")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_details_keep_new_quick_song() {
        let mut h = Harness::new();
        h.playing_song("1").await;

        // The quick feed moved on; the detail list still shows the old song.
        h.source.push_current(Ok(quick("B", "U", 200.0)));
        h.source.push_details(Ok(detail("1", "A", "T")));
        h.advance(Duration::from_millis(49_500)).await;

        let snap = h.core.snapshot();
        assert_eq!(snap.artist, "B");
        assert_eq!(snap.title, "U");
        assert_eq!(snap.song_id, None);
        assert_eq!(h.update_delay(), Some(Duration::from_millis(207_500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_during_switch_settle_waits_for_timer() {
        let mut h = Harness::new();
        h.playing_song("1").await;

        h.command(Command::SwitchChannel { index: 2 }).await;
        h.command(Command::TogglePlayPause).await;
        h.command(Command::Play).await;

        assert_eq!(h.engine.calls().last().map(String::as_str), Some("stop"));
        assert!(h.core.scheduler().is_armed(TimerSlot::SwitchSettle));
        assert_eq!(h.core.phase(), PlaybackPhase::Stopped);

        h.source.push_current(Ok(quick("R", "Rock", 60.0)));
        h.advance(SWITCH_SETTLE_DELAY).await;
        let plays: Vec<_> = h
            .engine
            .calls()
            .into_iter()
            .skip_while(|c| c != "stop")
            .filter(|c| c.starts_with("play"))
            .collect();
        assert_eq!(plays, vec!["play http://stream.radioparadise.com/rock-320"]);
        assert_eq!(h.core.phase(), PlaybackPhase::Starting);
    }

    // ── song actions ─────────────────────────────────────────────────────────

    fn toasts(notes: &[BroadcastMessage]) -> Vec<(String, String)> {
        notes
            .iter()
            .filter_map(|n| match n {
                BroadcastMessage::Toast { title, body } => Some((title.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_to_playlist_uses_preloaded_match() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.drain_notes();

        h.command(Command::AddToPlaylist).await;

        assert_eq!(*h.catalog.added.lock().unwrap(), vec!["cat-T".to_string()]);
        assert_eq!(h.catalog.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(
            toasts(&h.drain_notes()),
            vec![(
                "Song Added".to_string(),
                "Added \"T\" to \"Radio Paradise\" playlist".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_song_actions_without_song_info() {
        let mut h = Harness::new();
        h.command(Command::AddToPlaylist).await;
        h.command(Command::Share).await;
        h.command(Command::ViewOnline).await;

        let notes = h.drain_notes();
        let titles: Vec<_> = toasts(&notes).into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            titles,
            vec!["Cannot Add Song", "Cannot Share Song", "Cannot View Song"]
        );
        assert!(!notes
            .iter()
            .any(|n| matches!(n, BroadcastMessage::SongLink { .. })));
        assert!(h.catalog.added.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_and_view_emit_song_page() {
        let mut h = Harness::new();
        h.playing_song("1234").await;
        h.drain_notes();

        h.command(Command::Share).await;
        h.command(Command::ViewOnline).await;

        let links: Vec<_> = h
            .drain_notes()
            .into_iter()
            .filter_map(|n| match n {
                BroadcastMessage::SongLink { action, url } => Some((action, url)),
                _ => None,
            })
            .collect();
        let page = "https://radioparadise.com/music/song/1234".to_string();
        assert_eq!(
            links,
            vec![(SongAction::Share, page.clone()), (SongAction::ViewOnline, page)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_song_actions_on_degraded_placeholder() {
        let mut h = Harness::new();
        h.playing_song("1").await;
        h.command(Command::Pause).await;
        h.advance(PAUSE_DEGRADE_DELAY).await;
        assert_eq!(h.core.phase(), PlaybackPhase::PausedDegraded);
        h.drain_notes();

        h.command(Command::AddToPlaylist).await;
        h.command(Command::ViewOnline).await;

        let titles: Vec<_> = toasts(&h.drain_notes()).into_iter().map(|(t, _)| t).collect();
        assert_eq!(titles, vec!["Cannot Add Song", "Cannot View Song"]);
        assert!(h.catalog.added.lock().unwrap().is_empty());
    }
}
