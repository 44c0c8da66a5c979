use std::sync::Arc;

use paradise_daemon::artwork::HttpArtworkSource;
use paradise_daemon::core::{Collaborators, PlayerCore, PlayerEvent};
use paradise_daemon::fetcher::MetadataFetcher;
use paradise_daemon::mpv::MpvEngine;
use paradise_daemon::{socket, BroadcastMessage};
use paradise_proto::channels::{Channel, ChannelRegistry};
use paradise_proto::config::Config;
use paradise_proto::protocol::Command;
use paradise_proto::state::FileSelectionStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let now = chrono::Local::now();
        let mut message = format!("{} [{}] ", now.format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can forward into it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = paradise_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,paradise_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel: all inputs funnel into PlayerCore
    let (event_tx, event_rx) = mpsc::channel::<PlayerEvent>(256);

    let store = Arc::new(FileSelectionStore::new(config.daemon.state_file.clone()));
    let registry = ChannelRegistry::with_default_channels(store);
    info!(
        "Selected channel {} ({})",
        registry.current_index(),
        registry.current().title
    );
    let channels: Arc<[Channel]> = registry.channels().into();

    let client = MetadataFetcher::build_client(&config.api)?;
    let collaborators = Collaborators {
        engine: Arc::new(MpvEngine::new(config.mpv.default_volume, event_tx.clone())),
        metadata: Arc::new(MetadataFetcher::new(client.clone(), &config.api)?),
        artwork: Arc::new(HttpArtworkSource::new(client)),
        catalog: None,
    };

    let core = PlayerCore::new(
        &config,
        registry,
        collaborators,
        broadcast_tx.clone(),
        event_tx.clone(),
    );

    let addr = format!("{}:{}", config.socket.bind_address, config.socket.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let _socket_handle = socket::start_server(
        listener,
        core.status_board(),
        channels,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.daemon.autoplay {
        event_tx.send(PlayerEvent::Command(Command::Play)).await?;
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        let _ = shutdown_tx.send(PlayerEvent::Shutdown).await;
    });

    info!("Daemon initialised, running event loop");
    core.run(event_rx).await?;

    Ok(())
}
