use crate::core::PlayerEvent;
use crate::BroadcastMessage;
use paradise_proto::channels::Channel;
use paradise_proto::protocol::{Broadcast, DecodeError, Message, PROTOCOL_VERSION};
use paradise_proto::state::StatusBoard;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub fn start_server(
    listener: TcpListener,
    status: Arc<StatusBoard>,
    channels: Arc<[Channel]>,
    event_tx: mpsc::Sender<PlayerEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("TCP server listening at {}", addr);
        }

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let status = status.clone();
                    let channels = channels.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();

                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        handle_client(read_half, write_half, status, channels, id, evt_tx, bcast_rx)
                            .await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    status: Arc<StatusBoard>,
    channels: Arc<[Channel]>,
    client_id: usize,
    event_tx: mpsc::Sender<PlayerEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current status on connect
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        status: status.get().await,
        channels: channels.to_vec(),
    };
    if write_broadcast(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Ok(None) => break,
                                Ok(Some((Message::Command(cmd), consumed))) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(PlayerEvent::Command(cmd)).await.is_err() {
                                        warn!("PlayerEvent channel closed");
                                        return;
                                    }

                                    let data = status.get().await;
                                    if write_broadcast(&mut write_half, Broadcast::Status { data }).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(Some((_, consumed))) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(DecodeError::Malformed { consumed, source }) => {
                                    warn!("Client {} sent a malformed frame: {}", client_id, source);
                                    read_buf.drain(..consumed);
                                }
                                Err(e @ DecodeError::TooLarge(_)) => {
                                    warn!("Client {}: {}, disconnecting", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(msg) => to_wire(msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::Status { data: status.get().await }
                    }
                    Err(_) => break,
                };
                if write_broadcast(&mut write_half, broadcast).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn to_wire(msg: BroadcastMessage) -> Broadcast {
    match msg {
        BroadcastMessage::PlayStateChanged(is_playing) => Broadcast::PlayState { is_playing },
        BroadcastMessage::NowPlayingChanged(snapshot) => Broadcast::NowPlaying { snapshot },
        BroadcastMessage::ArtworkChanged(Some(artwork)) => Broadcast::Artwork {
            width: artwork.width(),
            height: artwork.height(),
            url: Some(artwork.url),
        },
        BroadcastMessage::ArtworkChanged(None) => Broadcast::Artwork {
            url: None,
            width: 0,
            height: 0,
        },
        BroadcastMessage::SongReadyForActions(ready) => Broadcast::SongReady { ready },
        BroadcastMessage::Toast { title, body } => Broadcast::Toast { title, body },
        BroadcastMessage::SongLink { action, url } => Broadcast::SongLink { action, url },
        BroadcastMessage::Log(message) => Broadcast::Log { message },
    }
}

async fn write_broadcast<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paradise_proto::channels::default_channels;
    use paradise_proto::protocol::{Command, SongAction, SongSnapshot};
    use std::time::Duration;

    async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Message {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        reader.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().unwrap().0
    }

    struct Client<R, W> {
        read: R,
        write: W,
        events: mpsc::Receiver<PlayerEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    }

    fn connect() -> Client<impl AsyncRead + Unpin, impl AsyncWrite + Unpin> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let status = Arc::new(StatusBoard::new(3, "Global Mix".into()));
        let channels: Arc<[Channel]> = default_channels().into();
        let (event_tx, events) = mpsc::channel(8);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(8);

        tokio::spawn(handle_client(
            server_read,
            server_write,
            status,
            channels,
            1,
            event_tx,
            broadcast_rx,
        ));
        Client {
            read: client_read,
            write: client_write,
            events,
            broadcast_tx,
        }
    }

    #[tokio::test]
    async fn test_hello_command_and_notifications() {
        let mut c = connect();

        match read_frame(&mut c.read).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                status,
                channels,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(status.channel_title, "Global Mix");
                assert_eq!(channels.len(), 7);
            }
            other => panic!("expected hello, got {:?}", other),
        }

        let cmd = Message::Command(Command::SwitchChannel { index: 1 });
        c.write.write_all(&cmd.encode().unwrap()).await.unwrap();
        match c.events.recv().await {
            Some(PlayerEvent::Command(Command::SwitchChannel { index })) => assert_eq!(index, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            read_frame(&mut c.read).await,
            Message::Broadcast(Broadcast::Status { .. })
        ));

        c.broadcast_tx
            .send(BroadcastMessage::NowPlayingChanged(SongSnapshot::new("A", "T")))
            .unwrap();
        match read_frame(&mut c.read).await {
            Message::Broadcast(Broadcast::NowPlaying { snapshot }) => {
                assert_eq!(snapshot.display(), "T - A")
            }
            other => panic!("unexpected {:?}", other),
        }

        c.broadcast_tx
            .send(BroadcastMessage::ArtworkChanged(None))
            .unwrap();
        match read_frame(&mut c.read).await {
            Message::Broadcast(Broadcast::Artwork { url, .. }) => assert_eq!(url, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut c = connect();
        let _hello = read_frame(&mut c.read).await;

        let mut bad = 6u32.to_be_bytes().to_vec();
        bad.extend_from_slice(b"{oops}");
        c.write.write_all(&bad).await.unwrap();
        let play = Message::Command(Command::Play).encode().unwrap();
        c.write.write_all(&play).await.unwrap();

        let evt = tokio::time::timeout(Duration::from_secs(1), c.events.recv())
            .await
            .expect("command after a malformed frame was not delivered");
        assert!(matches!(evt, Some(PlayerEvent::Command(Command::Play))));
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let mut c = connect();
        let _hello = read_frame(&mut c.read).await;

        c.write.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), c.read.read(&mut buf))
            .await
            .expect("server kept the connection open")
            .unwrap();
        assert_eq!(n, 0);
        assert!(c.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_song_link_reaches_client() {
        let mut c = connect();
        let _hello = read_frame(&mut c.read).await;

        c.broadcast_tx
            .send(BroadcastMessage::SongLink {
                action: SongAction::Share,
                url: "https://radioparadise.com/music/song/42".into(),
            })
            .unwrap();
        match read_frame(&mut c.read).await {
            Message::Broadcast(Broadcast::SongLink { action, url }) => {
                assert_eq!(action, SongAction::Share);
                assert!(url.ends_with("/42"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
