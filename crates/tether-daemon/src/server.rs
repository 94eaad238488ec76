//! Unix socket bridge.
//!
//! Lets apps (or test harnesses) reach the connection core without a device
//! bridge. Each accepted stream carries length-prefixed UTF-8 JSON frames; the
//! first frame is the app's [`ClientQuery`], every later one is an envelope.
//! Streams are translated into [`BridgeEvent`]s for the [`Hub`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tether_rpc::{ChannelTransport, ClientQuery, FrameCodec, Outbound};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeEvent, Hub};
use crate::context::Context;
use crate::error::{DaemonError, Result};
use crate::state::ConnectionId;

/// Run the daemon until interrupted.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or another daemon already
/// owns it.
pub async fn run(ctx: Arc<Context>, custom_socket_path: Option<PathBuf>) -> Result<()> {
    let path = custom_socket_path.unwrap_or_else(|| ctx.config().resolved_socket_path());

    cleanup_stale_socket(&path).await?;

    let listener = UnixListener::bind(&path)?;
    info!("Daemon listening on {:?}", path);

    let hub = Hub::new(ctx);
    let directory = hub.directory();
    let (events, hub_task) = hub.spawn();

    tokio::select! {
        () = serve(listener, events) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested, stopping server");
        }
    }

    // Stream tasks still hold event senders, so stop the hub directly
    hub_task.abort();
    directory.lock().await.disconnect_all();

    if path.exists()
        && let Err(e) = std::fs::remove_file(&path)
    {
        warn!("Failed to remove socket file {:?}: {}", path, e);
    }

    Ok(())
}

/// Accept streams forever, reporting each one to the hub.
pub async fn serve(listener: UnixListener, events: mpsc::UnboundedSender<BridgeEvent>) {
    info!("Ready to accept connections");
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("Accepted connection");
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(stream, events).await {
                        error!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

async fn cleanup_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "Another daemon is already running",
            )));
        }
        info!("Removing stale socket at {}", path.display());
        std::fs::remove_file(path)?;
    }
    Ok(())
}

async fn handle_stream(stream: UnixStream, events: mpsc::UnboundedSender<BridgeEvent>) -> Result<()> {
    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();

    let first = match frames.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(e.into()),
        None => return Ok(()),
    };

    let query: ClientQuery = match serde_json::from_str(&first) {
        Ok(query) => query,
        Err(e) => {
            let _ = events.send(BridgeEvent::ClientSetupError {
                query: None,
                error: format!("Invalid client query: {e}"),
            });
            return Ok(());
        }
    };

    let _ = events.send(BridgeEvent::ClientSetup {
        query: query.clone(),
    });
    if let Err(e) = query.identity() {
        let _ = events.send(BridgeEvent::ClientSetupError {
            query: Some(query),
            error: e.to_string(),
        });
        return Ok(());
    }

    let id = ConnectionId::new();
    debug!("New connection: {}", id);
    let (transport, mut outbound) = ChannelTransport::new();
    if events
        .send(BridgeEvent::ClientConnected {
            id: id.clone(),
            query,
            transport: Arc::new(transport),
        })
        .is_err()
    {
        return Ok(());
    }

    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        trace!("[{}] writer started", writer_id);
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!("Failed to send to {}: {}", writer_id, e);
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
        trace!("[{}] writer ended", writer_id);
    });

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(message)) => {
                    let event = BridgeEvent::ClientMessage { id: id.clone(), message };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Read error from {}: {}", id, e);
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!("Transport for {} released", id);
                break;
            }
        }
    }

    debug!("Connection closed: {}", id);
    let _ = events.send(BridgeEvent::ClientDisconnected { id });
    writer.abort();

    Ok(())
}
