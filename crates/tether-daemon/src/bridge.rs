//! Device bridge events and the hub that turns them into connections.
//!
//! Whatever talks to devices (the socket server here, or an external bridge)
//! reports what it sees as [`BridgeEvent`]s. The [`Hub`] consumes them one at
//! a time from an mpsc channel, which serializes every directory mutation and
//! keeps each connection's messages in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tether_rpc::{ClientQuery, Transport};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::context::{Context, StatusKind};
use crate::directory::ClientDirectory;
use crate::state::ConnectionId;

/// What the device bridge observed.
#[derive(Debug)]
pub enum BridgeEvent {
    /// An app started its connection handshake
    ClientSetup { query: ClientQuery },
    /// The handshake failed before a connection existed
    ClientSetupError {
        query: Option<ClientQuery>,
        error: String,
    },
    /// A transport to an app is open
    ClientConnected {
        id: ConnectionId,
        query: ClientQuery,
        transport: Arc<dyn Transport>,
    },
    ClientDisconnected { id: ConnectionId },
    /// One inbound frame, as text
    ClientMessage { id: ConnectionId, message: String },
}

pub struct Hub {
    ctx: Arc<Context>,
    directory: Arc<Mutex<ClientDirectory>>,
}

impl Hub {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            directory: Arc::new(Mutex::new(ClientDirectory::new())),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Shared handle to the directory, for read-only consumers.
    #[must_use]
    pub fn directory(&self) -> Arc<Mutex<ClientDirectory>> {
        self.directory.clone()
    }

    /// Run the hub on its own task.
    #[must_use]
    pub fn spawn(self) -> (mpsc::UnboundedSender<BridgeEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { self.run(rx).await });
        (tx, task)
    }

    /// Process events until every sender is gone, then disconnect all
    /// remaining connections.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("Bridge closed, disconnecting clients");
        self.directory.lock().await.disconnect_all();
    }

    pub async fn handle(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::ClientSetup { query } => {
                info!("Client setup: {}@{} ({})", query.app, query.device, query.os);
                self.ctx
                    .report(query.identity().ok().as_ref(), StatusKind::SetupStarted);
            }
            BridgeEvent::ClientSetupError { query, error } => {
                warn!("Client setup failed: {}", error);
                let identity = query.and_then(|q| q.identity().ok());
                self.ctx
                    .report(identity.as_ref(), StatusKind::SetupFailed(error));
            }
            BridgeEvent::ClientConnected {
                id,
                query,
                transport,
            } => self.client_connected(id, query, transport).await,
            BridgeEvent::ClientDisconnected { id } => {
                let removed = self.directory.lock().await.remove(&id);
                if removed.is_some() {
                    self.schedule_eviction(id);
                } else {
                    debug!("Disconnect for unknown connection {}", id);
                }
            }
            BridgeEvent::ClientMessage { id, message } => {
                let connection = self.directory.lock().await.find_by_id(&id).cloned();
                match connection {
                    // Failures are logged by the connection
                    Some(connection) => {
                        let _ = connection.on_message(&message);
                    }
                    None => debug!("Message for unknown connection {}", id),
                }
            }
        }
    }

    async fn client_connected(
        &self,
        id: ConnectionId,
        query: ClientQuery,
        transport: Arc<dyn Transport>,
    ) {
        let identity = match query.identity() {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting connection {}: {}", id, e);
                self.ctx.report(None, StatusKind::SetupFailed(e.to_string()));
                transport.close();
                return;
            }
        };

        let connection = {
            let mut directory = self.directory.lock().await;
            directory.upsert(&identity, || {
                Connection::new(id.clone(), query, transport, self.ctx.clone())
            })
        };
        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to create connection {}: {}", id, e);
                self.ctx
                    .report(Some(&identity), StatusKind::SetupFailed(e.to_string()));
                return;
            }
        };

        info!("[{}] Client connected ({})", connection.client_id(), id);
        self.ctx.report(Some(&identity), StatusKind::Connected);

        let ctx = self.ctx.clone();
        let directory = self.directory.clone();
        let evict_after = self.ctx.config().evict_after();
        tokio::spawn(async move {
            if let Err(e) = connection.open().await {
                warn!("[{}] Failed to establish connection: {}", connection.client_id(), e);
                ctx.report(Some(connection.identity()), StatusKind::SetupFailed(e.to_string()));
                evict_later(directory, connection.id().clone(), evict_after);
            }
        });
    }

    fn schedule_eviction(&self, id: ConnectionId) {
        evict_later(self.directory.clone(), id, self.ctx.config().evict_after());
    }
}

/// Evict a connection after `after`, unless it was replaced or is live again.
fn evict_later(directory: Arc<Mutex<ClientDirectory>>, id: ConnectionId, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if directory.lock().await.evict_if_disconnected(&id) {
            debug!("Evicted disconnected connection {}", id);
        }
    });
}
