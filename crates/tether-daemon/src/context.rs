//! Process-wide context handed to connections and the directory.
//!
//! Built once at startup and shared by `Arc`; there is no global state.

use std::sync::Arc;

use tether_rpc::{ClientIdentity, ErrorPayload};
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::Config;

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// User-visible status change, keyed by client identity.
///
/// The UI layer turns these into transient notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// `None` when the app's query was too malformed to identify it
    pub identity: Option<ClientIdentity>,
    pub kind: StatusKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    SetupStarted,
    SetupFailed(String),
    Connected,
    Ready,
    Disconnected,
    DeviceError(ErrorPayload),
}

#[derive(Debug)]
pub struct Context {
    config: Config,
    status: broadcast::Sender<StatusEvent>,
}

impl Context {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Arc::new(Self { config, status })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Receive status events from now on.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn report(&self, identity: Option<&ClientIdentity>, kind: StatusKind) {
        trace!("Status {:?} for {:?}", kind, identity.map(ClientIdentity::build));
        // No subscribers is fine
        let _ = self.status.send(StatusEvent {
            identity: identity.cloned(),
            kind,
        });
    }
}

impl Default for Context {
    fn default() -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config: Config::default(),
            status,
        }
    }
}
