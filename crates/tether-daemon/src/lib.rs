//! Client connection core for tether.
//!
//! This crate keeps one [`Connection`] per connected app instance, routes
//! plugin messages through per-plugin [`PluginChannels`] and tracks live apps
//! in a [`ClientDirectory`]. A small Unix socket bridge ([`server`]) drives it
//! end-to-end.
//!
//! # Architecture
//!
//! - [`bridge`]: [`BridgeEvent`]s from the device side, consumed in order by
//!   the [`Hub`]
//! - [`connection`]: handshake, request correlation and inbound dispatch
//! - [`channel`] and [`queue`]: ordered per-plugin buffering and delivery
//! - [`directory`]: identity-keyed lookup of connections
//! - [`context`]: configuration and the status event stream

pub mod bridge;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod directory;
pub mod error;
pub(crate) mod pending;
pub mod queue;
pub mod server;
pub mod state;

pub use bridge::{BridgeEvent, Hub};
pub use channel::{
    ChannelStats, HandlerToken, PluginChannels, PluginHandler, PluginSignal, PluginSubscription,
    RouteOutcome,
};
pub use config::Config;
pub use connection::{CommandHandler, CommandRegistration, Connection, RequestOptions};
pub use context::{Context, StatusEvent, StatusKind};
pub use directory::ClientDirectory;
pub use error::{ConnectionError, DaemonError, Result};
pub use queue::MessageQueue;
pub use server::{run, serve};
pub use state::{ConnectionId, ConnectionState};
