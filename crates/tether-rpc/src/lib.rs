//! Wire protocol definitions for tether.
//!
//! This crate provides the message codec and transport plumbing shared by
//! the connection core and the socket bridge.
//!
//! # Architecture
//!
//! - [`protocol`]: the [`Envelope`] tagged union with [`decode`]/[`encode`]
//! - [`transport`]: the [`Transport`] trait, an mpsc-backed implementation
//!   and the length-prefixed [`FrameCodec`] for stream sockets
//! - [`error`]: [`DecodeError`] and [`TransportError`]
//!
//! # Example
//!
//! ```
//! use tether_rpc::{decode, encode, Envelope};
//!
//! let raw = r#"{"id":1,"success":{"plugins":["Layout"]}}"#;
//! let envelope = decode(raw).unwrap();
//! assert_eq!(envelope.id(), Some(1));
//! assert_eq!(encode(&envelope), raw);
//! ```

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{DecodeError, Result, TransportError};

pub use protocol::{
    Envelope, ErrorPayload, Event, METHOD_DEINIT, METHOD_EXECUTE, METHOD_GET_BACKGROUND_PLUGINS,
    METHOD_GET_PLUGINS, METHOD_INIT, METHOD_IS_METHOD_SUPPORTED, METHOD_NOT_FOUND,
    METHOD_REFRESH_PLUGINS, PluginCall, ResponseOutcome, decode, encode,
};

pub use transport::{ChannelTransport, CodecError, FrameCodec, Outbound, Transport};

pub use tether_types::{ClientIdentity, ClientQuery, IdentityError};
