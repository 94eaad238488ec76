//! Directory of connected app instances.
//!
//! Keyed by the identity string, with a connection-id index so bridge
//! callbacks that only carry an id can find their connection. Disconnected
//! connections stay listed until explicitly evicted, so the UI can keep
//! showing the last known app.
//!
//! The directory itself is not synchronized; the [`Hub`](crate::Hub) owns it
//! behind a `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::sync::Arc;

use tether_rpc::ClientIdentity;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::state::ConnectionId;

#[derive(Debug, Default)]
pub struct ClientDirectory {
    by_identity: HashMap<String, Arc<Connection>>,
    identity_by_id: HashMap<ConnectionId, String>,
}

impl ClientDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new connection for `identity`.
    ///
    /// A live predecessor under the same identity is disconnected before
    /// `factory` runs, so it is never findable alongside its replacement.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; the predecessor stays removed.
    pub fn upsert<F, E>(&mut self, identity: &ClientIdentity, factory: F) -> Result<Arc<Connection>, E>
    where
        F: FnOnce() -> Result<Arc<Connection>, E>,
    {
        let key = identity.build();
        if let Some(previous) = self.by_identity.remove(&key) {
            self.identity_by_id.remove(previous.id());
            if previous.is_live() {
                info!("[{}] Replacing live connection {}", key, previous.id());
                previous.disconnect();
            }
        }

        let connection = factory()?;
        debug_assert_eq!(connection.client_id(), key);
        self.identity_by_id
            .insert(connection.id().clone(), key.clone());
        self.by_identity.insert(key, connection.clone());
        debug!("[{}] Registered connection {}", connection.client_id(), connection.id());
        Ok(connection)
    }

    /// Mark a connection disconnected but keep it listed.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let connection = self.find_by_id(id)?.clone();
        connection.disconnect();
        Some(connection)
    }

    /// Drop a connection from the directory entirely.
    pub fn evict(&mut self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let key = self.identity_by_id.remove(id)?;
        let connection = self.by_identity.remove(&key)?;
        connection.disconnect();
        info!("[{}] Evicted connection {}", key, id);
        Some(connection)
    }

    /// Evict only if the connection is still listed and no longer live.
    pub fn evict_if_disconnected(&mut self, id: &ConnectionId) -> bool {
        match self.find_by_id(id) {
            Some(connection) if !connection.is_live() => self.evict(id).is_some(),
            _ => false,
        }
    }

    #[must_use]
    pub fn find_by_identity(&self, client_id: &str) -> Option<&Arc<Connection>> {
        self.by_identity.get(client_id)
    }

    #[must_use]
    pub fn find_by_id(&self, id: &ConnectionId) -> Option<&Arc<Connection>> {
        self.identity_by_id
            .get(id)
            .and_then(|key| self.by_identity.get(key))
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.by_identity.values()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.by_identity.values().filter(|c| c.is_live()).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Disconnect every live connection, e.g. on shutdown.
    pub fn disconnect_all(&mut self) {
        for connection in self.by_identity.values() {
            connection.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PluginSignal;
    use crate::config::Config;
    use crate::context::Context;
    use crate::state::ConnectionState;
    use tether_rpc::{ChannelTransport, ClientQuery, IdentityError};

    fn query(device_id: &str) -> ClientQuery {
        ClientQuery::new("TestApp", "Android", "MockDevice", device_id)
    }

    fn make(ctx: &Arc<Context>, query: ClientQuery) -> Result<Arc<Connection>, IdentityError> {
        let (transport, _rx) = ChannelTransport::new();
        Connection::new(ConnectionId::new(), query, Arc::new(transport), ctx.clone())
    }

    fn insert(directory: &mut ClientDirectory, ctx: &Arc<Context>, query: ClientQuery) -> Arc<Connection> {
        let identity = query.identity().unwrap();
        directory.upsert(&identity, || make(ctx, query)).unwrap()
    }

    #[test]
    fn test_upsert_and_find() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        let conn = insert(&mut directory, &ctx, query("serial"));

        let found = directory
            .find_by_identity("TestApp#Android#MockDevice#serial")
            .unwrap();
        assert!(Arc::ptr_eq(found, &conn));
        assert!(Arc::ptr_eq(directory.find_by_id(conn.id()).unwrap(), &conn));
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.live_count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_destroys_live_predecessor_first() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        let old = insert(&mut directory, &ctx, query("serial"));
        let mut subscription = old.subscribe("Layout");

        let identity = query("serial").identity().unwrap();
        let observed = old.clone();
        let new = directory
            .upsert(&identity, || {
                assert_eq!(observed.state(), ConnectionState::Disconnected);
                make(&ctx, query("serial"))
            })
            .unwrap();

        assert_eq!(subscription.recv().await, Some(PluginSignal::Disconnected));
        let found = directory.find_by_identity(&identity.build()).unwrap();
        assert!(Arc::ptr_eq(found, &new));
        assert!(directory.find_by_id(old.id()).is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_upsert_factory_error_propagates() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        let old = insert(&mut directory, &ctx, query("serial"));

        let identity = query("serial").identity().unwrap();
        let result: Result<_, IdentityError> =
            directory.upsert(&identity, || Err(IdentityError::EmptyField("app")));
        assert!(result.is_err());
        assert!(!old.is_live());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_remove_keeps_entry() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        let conn = insert(&mut directory, &ctx, query("serial"));

        let removed = directory.remove(conn.id()).unwrap();
        assert_eq!(removed.state(), ConnectionState::Disconnected);
        assert!(directory.find_by_id(conn.id()).is_some());
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.live_count(), 0);
    }

    #[test]
    fn test_evict_if_disconnected() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        let conn = insert(&mut directory, &ctx, query("serial"));

        assert!(!directory.evict_if_disconnected(conn.id()));
        directory.remove(conn.id());
        assert!(directory.evict_if_disconnected(conn.id()));
        assert!(directory.is_empty());
        assert!(!directory.evict_if_disconnected(conn.id()));
    }

    #[test]
    fn test_stale_id_does_not_touch_replacement() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        let old = insert(&mut directory, &ctx, query("serial"));
        let new = insert(&mut directory, &ctx, query("serial"));

        assert!(directory.remove(old.id()).is_none());
        assert!(directory.evict(old.id()).is_none());
        assert!(new.is_live());
    }

    #[test]
    fn test_distinct_identities_coexist() {
        let ctx = Context::new(Config::default());
        let mut directory = ClientDirectory::new();
        insert(&mut directory, &ctx, query("a"));
        insert(&mut directory, &ctx, query("b"));
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.connections().count(), 2);

        directory.disconnect_all();
        assert_eq!(directory.live_count(), 0);
    }
}
