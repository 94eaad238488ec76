//! One logical session with a remote app process.
//!
//! A [`Connection`] owns its transport, the pending-request table and the
//! plugin channels for one app instance. It moves through
//! `Pending -> Initializing -> Ready -> Disconnected`:
//!
//! - [`open`](Connection::open) runs the capability handshake (`getPlugins`,
//!   plus `getBackgroundPlugins` for SDK 4 and later) under the init timeout.
//! - Outbound frames written before `Ready` are buffered and flushed in order
//!   once the handshake succeeds. Handshake requests bypass the buffer.
//! - [`on_message`](Connection::on_message) is fed inbound frames in arrival
//!   order by whoever drives the transport.
//! - [`disconnect`](Connection::disconnect) is terminal and idempotent.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tether_rpc::{
    ClientIdentity, ClientQuery, Envelope, ErrorPayload, Event, IdentityError, METHOD_DEINIT,
    METHOD_EXECUTE, METHOD_GET_BACKGROUND_PLUGINS, METHOD_GET_PLUGINS, METHOD_INIT,
    METHOD_IS_METHOD_SUPPORTED, PluginCall, Transport, TransportError, decode, encode,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{HandlerToken, PluginChannels, PluginHandler, PluginSubscription, RouteOutcome};
use crate::context::{Context, StatusKind};
use crate::error::ConnectionError;
use crate::pending::{PendingRequests, Settled};
use crate::state::{ConnectionId, ConnectionState};

/// Background plugins are only reported by SDK 4 and later
const BACKGROUND_PLUGINS_MIN_SDK: u32 = 4;

/// Caller-side controls for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Reject with [`ConnectionError::Timeout`] after this long
    pub timeout: Option<Duration>,
    /// Reject with [`ConnectionError::Cancelled`] once triggered
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(cancel),
        }
    }
}

/// Handler for requests and notifications the remote sends to us.
pub trait CommandHandler: Send + Sync {
    /// # Errors
    ///
    /// The error payload is sent back to the remote as an error response.
    fn handle(&self, params: Option<Value>) -> Result<Value, ErrorPayload>;
}

impl<F> CommandHandler for F
where
    F: Fn(Option<Value>) -> Result<Value, ErrorPayload> + Send + Sync,
{
    fn handle(&self, params: Option<Value>) -> Result<Value, ErrorPayload> {
        self(params)
    }
}

struct RegisteredCommand {
    generation: u64,
    handler: Arc<dyn CommandHandler>,
}

/// Keeps a local command registered; dropping it unregisters.
#[must_use = "the command is unregistered when this is dropped"]
pub struct CommandRegistration {
    method: String,
    generation: u64,
    connection: Weak<Connection>,
}

impl CommandRegistration {
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl std::fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("method", &self.method)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for CommandRegistration {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.unregister_command(&self.method, self.generation);
        }
    }
}

#[derive(Debug, Deserialize)]
struct PluginList {
    plugins: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodSupport {
    is_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Held back until `Ready`
    Buffered,
    /// Written immediately; used by the handshake and replies to the remote
    Direct,
}

struct Inner {
    state: ConnectionState,
    pending: PendingRequests,
    outbound: Vec<String>,
    supported_plugins: Vec<String>,
    background_plugins: Vec<String>,
}

/// Abandons a request id when its caller stops waiting.
struct PendingGuard<'a> {
    connection: &'a Connection,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.connection.lock().pending.abandon(self.id) {
            debug!("[{}] Request {} abandoned by caller", self.connection.client_id, self.id);
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    query: ClientQuery,
    identity: ClientIdentity,
    client_id: String,
    ctx: Arc<Context>,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    channels: Arc<PluginChannels>,
    commands: Mutex<HashMap<String, RegisteredCommand>>,
    command_generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    me: Weak<Connection>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in the `Pending` state.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if the query does not yield a valid
    /// identity.
    pub fn new(
        id: ConnectionId,
        query: ClientQuery,
        transport: Arc<dyn Transport>,
        ctx: Arc<Context>,
    ) -> Result<Arc<Self>, IdentityError> {
        let identity = query.identity()?;
        let client_id = identity.build();
        let channels = Arc::new(PluginChannels::new(ctx.config().max_queue_size));
        let (state_tx, _) = watch::channel(ConnectionState::Pending);

        Ok(Arc::new_cyclic(|me| Self {
            id,
            query,
            identity,
            client_id,
            ctx,
            transport,
            inner: Mutex::new(Inner {
                state: ConnectionState::Pending,
                pending: PendingRequests::default(),
                outbound: Vec::new(),
                supported_plugins: Vec::new(),
                background_plugins: Vec::new(),
            }),
            channels,
            commands: Mutex::new(HashMap::new()),
            command_generation: AtomicU64::new(0),
            state_tx,
            me: me.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_commands(&self) -> MutexGuard<'_, HashMap<String, RegisteredCommand>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, next: ConnectionState) {
        debug!("[{}] {} -> {}", self.client_id, inner.state, next);
        inner.state = next;
        self.state_tx.send_replace(next);
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The identity string, also the directory key.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn query(&self) -> &ClientQuery {
        &self.query
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Observe state changes. The receiver starts at the current state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn supported_plugins(&self) -> Vec<String> {
        self.lock().supported_plugins.clone()
    }

    #[must_use]
    pub fn supports_plugin(&self, plugin_id: &str) -> bool {
        self.lock().supported_plugins.iter().any(|p| p == plugin_id)
    }

    #[must_use]
    pub fn background_plugins(&self) -> Vec<String> {
        self.lock().background_plugins.clone()
    }

    #[must_use]
    pub fn is_background_plugin(&self, plugin_id: &str) -> bool {
        self.lock().background_plugins.iter().any(|p| p == plugin_id)
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn buffered_outbound(&self) -> usize {
        self.lock().outbound.len()
    }

    #[must_use]
    pub fn channels(&self) -> &Arc<PluginChannels> {
        &self.channels
    }

    /// Run the capability handshake: `Pending -> Initializing -> Ready`.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::InvalidState`] if not called in `Pending`
    /// - [`ConnectionError::InitializationTimeout`] if the handshake does not
    ///   finish within the configured init timeout
    /// - [`ConnectionError::NoLongerConnected`] if the transport closed first
    ///
    /// Any failure leaves the connection `Disconnected`.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Pending {
                return Err(ConnectionError::InvalidState {
                    expected: ConnectionState::Pending,
                    actual: inner.state,
                });
            }
            self.set_state(&mut inner, ConnectionState::Initializing);
        }

        let deadline = self.ctx.config().init_timeout();
        let (plugins, background) =
            match tokio::time::timeout(deadline, self.query_capabilities()).await {
                Ok(Ok(capabilities)) => capabilities,
                Ok(Err(e)) => {
                    warn!("[{}] Capability query failed: {}", self.client_id, e);
                    self.disconnect();
                    return Err(e);
                }
                Err(_) => {
                    warn!(
                        "[{}] Capability query timed out after {:?}",
                        self.client_id, deadline
                    );
                    self.disconnect();
                    return Err(ConnectionError::InitializationTimeout(deadline));
                }
            };

        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Initializing {
                return Err(ConnectionError::NoLongerConnected);
            }
            inner.supported_plugins = plugins;
            inner.background_plugins = background.clone();
            self.set_state(&mut inner, ConnectionState::Ready);

            // Flushed under the lock so a concurrent send cannot overtake
            let buffered = std::mem::take(&mut inner.outbound);
            if !buffered.is_empty() {
                debug!("[{}] Flushing {} buffered frames", self.client_id, buffered.len());
            }
            for frame in buffered {
                if let Err(e) = self.transport.send(frame) {
                    warn!("[{}] Failed to flush buffered frame: {}", self.client_id, e);
                    break;
                }
            }
            info!(
                "[{}] Ready with {} plugins ({} background)",
                self.client_id,
                inner.supported_plugins.len(),
                inner.background_plugins.len()
            );
        }

        self.ctx.report(Some(&self.identity), StatusKind::Ready);
        self.connect_background_plugins(&background);
        Ok(())
    }

    async fn query_capabilities(&self) -> Result<(Vec<String>, Vec<String>), ConnectionError> {
        let plugins = self.fetch_plugin_list(METHOD_GET_PLUGINS).await?;
        let background = if self.query.sdk_version() >= BACKGROUND_PLUGINS_MIN_SDK {
            self.fetch_plugin_list(METHOD_GET_BACKGROUND_PLUGINS).await?
        } else {
            Vec::new()
        };
        Ok((plugins, background))
    }

    async fn fetch_plugin_list(&self, method: &str) -> Result<Vec<String>, ConnectionError> {
        let value = self
            .request(method, None, Dispatch::Direct, RequestOptions::default())
            .await?;
        serde_json::from_value::<PluginList>(value)
            .map(|list| list.plugins)
            .map_err(|e| ConnectionError::UnexpectedResponse(format!("{method}: {e}")))
    }

    fn connect_background_plugins(&self, plugins: &[String]) {
        let config = self.ctx.config();
        for plugin in plugins {
            if config.should_connect_background_plugin(&self.query.app, plugin)
                && let Err(e) = self.init_plugin(plugin)
            {
                warn!("[{}] Failed to start background plugin {}: {}", self.client_id, plugin, e);
            }
        }
    }

    /// Re-run the capability query and reconcile background plugins: ones
    /// that disappeared are stopped, new ones that should auto-connect are
    /// started.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not `Ready` or the query fails.
    pub async fn refresh_plugins(&self) -> Result<(), ConnectionError> {
        let actual = self.state();
        if actual != ConnectionState::Ready {
            return Err(ConnectionError::InvalidState {
                expected: ConnectionState::Ready,
                actual,
            });
        }

        let (plugins, background) = self.query_capabilities().await?;
        let old_background = {
            let mut inner = self.lock();
            inner.supported_plugins = plugins;
            std::mem::replace(&mut inner.background_plugins, background.clone())
        };

        let config = self.ctx.config();
        for plugin in &old_background {
            if !background.contains(plugin)
                && config.should_connect_background_plugin(&self.query.app, plugin)
                && let Err(e) = self.deinit_plugin(plugin)
            {
                warn!("[{}] Failed to stop plugin {}: {}", self.client_id, plugin, e);
            }
        }
        for plugin in &background {
            if !old_background.contains(plugin)
                && config.should_connect_background_plugin(&self.query.app, plugin)
                && let Err(e) = self.init_plugin(plugin)
            {
                warn!("[{}] Failed to start plugin {}: {}", self.client_id, plugin, e);
            }
        }
        debug!("[{}] Plugins refreshed", self.client_id);
        Ok(())
    }

    fn spawn_refresh(&self) {
        let Some(connection) = self.me.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = connection.refresh_plugins().await {
                        warn!("[{}] Plugin refresh failed: {}", connection.client_id, e);
                    }
                });
            }
            Err(_) => warn!("[{}] No runtime to refresh plugins on", self.client_id),
        }
    }

    /// Write a frame now, or hold it until `Ready`.
    fn dispatch(&self, inner: &mut Inner, frame: String, mode: Dispatch) -> Result<(), ConnectionError> {
        match inner.state {
            ConnectionState::Disconnected => Err(ConnectionError::NoLongerConnected),
            state if state.buffers_outbound() && mode == Dispatch::Buffered => {
                trace!("[{}] Buffering frame until ready", self.client_id);
                inner.outbound.push(frame);
                Ok(())
            }
            _ => self.transport.send(frame).map_err(|e| match e {
                TransportError::Closed => ConnectionError::NoLongerConnected,
                other => ConnectionError::Transport(other),
            }),
        }
    }

    /// Fire-and-forget message to the remote.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoLongerConnected`] once disconnected.
    pub fn send(&self, method: &str, params: Option<Value>) -> Result<(), ConnectionError> {
        let frame = event_frame(method, params);
        trace!("[{}] send {}", self.client_id, method);
        let mut inner = self.lock();
        self.dispatch(&mut inner, frame, Dispatch::Buffered)
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Remote`] if the remote answered with an error
    /// - [`ConnectionError::NoLongerConnected`] if the connection went away
    pub async fn send_expect_response(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectionError> {
        self.send_expect_response_with(method, params, RequestOptions::default())
            .await
    }

    /// [`send_expect_response`](Self::send_expect_response) with a caller
    /// deadline and/or cancellation token. Dropping the returned future
    /// also cancels; a response that arrives afterwards is discarded.
    ///
    /// # Errors
    ///
    /// As [`send_expect_response`](Self::send_expect_response), plus
    /// [`ConnectionError::Timeout`] and [`ConnectionError::Cancelled`].
    pub async fn send_expect_response_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ConnectionError> {
        self.request(method, params, Dispatch::Buffered, options).await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        mode: Dispatch,
        options: RequestOptions,
    ) -> Result<Value, ConnectionError> {
        let (id, rx) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Disconnected {
                return Err(ConnectionError::NoLongerConnected);
            }
            let (id, rx) = inner.pending.register();
            let frame = encode(&Envelope::request(id, method, params));
            if let Err(e) = self.dispatch(&mut inner, frame, mode) {
                inner.pending.abandon(id);
                return Err(e);
            }
            (id, rx)
        };
        trace!("[{}] request {} id={}", self.client_id, method, id);

        let _guard = PendingGuard {
            connection: self,
            id,
        };
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            response = rx => response.unwrap_or(Err(ConnectionError::NoLongerConnected)),
            () = cancelled => Err(ConnectionError::Cancelled),
            () = deadline => Err(ConnectionError::Timeout),
        }
    }

    /// Handle one inbound frame.
    ///
    /// Never changes the connection state. Malformed frames and unmatched
    /// responses are logged and returned for observability.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Decode`] or [`ConnectionError::UnmatchedResponse`].
    pub fn on_message(&self, raw: &str) -> Result<(), ConnectionError> {
        let envelope = match decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[{}] Dropping malformed message: {}", self.client_id, e);
                return Err(e.into());
            }
        };

        if !self.is_live() {
            debug!("[{}] Ignoring message after disconnect", self.client_id);
            return Ok(());
        }

        match envelope {
            Envelope::Response { id, outcome } => {
                let settled = self.lock().pending.settle(id, outcome);
                match settled {
                    Settled::Delivered => Ok(()),
                    Settled::Abandoned => {
                        debug!("[{}] Dropping late response for cancelled request {}", self.client_id, id);
                        Ok(())
                    }
                    Settled::Unmatched => {
                        warn!("[{}] Unmatched response id {}", self.client_id, id);
                        Err(ConnectionError::UnmatchedResponse(id))
                    }
                }
            }
            Envelope::Request { id, method, params } => {
                self.handle_request(id, &method, params);
                Ok(())
            }
            Envelope::Event(event) => {
                self.handle_event(event, wire_size(raw));
                Ok(())
            }
        }
    }

    fn handle_event(&self, event: Event, bytes: usize) {
        match event {
            Event::Execute(call) => self.route_plugin_event(call, bytes),
            Event::RefreshPlugins => self.spawn_refresh(),
            Event::DeviceError { method, error } => {
                let during = method.map(|m| format!(" when calling {m}")).unwrap_or_default();
                error!(
                    "[{}] Error received from device{}: {}\nDevice stack trace: {}",
                    self.client_id, during, error.message, error.stacktrace
                );
                self.ctx
                    .report(Some(&self.identity), StatusKind::DeviceError(error));
            }
            Event::Init { plugin } => {
                self.handle_notification(METHOD_INIT, Some(json!({ "plugin": plugin })));
            }
            Event::Deinit { plugin } => {
                self.handle_notification(METHOD_DEINIT, Some(json!({ "plugin": plugin })));
            }
            Event::Unknown { method, params } => self.handle_notification(&method, params),
        }
    }

    fn route_plugin_event(&self, call: PluginCall, bytes: usize) {
        self.channels.record_received_bytes(&call.api, bytes);
        if bytes > self.ctx.config().large_message_warn_bytes {
            warn!(
                "[{}] Plugin '{}' received excessively large message for '{}': {}kB",
                self.client_id,
                call.api,
                call.method,
                bytes / 1024
            );
        }
        let api = call.api.clone();
        match self.channels.route(&api, call) {
            RouteOutcome::Delivered => trace!("[{}] Delivered event to {}", self.client_id, api),
            RouteOutcome::Queued => trace!("[{}] Queued event for {}", self.client_id, api),
            RouteOutcome::Discarded => {}
        }
    }

    fn command(&self, method: &str) -> Option<Arc<dyn CommandHandler>> {
        self.lock_commands()
            .get(method)
            .map(|registered| registered.handler.clone())
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        let Some(handler) = self.command(method) else {
            debug!("[{}] No handler for {}", self.client_id, method);
            return;
        };
        if let Err(e) = handler.handle(params) {
            warn!("[{}] Handler for {} failed: {}", self.client_id, method, e);
        }
    }

    fn handle_request(&self, id: u64, method: &str, params: Option<Value>) {
        let reply = match self.command(method) {
            Some(handler) => match handler.handle(params) {
                Ok(result) => Envelope::success(id, result),
                Err(error) => Envelope::error(id, error),
            },
            None => {
                warn!("[{}] Request for unknown method {}", self.client_id, method);
                Envelope::error(id, ErrorPayload::method_not_found(method))
            }
        };
        let mut inner = self.lock();
        if let Err(e) = self.dispatch(&mut inner, encode(&reply), Dispatch::Direct) {
            debug!("[{}] Could not reply to request {}: {}", self.client_id, id, e);
        }
    }

    /// Handle requests and notifications for `method` sent by the remote.
    /// Replaces any earlier handler for the same method.
    pub fn register_command(
        &self,
        method: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> CommandRegistration {
        let method = method.into();
        let generation = self.command_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock_commands().insert(
            method.clone(),
            RegisteredCommand {
                generation,
                handler: Arc::new(handler),
            },
        );
        CommandRegistration {
            method,
            generation,
            connection: self.me.clone(),
        }
    }

    fn unregister_command(&self, method: &str, generation: u64) {
        let mut commands = self.lock_commands();
        if commands
            .get(method)
            .is_some_and(|registered| registered.generation == generation)
        {
            commands.remove(method);
        }
    }

    /// Mount a handler for a plugin's events, replaying queued ones first.
    pub fn attach_handler(
        &self,
        plugin_id: &str,
        handler: impl PluginHandler + 'static,
    ) -> HandlerToken {
        self.channels.attach_handler(plugin_id, handler)
    }

    /// Receive a plugin's events through a channel until dropped.
    #[must_use]
    pub fn subscribe(&self, plugin_id: &str) -> PluginSubscription {
        self.channels.subscribe(plugin_id)
    }

    pub fn detach_handler(&self, plugin_id: &str) -> bool {
        self.channels.detach_handler(plugin_id)
    }

    /// Ask the remote to start a plugin. Sends `init` at most once until the
    /// plugin is stopped again; returns whether it was sent.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoLongerConnected`] once disconnected.
    pub fn init_plugin(&self, plugin_id: &str) -> Result<bool, ConnectionError> {
        if !self.channels.mark_plugin_started(plugin_id) {
            debug!("[{}] Plugin {} already started", self.client_id, plugin_id);
            return Ok(false);
        }
        if let Err(e) = self.send(METHOD_INIT, Some(json!({ "plugin": plugin_id }))) {
            self.channels.mark_plugin_stopped(plugin_id);
            return Err(e);
        }
        debug!("[{}] Started plugin {}", self.client_id, plugin_id);
        Ok(true)
    }

    /// Ask the remote to stop a plugin; returns whether `deinit` was sent.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoLongerConnected`] once disconnected.
    pub fn deinit_plugin(&self, plugin_id: &str) -> Result<bool, ConnectionError> {
        if !self.channels.mark_plugin_stopped(plugin_id) {
            return Ok(false);
        }
        self.send(METHOD_DEINIT, Some(json!({ "plugin": plugin_id })))?;
        debug!("[{}] Stopped plugin {}", self.client_id, plugin_id);
        Ok(true)
    }

    /// Call a method on a started plugin and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::PluginNotActive`] unless the plugin was
    /// started, otherwise as [`send_expect_response`](Self::send_expect_response).
    pub async fn call_plugin(
        &self,
        api: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_plugin_active(api)?;
        let call = PluginCall::new(api, method, params);
        self.send_expect_response(METHOD_EXECUTE, Some(call.to_value()))
            .await
    }

    /// Fire-and-forget plugin message.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoLongerConnected`] once disconnected.
    pub fn send_to_plugin(
        &self,
        api: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectionError> {
        let call = PluginCall::new(api, method, params);
        self.send(METHOD_EXECUTE, Some(call.to_value()))
    }

    /// Ask the remote whether a started plugin implements `method`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::PluginNotActive`] unless the plugin was
    /// started, or [`ConnectionError::UnexpectedResponse`] for a malformed
    /// answer.
    pub async fn supports_method(&self, api: &str, method: &str) -> Result<bool, ConnectionError> {
        self.ensure_plugin_active(api)?;
        let value = self
            .send_expect_response(
                METHOD_IS_METHOD_SUPPORTED,
                Some(json!({ "api": api, "method": method })),
            )
            .await?;
        serde_json::from_value::<MethodSupport>(value)
            .map(|support| support.is_supported)
            .map_err(|e| ConnectionError::UnexpectedResponse(format!("{METHOD_IS_METHOD_SUPPORTED}: {e}")))
    }

    fn ensure_plugin_active(&self, api: &str) -> Result<(), ConnectionError> {
        if self.channels.is_started(api) {
            Ok(())
        } else {
            Err(ConnectionError::PluginNotActive(api.to_string()))
        }
    }

    /// The transport reported that it closed.
    pub fn on_close(&self) {
        debug!("[{}] Transport closed", self.client_id);
        self.disconnect();
    }

    /// Tear down: reject pending requests, notify plugin handlers, drop
    /// queues and buffered frames, release the transport. Idempotent.
    pub fn disconnect(&self) {
        let rejected = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Disconnected {
                return;
            }
            self.set_state(&mut inner, ConnectionState::Disconnected);
            inner.outbound.clear();
            inner.pending.fail_all()
        };
        self.channels.disconnect_all();
        self.transport.close();
        info!(
            "[{}] Disconnected ({} pending requests rejected)",
            self.client_id, rejected
        );
        self.ctx
            .report(Some(&self.identity), StatusKind::Disconnected);
    }
}

/// Size of a frame as the app measures it: two bytes per UTF-16 unit.
fn wire_size(raw: &str) -> usize {
    raw.encode_utf16().count() * 2
}

fn event_frame(method: &str, params: Option<Value>) -> String {
    let mut obj = Map::new();
    obj.insert("method".to_string(), Value::String(method.to_string()));
    if let Some(params) = params {
        obj.insert("params".to_string(), params);
    }
    Value::Object(obj).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PluginSignal;
    use crate::config::Config;
    use tether_rpc::{ChannelTransport, Outbound};
    use tokio::sync::mpsc;

    fn query() -> ClientQuery {
        ClientQuery::new("TestApp", "Android", "MockDevice", "serial")
    }

    fn connect_with(
        query: ClientQuery,
        config: Config,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>, Arc<Context>) {
        let ctx = Context::new(config);
        let (transport, rx) = ChannelTransport::new();
        let conn = Connection::new(ConnectionId::new(), query, Arc::new(transport), ctx.clone())
            .unwrap();
        (conn, rx, ctx)
    }

    fn connect() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, rx, _) = connect_with(query(), Config::default());
        (conn, rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => serde_json::from_str(&frame).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    fn next_frame_now(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<Value> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(serde_json::from_str(&frame).unwrap()),
            _ => None,
        }
    }

    /// Drive the handshake to `Ready` answering `getPlugins` with `plugins`.
    async fn open_ready(
        conn: &Arc<Connection>,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        plugins: &[&str],
    ) {
        let opener = conn.clone();
        let task = tokio::spawn(async move { opener.open().await });
        let request = next_frame(rx).await;
        assert_eq!(request["method"], METHOD_GET_PLUGINS);
        let id = request["id"].as_u64().unwrap();
        conn.on_message(&json!({ "id": id, "success": { "plugins": plugins } }).to_string())
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let (conn, mut rx) = connect();
        assert_eq!(conn.state(), ConnectionState::Pending);

        let opener = conn.clone();
        let task = tokio::spawn(async move { opener.open().await });

        let request = next_frame(&mut rx).await;
        assert_eq!(request, json!({ "id": 1, "method": "getPlugins" }));
        conn.on_message(r#"{"id":1,"success":{"plugins":["Layout"]}}"#)
            .unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.supported_plugins(), vec!["Layout".to_string()]);
        assert!(conn.supports_plugin("Layout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_disconnects() {
        let (conn, mut rx) = connect();
        let mut states = conn.watch_state();

        let result = conn.open().await;
        assert!(matches!(
            result,
            Err(ConnectionError::InitializationTimeout(d)) if d == Duration::from_secs(30)
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        assert_eq!(next_frame(&mut rx).await["method"], METHOD_GET_PLUGINS);
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        // Late frames after teardown are ignored
        assert!(conn.on_message(r#"{"id":1,"success":{"plugins":[]}}"#).is_ok());
    }

    #[tokio::test]
    async fn test_open_twice_is_invalid() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;
        assert!(matches!(
            conn.open().await,
            Err(ConnectionError::InvalidState {
                expected: ConnectionState::Pending,
                actual: ConnectionState::Ready,
            })
        ));
    }

    #[tokio::test]
    async fn test_transport_close_during_handshake() {
        let (conn, mut rx) = connect();
        let opener = conn.clone();
        let task = tokio::spawn(async move { opener.open().await });
        next_frame(&mut rx).await;

        conn.on_close();
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::NoLongerConnected)
        ));
    }

    #[tokio::test]
    async fn test_background_plugins_queried_for_sdk_4() {
        let mut config = Config::default();
        config
            .enabled_plugins
            .insert("TestApp".to_string(), vec!["Network".to_string()]);
        let (conn, mut rx, _) = connect_with(query().with_sdk_version(4), config);

        let opener = conn.clone();
        let task = tokio::spawn(async move { opener.open().await });

        let first = next_frame(&mut rx).await;
        conn.on_message(&json!({ "id": first["id"], "success": { "plugins": ["Layout", "Network"] } }).to_string())
            .unwrap();
        let second = next_frame(&mut rx).await;
        assert_eq!(second["method"], METHOD_GET_BACKGROUND_PLUGINS);
        conn.on_message(&json!({ "id": second["id"], "success": { "plugins": ["Network"] } }).to_string())
            .unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(conn.background_plugins(), vec!["Network".to_string()]);
        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "method": "init", "params": { "plugin": "Network" } })
        );
        assert!(conn.channels().is_started("Network"));
    }

    #[tokio::test]
    async fn test_send_buffered_until_ready_in_order() {
        let (conn, mut rx) = connect();
        conn.send("first", None).unwrap();
        conn.send("second", Some(json!({ "n": 2 }))).unwrap();
        assert_eq!(conn.buffered_outbound(), 2);

        open_ready(&conn, &mut rx, &[]).await;

        assert_eq!(next_frame(&mut rx).await, json!({ "method": "first" }));
        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "method": "second", "params": { "n": 2 } })
        );
        assert_eq!(conn.buffered_outbound(), 0);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (conn, _rx) = connect();
        conn.disconnect();
        assert!(matches!(
            conn.send("x", None),
            Err(ConnectionError::NoLongerConnected)
        ));
        assert!(matches!(
            conn.send_expect_response("x", None).await,
            Err(ConnectionError::NoLongerConnected)
        ));
    }

    #[tokio::test]
    async fn test_request_resolves_with_success_payload() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let caller = conn.clone();
        let task = tokio::spawn(async move {
            caller.send_expect_response("getRoot", Some(json!({}))).await
        });
        let request = next_frame(&mut rx).await;
        assert_eq!(request["method"], "getRoot");
        assert_eq!(request["params"], json!({}));

        let reply = json!({ "id": request["id"], "success": { "z": 1, "a": [1, 2] } });
        conn.on_message(&reply.to_string()).unwrap();
        let value = task.await.unwrap().unwrap();
        assert_eq!(value.to_string(), r#"{"z":1,"a":[1,2]}"#);
    }

    #[tokio::test]
    async fn test_request_rejects_with_remote_error() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let caller = conn.clone();
        let task = tokio::spawn(async move { caller.send_expect_response("getRoot", None).await });
        let request = next_frame(&mut rx).await;
        conn.on_message(
            &json!({ "id": request["id"], "error": { "message": "nope", "name": "Error", "stacktrace": "" } })
                .to_string(),
        )
        .unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Remote(e)) if e.message == "nope"
        ));
    }

    #[tokio::test]
    async fn test_pending_request_rejected_on_close() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let caller = conn.clone();
        let task = tokio::spawn(async move {
            caller.send_expect_response("getRoot", Some(json!({}))).await
        });
        next_frame(&mut rx).await;
        assert_eq!(conn.pending_requests(), 1);

        conn.on_close();
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::NoLongerConnected)
        ));
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_ids() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let mut tasks = Vec::new();
        for n in 0..20 {
            let caller = conn.clone();
            tasks.push(tokio::spawn(async move {
                caller.send_expect_response("echo", Some(json!(n))).await
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            let request = next_frame(&mut rx).await;
            let id = request["id"].as_u64().unwrap();
            assert!(ids.insert(id));
            conn.on_message(&json!({ "id": id, "success": request["params"] }).to_string())
                .unwrap();
        }
        for (n, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), json!(n));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_then_late_response_dropped() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let result = conn
            .send_expect_response_with(
                "slow",
                None,
                RequestOptions::with_timeout(Duration::from_secs(5)),
            )
            .await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));

        let request = next_frame(&mut rx).await;
        let late = json!({ "id": request["id"], "success": null }).to_string();
        assert!(conn.on_message(&late).is_ok());
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_request_cancelled_by_token() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let token = CancellationToken::new();
        let caller = conn.clone();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            caller
                .send_expect_response_with("slow", None, RequestOptions::with_cancel(cancel))
                .await
        });
        let request = next_frame(&mut rx).await;
        token.cancel();
        assert!(matches!(task.await.unwrap(), Err(ConnectionError::Cancelled)));

        let late = json!({ "id": request["id"], "success": {} }).to_string();
        assert!(conn.on_message(&late).is_ok());
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_reported_not_fatal() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;
        assert!(matches!(
            conn.on_message(r#"{"id":99,"success":{}}"#),
            Err(ConnectionError::UnmatchedResponse(99))
        ));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_malformed_message_is_reported_not_fatal() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;
        assert!(matches!(
            conn.on_message("{not json"),
            Err(ConnectionError::Decode(_))
        ));
        assert!(matches!(
            conn.on_message("[1,2]"),
            Err(ConnectionError::Decode(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_execute_events_queue_then_replay() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;

        for n in 1..=3 {
            let frame = json!({
                "method": "execute",
                "params": { "api": "Layout", "method": "update", "params": { "n": n } }
            });
            conn.on_message(&frame.to_string()).unwrap();
        }
        assert_eq!(conn.channels().queue_len("Layout"), 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.attach_handler("Layout", move |signal: PluginSignal| {
            sink.lock().unwrap().push(signal);
        });

        let seen = seen.lock().unwrap();
        let numbers: Vec<u64> = seen
            .iter()
            .map(|signal| match signal {
                PluginSignal::Event(call) => call.params.as_ref().unwrap()["n"].as_u64().unwrap(),
                PluginSignal::Disconnected => panic!("unexpected disconnect"),
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(conn.channels().queue_len("Layout"), 0);
    }

    #[tokio::test]
    async fn test_execute_bytes_counted_in_utf16_units() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;

        let frame = r#"{"method":"execute","params":{"api":"Layout","method":"text","params":"héllo 👋"}}"#;
        conn.on_message(frame).unwrap();

        let stats = conn.channels().stats("Layout").unwrap();
        let expected = frame.encode_utf16().count() as u64 * 2;
        assert_eq!(stats.bytes_received, expected);
        // é is one UTF-16 unit but two UTF-8 bytes, the emoji is two units and four bytes
        assert_eq!(expected, (frame.len() as u64 - 3) * 2);
    }

    #[tokio::test]
    async fn test_subscriber_gets_disconnect_signal() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;
        let mut subscription = conn.subscribe("Layout");

        conn.on_message(r#"{"method":"execute","params":{"api":"Layout","method":"ping"}}"#)
            .unwrap();
        conn.on_close();

        assert!(matches!(
            subscription.recv().await,
            Some(PluginSignal::Event(call)) if call.method == "ping"
        ));
        assert_eq!(subscription.recv().await, Some(PluginSignal::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (conn, mut rx, ctx) = connect_with(query(), Config::default());
        let mut status = ctx.subscribe_status();
        open_ready(&conn, &mut rx, &[]).await;
        assert_eq!(status.recv().await.unwrap().kind, StatusKind::Ready);

        conn.disconnect();
        conn.disconnect();
        conn.on_close();

        assert_eq!(status.recv().await.unwrap().kind, StatusKind::Disconnected);
        assert!(status.try_recv().is_err());
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_init_plugin_sent_once() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;

        assert!(conn.init_plugin("Layout").unwrap());
        assert!(!conn.init_plugin("Layout").unwrap());
        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "method": "init", "params": { "plugin": "Layout" } })
        );
        assert!(next_frame_now(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_deinit_then_init_resends() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;

        conn.init_plugin("Layout").unwrap();
        assert!(conn.deinit_plugin("Layout").unwrap());
        assert!(!conn.deinit_plugin("Layout").unwrap());
        assert!(conn.init_plugin("Layout").unwrap());

        let methods: Vec<Value> = (0..3)
            .map(|_| next_frame_now(&mut rx).unwrap()["method"].clone())
            .collect();
        assert_eq!(methods, vec![json!("init"), json!("deinit"), json!("init")]);
    }

    #[tokio::test]
    async fn test_call_plugin_requires_started_plugin() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;

        assert!(matches!(
            conn.call_plugin("Layout", "getNodes", None).await,
            Err(ConnectionError::PluginNotActive(p)) if p == "Layout"
        ));

        conn.init_plugin("Layout").unwrap();
        next_frame(&mut rx).await;

        let caller = conn.clone();
        let task = tokio::spawn(async move {
            caller
                .call_plugin("Layout", "getNodes", Some(json!({ "ids": [1] })))
                .await
        });
        let request = next_frame(&mut rx).await;
        assert_eq!(request["method"], "execute");
        assert_eq!(
            request["params"],
            json!({ "api": "Layout", "method": "getNodes", "params": { "ids": [1] } })
        );
        conn.on_message(&json!({ "id": request["id"], "success": { "nodes": [] } }).to_string())
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), json!({ "nodes": [] }));
    }

    #[tokio::test]
    async fn test_supports_method() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;
        conn.init_plugin("Layout").unwrap();
        next_frame(&mut rx).await;

        let caller = conn.clone();
        let task = tokio::spawn(async move { caller.supports_method("Layout", "setData").await });
        let request = next_frame(&mut rx).await;
        assert_eq!(request["method"], "isMethodSupported");
        assert_eq!(request["params"], json!({ "api": "Layout", "method": "setData" }));
        conn.on_message(&json!({ "id": request["id"], "success": { "isSupported": true } }).to_string())
            .unwrap();
        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_send_to_plugin() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &["Layout"]).await;
        conn.send_to_plugin("Layout", "highlight", Some(json!(7))).unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "method": "execute", "params": { "api": "Layout", "method": "highlight", "params": 7 } })
        );
    }

    #[tokio::test]
    async fn test_local_command_answers_request() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let registration = conn.register_command("ping", |params: Option<Value>| -> Result<Value, ErrorPayload> {
            Ok(json!({ "pong": params }))
        });
        assert_eq!(registration.method(), "ping");

        conn.on_message(r#"{"id":7,"method":"ping","params":1}"#).unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "id": 7, "success": { "pong": 1 } })
        );

        drop(registration);
        conn.on_message(r#"{"id":8,"method":"ping"}"#).unwrap();
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply["id"], 8);
        assert_eq!(reply["error"]["name"], "MethodNotFound");
    }

    #[tokio::test]
    async fn test_local_command_error_response() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;
        let _registration = conn.register_command("fail", |_: Option<Value>| -> Result<Value, ErrorPayload> {
            Err(ErrorPayload::new("Error", "failed"))
        });

        conn.on_message(r#"{"id":3,"method":"fail"}"#).unwrap();
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply["error"]["message"], "failed");
    }

    #[tokio::test]
    async fn test_unknown_event_reaches_command_handler() {
        let (conn, mut rx) = connect();
        open_ready(&conn, &mut rx, &[]).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _registration = conn.register_command("notify", move |params: Option<Value>| -> Result<Value, ErrorPayload> {
            sink.lock().unwrap().push(params);
            Ok(Value::Null)
        });

        conn.on_message(r#"{"method":"notify","params":{"x":1}}"#).unwrap();
        conn.on_message(r#"{"method":"other"}"#).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({ "x": 1 }))]);
    }

    #[tokio::test]
    async fn test_device_error_reported_as_status() {
        let (conn, mut rx, ctx) = connect_with(query(), Config::default());
        open_ready(&conn, &mut rx, &[]).await;
        let mut status = ctx.subscribe_status();

        conn.on_message(r#"{"method":"getRoot","error":{"message":"crash","name":"E","stacktrace":"at x"}}"#)
            .unwrap();
        let event = status.recv().await.unwrap();
        assert!(matches!(event.kind, StatusKind::DeviceError(e) if e.message == "crash"));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_refresh_plugins_diffs_background_plugins() {
        let config = Config {
            background_plugins: vec!["Crash".to_string(), "Network".to_string()],
            ..Config::default()
        };
        let (conn, mut rx, _) = connect_with(query().with_sdk_version(4), config);

        let opener = conn.clone();
        let task = tokio::spawn(async move { opener.open().await });
        let request = next_frame(&mut rx).await;
        conn.on_message(&json!({ "id": request["id"], "success": { "plugins": [] } }).to_string())
            .unwrap();
        let request = next_frame(&mut rx).await;
        conn.on_message(&json!({ "id": request["id"], "success": { "plugins": ["Crash"] } }).to_string())
            .unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(next_frame(&mut rx).await["params"]["plugin"], "Crash");

        conn.on_message(r#"{"method":"refreshPlugins"}"#).unwrap();

        let request = next_frame(&mut rx).await;
        assert_eq!(request["method"], METHOD_GET_PLUGINS);
        conn.on_message(&json!({ "id": request["id"], "success": { "plugins": ["Network"] } }).to_string())
            .unwrap();
        let request = next_frame(&mut rx).await;
        assert_eq!(request["method"], METHOD_GET_BACKGROUND_PLUGINS);
        conn.on_message(&json!({ "id": request["id"], "success": { "plugins": ["Network"] } }).to_string())
            .unwrap();

        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "method": "deinit", "params": { "plugin": "Crash" } })
        );
        assert_eq!(
            next_frame(&mut rx).await,
            json!({ "method": "init", "params": { "plugin": "Network" } })
        );
        assert_eq!(conn.supported_plugins(), vec!["Network".to_string()]);
        assert!(!conn.channels().is_started("Crash"));
    }

    #[tokio::test]
    async fn test_watch_state_follows_lifecycle() {
        let (conn, mut rx) = connect();
        let states = conn.watch_state();
        assert_eq!(*states.borrow(), ConnectionState::Pending);
        open_ready(&conn, &mut rx, &[]).await;
        assert_eq!(*states.borrow(), ConnectionState::Ready);
        conn.disconnect();
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let (transport, _rx) = ChannelTransport::new();
        let result = Connection::new(
            ConnectionId::new(),
            ClientQuery::new("", "Android", "d", "s"),
            Arc::new(transport),
            Context::new(Config::default()),
        );
        assert!(matches!(result, Err(IdentityError::EmptyField("app"))));
    }
}
