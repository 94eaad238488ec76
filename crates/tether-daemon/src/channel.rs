//! Plugin channel registry.
//!
//! Each plugin id on a connection owns one channel: a FIFO [`MessageQueue`],
//! an optional mounted handler and the started flag. Events for a plugin go
//! to the handler if one is mounted, otherwise into the queue; never both.
//! Attaching a handler drains the queue into it under the same lock that
//! `route` takes, so a live event can never overtake a queued one.
//!
//! Handlers run while that lock is held and must not call back into the same
//! registry. Consumers that need to should use [`PluginChannels::subscribe`],
//! which hands events over through an mpsc channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tether_rpc::PluginCall;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::ConnectionError;
use crate::queue::MessageQueue;

/// What a plugin consumer observes.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginSignal {
    Event(PluginCall),
    /// Terminal: the connection is gone and no further events will arrive
    Disconnected,
}

/// Receiver of a plugin's events while its UI is mounted.
pub trait PluginHandler: Send {
    fn on_event(&mut self, event: PluginCall);

    fn on_disconnected(&mut self) {}
}

impl<F> PluginHandler for F
where
    F: FnMut(PluginSignal) + Send,
{
    fn on_event(&mut self, event: PluginCall) {
        self(PluginSignal::Event(event));
    }

    fn on_disconnected(&mut self) {
        self(PluginSignal::Disconnected);
    }
}

/// Handler that forwards into a [`PluginSubscription`].
struct ForwardingHandler {
    sender: mpsc::UnboundedSender<PluginSignal>,
}

impl PluginHandler for ForwardingHandler {
    fn on_event(&mut self, event: PluginCall) {
        let _ = self.sender.send(PluginSignal::Event(event));
    }

    fn on_disconnected(&mut self) {
        let _ = self.sender.send(PluginSignal::Disconnected);
    }
}

/// Identifies one installed handler; detaching by token is a no-op once a
/// newer handler replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerToken {
    plugin_id: String,
    generation: u64,
}

impl HandlerToken {
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

/// Where a routed event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Queued,
    /// The registry was torn down with its connection
    Discarded,
}

/// Observability counters for one plugin channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelStats {
    pub plugin_id: String,
    pub queued: usize,
    pub enqueued_total: u64,
    pub delivered_total: u64,
    pub dropped_total: u64,
    pub bytes_received: u64,
    pub started: bool,
    pub has_handler: bool,
}

struct InstalledHandler {
    generation: u64,
    handler: Box<dyn PluginHandler>,
}

struct PluginChannel {
    queue: MessageQueue,
    handler: Option<InstalledHandler>,
    started: bool,
    delivered_total: u64,
    bytes_received: u64,
}

impl PluginChannel {
    fn new(plugin_id: &str, max_queue_size: Option<usize>) -> Self {
        Self {
            queue: MessageQueue::new(plugin_id, max_queue_size),
            handler: None,
            started: false,
            delivered_total: 0,
            bytes_received: 0,
        }
    }

    fn stats(&self, plugin_id: &str) -> ChannelStats {
        ChannelStats {
            plugin_id: plugin_id.to_string(),
            queued: self.queue.len(),
            enqueued_total: self.queue.enqueued_total(),
            delivered_total: self.delivered_total,
            dropped_total: self.queue.dropped_total(),
            bytes_received: self.bytes_received,
            started: self.started,
            has_handler: self.handler.is_some(),
        }
    }
}

#[derive(Default)]
struct Channels {
    by_plugin: HashMap<String, PluginChannel>,
    next_generation: u64,
    closed: bool,
}

pub struct PluginChannels {
    inner: Mutex<Channels>,
    max_queue_size: Option<usize>,
}

impl std::fmt::Debug for PluginChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.lock();
        f.debug_struct("PluginChannels")
            .field("plugins", &channels.by_plugin.keys().collect::<Vec<_>>())
            .field("closed", &channels.closed)
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}

impl PluginChannels {
    #[must_use]
    pub fn new(max_queue_size: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Channels::default()),
            max_queue_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel<'a>(&self, channels: &'a mut Channels, plugin_id: &str) -> &'a mut PluginChannel {
        channels
            .by_plugin
            .entry(plugin_id.to_string())
            .or_insert_with(|| PluginChannel::new(plugin_id, self.max_queue_size))
    }

    /// Deliver to the mounted handler or queue for later.
    pub fn route(&self, plugin_id: &str, event: PluginCall) -> RouteOutcome {
        let mut channels = self.lock();
        if channels.closed {
            debug!("[{}] Discarding {} after disconnect", plugin_id, event.method);
            return RouteOutcome::Discarded;
        }
        let channel = self.channel(&mut channels, plugin_id);
        if let Some(installed) = channel.handler.as_mut() {
            installed.handler.on_event(event);
            channel.delivered_total += 1;
            RouteOutcome::Delivered
        } else {
            trace!("[{}] Queueing {}", plugin_id, event.method);
            channel.queue.push(event);
            RouteOutcome::Queued
        }
    }

    pub fn record_received_bytes(&self, plugin_id: &str, bytes: usize) {
        let mut channels = self.lock();
        let channel = self.channel(&mut channels, plugin_id);
        channel.bytes_received += bytes as u64;
    }

    /// Mount a handler, first replaying every queued event into it.
    ///
    /// Replaces any handler already mounted for the plugin. On a torn-down
    /// registry the handler only receives the terminal disconnect signal.
    pub fn attach_handler(
        &self,
        plugin_id: &str,
        mut handler: impl PluginHandler + 'static,
    ) -> HandlerToken {
        let mut channels = self.lock();
        channels.next_generation += 1;
        let generation = channels.next_generation;
        let token = HandlerToken {
            plugin_id: plugin_id.to_string(),
            generation,
        };

        if channels.closed {
            handler.on_disconnected();
            return token;
        }

        let channel = self.channel(&mut channels, plugin_id);
        let mut replayed = 0u64;
        for event in channel.queue.drain() {
            handler.on_event(event);
            replayed += 1;
        }
        channel.delivered_total += replayed;
        channel.handler = Some(InstalledHandler {
            generation,
            handler: Box::new(handler),
        });
        debug!("[{}] Handler attached, replayed {} queued events", plugin_id, replayed);
        token
    }

    /// Mount an mpsc-backed handler; dropping the subscription detaches it.
    pub fn subscribe(self: &Arc<Self>, plugin_id: &str) -> PluginSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = self.attach_handler(plugin_id, ForwardingHandler { sender });
        PluginSubscription {
            token,
            receiver,
            channels: Arc::downgrade(self),
        }
    }

    /// Unmount the plugin's handler; later events queue again.
    pub fn detach_handler(&self, plugin_id: &str) -> bool {
        let mut channels = self.lock();
        let detached = channels
            .by_plugin
            .get_mut(plugin_id)
            .and_then(|channel| channel.handler.take())
            .is_some();
        if detached {
            debug!("[{}] Handler detached", plugin_id);
        }
        detached
    }

    /// Unmount the handler only if it is still the one `token` refers to.
    pub fn detach(&self, token: &HandlerToken) -> bool {
        let mut channels = self.lock();
        let Some(channel) = channels.by_plugin.get_mut(&token.plugin_id) else {
            return false;
        };
        if channel
            .handler
            .as_ref()
            .is_some_and(|installed| installed.generation == token.generation)
        {
            channel.handler = None;
            debug!("[{}] Handler detached", token.plugin_id);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn has_handler(&self, plugin_id: &str) -> bool {
        self.lock()
            .by_plugin
            .get(plugin_id)
            .is_some_and(|channel| channel.handler.is_some())
    }

    /// Record that a start command is being sent for the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::DuplicatePluginStart`] if it was already
    /// started on this connection.
    pub fn try_mark_started(&self, plugin_id: &str) -> Result<(), ConnectionError> {
        let mut channels = self.lock();
        let channel = self.channel(&mut channels, plugin_id);
        if channel.started {
            return Err(ConnectionError::DuplicatePluginStart(plugin_id.to_string()));
        }
        channel.started = true;
        Ok(())
    }

    /// Idempotent form of [`try_mark_started`](Self::try_mark_started):
    /// returns `true` only the first time.
    pub fn mark_plugin_started(&self, plugin_id: &str) -> bool {
        self.try_mark_started(plugin_id).is_ok()
    }

    /// Clear the started flag after a stop command, so a later start is
    /// allowed again. Returns whether the plugin was started.
    pub fn mark_plugin_stopped(&self, plugin_id: &str) -> bool {
        let mut channels = self.lock();
        channels
            .by_plugin
            .get_mut(plugin_id)
            .is_some_and(|channel| std::mem::replace(&mut channel.started, false))
    }

    #[must_use]
    pub fn is_started(&self, plugin_id: &str) -> bool {
        self.lock()
            .by_plugin
            .get(plugin_id)
            .is_some_and(|channel| channel.started)
    }

    #[must_use]
    pub fn started_plugins(&self) -> Vec<String> {
        let mut started: Vec<String> = self
            .lock()
            .by_plugin
            .iter()
            .filter(|(_, channel)| channel.started)
            .map(|(id, _)| id.clone())
            .collect();
        started.sort();
        started
    }

    #[must_use]
    pub fn queue_len(&self, plugin_id: &str) -> usize {
        self.lock()
            .by_plugin
            .get(plugin_id)
            .map_or(0, |channel| channel.queue.len())
    }

    /// Drop a plugin's queued events without delivering them.
    pub fn discard_queue(&self, plugin_id: &str) -> usize {
        self.lock()
            .by_plugin
            .get_mut(plugin_id)
            .map_or(0, |channel| channel.queue.clear())
    }

    #[must_use]
    pub fn stats(&self, plugin_id: &str) -> Option<ChannelStats> {
        self.lock()
            .by_plugin
            .get(plugin_id)
            .map(|channel| channel.stats(plugin_id))
    }

    #[must_use]
    pub fn all_stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<ChannelStats> = self
            .lock()
            .by_plugin
            .iter()
            .map(|(id, channel)| channel.stats(id))
            .collect();
        stats.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        stats
    }

    /// Tear down: every mounted handler gets the terminal signal, queues are
    /// discarded and nothing is accepted afterwards. Idempotent.
    pub fn disconnect_all(&self) {
        let mut channels = self.lock();
        if channels.closed {
            return;
        }
        channels.closed = true;
        for (plugin_id, channel) in &mut channels.by_plugin {
            let discarded = channel.queue.clear();
            if discarded > 0 {
                debug!("[{}] Discarded {} queued events on disconnect", plugin_id, discarded);
            }
            if let Some(mut installed) = channel.handler.take() {
                installed.handler.on_disconnected();
            }
            channel.started = false;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Observer registration for one plugin; detaches on drop.
#[derive(Debug)]
pub struct PluginSubscription {
    token: HandlerToken,
    receiver: mpsc::UnboundedReceiver<PluginSignal>,
    channels: Weak<PluginChannels>,
}

impl PluginSubscription {
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        self.token.plugin_id()
    }

    /// Next signal; `None` once the subscription was replaced or the
    /// connection dropped.
    pub async fn recv(&mut self) -> Option<PluginSignal> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PluginSignal> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for PluginSubscription {
    fn drop(&mut self) {
        if let Some(channels) = self.channels.upgrade() {
            channels.detach(&self.token);
        }
    }
}
