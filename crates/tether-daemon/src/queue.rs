//! Per-plugin FIFO of events waiting for a handler.
//!
//! Unbounded by default: a backgrounded plugin accumulates everything until
//! its handler attaches. With a bound, the oldest events are dropped first and
//! every drop is counted.

use std::collections::VecDeque;

use tether_rpc::PluginCall;
use tracing::warn;

#[derive(Debug)]
pub struct MessageQueue {
    plugin_id: String,
    messages: VecDeque<PluginCall>,
    max_size: Option<usize>,
    enqueued_total: u64,
    dropped_total: u64,
    overflowing: bool,
}

impl MessageQueue {
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, max_size: Option<usize>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            messages: VecDeque::new(),
            max_size,
            enqueued_total: 0,
            dropped_total: 0,
            overflowing: false,
        }
    }

    /// Append an event, returning the event dropped to make room, if any.
    pub fn push(&mut self, event: PluginCall) -> Option<PluginCall> {
        self.enqueued_total += 1;
        let dropped = match self.max_size {
            Some(max) if self.messages.len() >= max => {
                self.dropped_total += 1;
                if !self.overflowing {
                    self.overflowing = true;
                    warn!(
                        "[{}] Message queue full ({} messages), dropping oldest",
                        self.plugin_id, max
                    );
                }
                self.messages.pop_front()
            }
            _ => None,
        };
        self.messages.push_back(event);
        dropped
    }

    /// Remove every queued event in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = PluginCall> + '_ {
        self.overflowing = false;
        self.messages.drain(..)
    }

    /// Discard everything, returning how many events were dropped.
    pub fn clear(&mut self) -> usize {
        let discarded = self.messages.len();
        self.messages.clear();
        self.overflowing = false;
        discarded
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total
    }

    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginCall> {
        self.messages.iter()
    }
}
