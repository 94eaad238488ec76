//! Correlation table for requests awaiting a response.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;
use tether_rpc::ResponseOutcome;
use tokio::sync::oneshot;

use crate::error::ConnectionError;

/// How many cancelled ids are remembered for late-response suppression
const ABANDONED_MEMORY: usize = 1024;

pub(crate) type ResponseSender = oneshot::Sender<Result<Value, ConnectionError>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Value, ConnectionError>>;

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    Delivered,
    /// The caller cancelled or gave up before the response arrived
    Abandoned,
    Unmatched,
}

#[derive(Debug)]
pub(crate) struct PendingRequests {
    next_id: u64,
    waiting: HashMap<u64, ResponseSender>,
    abandoned: HashSet<u64>,
    abandoned_order: VecDeque<u64>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self {
            next_id: 1,
            waiting: HashMap::new(),
            abandoned: HashSet::new(),
            abandoned_order: VecDeque::new(),
        }
    }
}

impl PendingRequests {
    /// Allocate the next correlation id and its response slot.
    pub(crate) fn register(&mut self) -> (u64, ResponseReceiver) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        (id, rx)
    }

    pub(crate) fn settle(&mut self, id: u64, outcome: ResponseOutcome) -> Settled {
        if let Some(tx) = self.waiting.remove(&id) {
            let result = match outcome {
                ResponseOutcome::Success(value) => Ok(value),
                ResponseOutcome::Error(error) => Err(ConnectionError::Remote(error)),
            };
            // Receiver dropped between the caller giving up and its guard running
            if tx.send(result).is_err() {
                return Settled::Abandoned;
            }
            Settled::Delivered
        } else if self.abandoned.remove(&id) {
            Settled::Abandoned
        } else {
            Settled::Unmatched
        }
    }

    /// Forget a request whose caller stopped waiting. Returns whether it was
    /// still outstanding.
    pub(crate) fn abandon(&mut self, id: u64) -> bool {
        if self.waiting.remove(&id).is_none() {
            return false;
        }
        if self.abandoned_order.len() >= ABANDONED_MEMORY
            && let Some(oldest) = self.abandoned_order.pop_front()
        {
            self.abandoned.remove(&oldest);
        }
        self.abandoned.insert(id);
        self.abandoned_order.push_back(id);
        true
    }

    /// Reject every outstanding request with `NoLongerConnected`.
    pub(crate) fn fail_all(&mut self) -> usize {
        let count = self.waiting.len();
        for (_, tx) in self.waiting.drain() {
            let _ = tx.send(Err(ConnectionError::NoLongerConnected));
        }
        self.abandoned.clear();
        self.abandoned_order.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}
