//! Messenger: per-superstep message transport
//!
//! Messages sent in superstep N are buffered in the sending worker's
//! [`Outbox`], merged across workers at the barrier, and readable by their
//! recipients only during superstep N+1.

use std::collections::HashMap;

use crate::graph::{Direction, Topology};
use crate::value::VertexId;

/// Which vertices receive a message, relative to the sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageScope {
    /// Neighbours along edges in `direction`; empty `labels` matches all edges
    Local {
        direction: Direction,
        labels: Vec<String>,
    },
    /// A fixed set of vertices
    Global(Vec<VertexId>),
}

impl MessageScope {
    pub fn out(labels: &[&str]) -> Self {
        Self::local(Direction::Out, labels)
    }

    pub fn incoming(labels: &[&str]) -> Self {
        Self::local(Direction::In, labels)
    }

    pub fn both(labels: &[&str]) -> Self {
        Self::local(Direction::Both, labels)
    }

    pub fn global(ids: impl IntoIterator<Item = VertexId>) -> Self {
        Self::Global(ids.into_iter().collect())
    }

    /// Selects no vertex at all
    pub fn none() -> Self {
        Self::Global(Vec::new())
    }

    fn local(direction: Direction, labels: &[&str]) -> Self {
        Self::Local {
            direction,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// Resolve to recipient ids for `sender`
    pub fn recipients(&self, sender: VertexId, topology: &Topology) -> Vec<VertexId> {
        match self {
            MessageScope::Local { direction, labels } => {
                topology.adjacent(sender, *direction, labels)
            }
            MessageScope::Global(ids) => ids.clone(),
        }
    }
}

/// Message access for one vertex during `execute`
pub trait Messenger<M> {
    /// Messages sent to this vertex during the previous superstep
    fn receive_messages(&self) -> &[M];

    /// Send `message` to every vertex `scope` selects
    ///
    /// A scope that selects nobody is not an error; the message is dropped.
    fn send_message(&mut self, scope: &MessageScope, message: M);
}

/// Messages one worker sent during a superstep
#[derive(Debug)]
pub struct Outbox<M> {
    pending: HashMap<VertexId, Vec<M>>,
    sent: usize,
    dropped: usize,
}

impl<M> Default for Outbox<M> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            sent: 0,
            dropped: 0,
        }
    }
}

impl<M> Outbox<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued deliveries, one per recipient
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Deliveries addressed to vertices that do not exist
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fold another worker's outbox into this one
    pub fn merge(&mut self, other: Outbox<M>) {
        for (recipient, mut messages) in other.pending {
            self.pending.entry(recipient).or_default().append(&mut messages);
        }
        self.sent += other.sent;
        self.dropped += other.dropped;
    }

    /// Hand over the inboxes for the next superstep
    pub fn deliver(self) -> HashMap<VertexId, Vec<M>> {
        self.pending
    }

    fn push(&mut self, recipient: VertexId, message: M) {
        self.pending.entry(recipient).or_default().push(message);
        self.sent += 1;
    }
}

/// The [`Messenger`] the runtime gives each vertex
pub struct WorkerMessenger<'a, M> {
    vertex: VertexId,
    topology: &'a Topology,
    inbox: &'a [M],
    outbox: &'a mut Outbox<M>,
}

impl<'a, M> WorkerMessenger<'a, M> {
    pub fn new(
        vertex: VertexId,
        topology: &'a Topology,
        inbox: &'a [M],
        outbox: &'a mut Outbox<M>,
    ) -> Self {
        Self {
            vertex,
            topology,
            inbox,
            outbox,
        }
    }
}

impl<M: Clone> Messenger<M> for WorkerMessenger<'_, M> {
    fn receive_messages(&self) -> &[M] {
        self.inbox
    }

    fn send_message(&mut self, scope: &MessageScope, message: M) {
        let recipients = scope.recipients(self.vertex, self.topology);
        let Some((last, rest)) = recipients.split_last() else {
            return;
        };
        for recipient in rest {
            self.route(*recipient, message.clone());
        }
        self.route(*last, message);
    }
}

impl<M> WorkerMessenger<'_, M> {
    fn route(&mut self, recipient: VertexId, message: M) {
        if self.topology.contains(recipient) {
            self.outbox.push(recipient, message);
        } else {
            tracing::trace!(
                from = %self.vertex,
                to = %recipient,
                "dropping message to unknown vertex"
            );
            self.outbox.dropped += 1;
        }
    }
}
