//! Packet identifiers and in-flight acknowledgements.
//!
//! PUBLISH (QoS 1), SUBSCRIBE and UNSUBSCRIBE share one identifier space.
//! An identifier stays reserved until its acknowledgement arrives or the
//! caller gives up on it.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::SubscribeReturnCode;

/// Acknowledgement delivered to a waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    PubAck,
    SubAck(Vec<SubscribeReturnCode>),
    UnsubAck,
}

impl Ack {
    fn kind(&self) -> AckKind {
        match self {
            Ack::PubAck => AckKind::Publish,
            Ack::SubAck(_) => AckKind::Subscribe,
            Ack::UnsubAck => AckKind::Unsubscribe,
        }
    }
}

/// Which exchange an identifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Progress of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Queued for the transport.
    Sent,
    /// On the wire, waiting for the broker.
    AckPending,
}

type Waiter = oneshot::Sender<Result<Ack>>;

struct Entry {
    kind: AckKind,
    state: PendingState,
    waiter: Option<Waiter>,
    /// Filter carried by a SUBSCRIBE.
    filter: Option<String>,
}

struct Table {
    entries: HashMap<u16, Entry>,
    last: u16,
}

impl Table {
    fn allocate(&mut self) -> Result<u16> {
        let mut id = self.last;
        for _ in 0..u16::MAX {
            id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) {
                self.last = id;
                return Ok(id);
            }
        }
        Err(Error::PacketIdsExhausted)
    }
}

/// Table of exchanges awaiting PUBACK, SUBACK or UNSUBACK.
pub struct PendingAcks {
    table: Mutex<Table>,
}

impl Default for PendingAcks {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingAcks {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                last: 0,
            }),
        }
    }

    /// Reserve a fresh identifier and a channel that resolves on its ack.
    pub fn register(&self, kind: AckKind) -> Result<(u16, oneshot::Receiver<Result<Ack>>)> {
        let (tx, rx) = oneshot::channel();
        let pkid = self.insert(kind, Some(tx), None)?;
        Ok((pkid, rx))
    }

    /// Like [`PendingAcks::register`] for a SUBSCRIBE of `filter`, so a
    /// replay after reconnect can reuse the identifier.
    pub fn register_subscribe(&self, filter: &str) -> Result<(u16, oneshot::Receiver<Result<Ack>>)> {
        let (tx, rx) = oneshot::channel();
        let pkid = self.insert(AckKind::Subscribe, Some(tx), Some(filter.to_string()))?;
        Ok((pkid, rx))
    }

    /// A caller-issued SUBSCRIBE of `filter` still waiting for its SUBACK.
    pub fn tracked_subscribe(&self, filter: &str) -> Option<(u16, PendingState)> {
        self.table
            .lock()
            .entries
            .iter()
            .find(|(_, e)| e.waiter.is_some() && e.filter.as_deref() == Some(filter))
            .map(|(pkid, e)| (*pkid, e.state))
    }

    /// Reserve a fresh identifier nobody waits on.
    pub fn register_untracked(&self, kind: AckKind) -> Result<u16> {
        self.insert(kind, None, None)
    }

    fn insert(&self, kind: AckKind, waiter: Option<Waiter>, filter: Option<String>) -> Result<u16> {
        let mut table = self.table.lock();
        let pkid = table.allocate()?;
        table.entries.insert(
            pkid,
            Entry {
                kind,
                state: PendingState::Sent,
                waiter,
                filter,
            },
        );
        Ok(pkid)
    }

    /// Record that the packet carrying `pkid` reached the transport.
    pub fn mark_written(&self, pkid: u16) {
        if let Some(entry) = self.table.lock().entries.get_mut(&pkid) {
            entry.state = PendingState::AckPending;
        }
    }

    /// Resolve `pkid` with an acknowledgement from the broker.
    ///
    /// Returns `false` when nothing was resolved: the identifier is unknown,
    /// or it now belongs to an exchange of another kind (a late ack for an
    /// identifier that timed out and was reused). Such acks are ignored.
    pub fn complete(&self, pkid: u16, ack: Ack) -> bool {
        let entry = {
            let mut table = self.table.lock();
            let Some(kind) = table.entries.get(&pkid).map(|e| e.kind) else {
                debug!(pkid, "ack for unknown packet id");
                return false;
            };
            if kind != ack.kind() {
                warn!(pkid, ack = ?ack.kind(), held_by = ?kind, "ignoring stale ack");
                return false;
            }
            table.entries.remove(&pkid)
        };

        if let Some(waiter) = entry.and_then(|e| e.waiter) {
            // The caller may have timed out already.
            let _ = waiter.send(Ok(ack));
        }
        true
    }

    /// Drop `pkid` without resolving it, recycling the identifier.
    pub fn remove(&self, pkid: u16) -> bool {
        self.table.lock().entries.remove(&pkid).is_some()
    }

    /// Drop every entry nobody waits on.
    pub fn drop_untracked(&self) -> usize {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table.entries.retain(|_, e| e.waiter.is_some());
        before - table.entries.len()
    }

    /// Fail and drop every entry.
    pub fn fail_all<F>(&self, err: F) -> usize
    where
        F: Fn() -> Error,
    {
        let entries: Vec<Entry> = self.table.lock().entries.drain().map(|(_, e)| e).collect();
        let n = entries.len();
        for waiter in entries.into_iter().filter_map(|e| e.waiter) {
            let _ = waiter.send(Err(err()));
        }
        n
    }

    pub fn state(&self, pkid: u16) -> Option<PendingState> {
        self.table.lock().entries.get(&pkid).map(|e| e.state)
    }

    pub fn contains(&self, pkid: u16) -> bool {
        self.table.lock().entries.contains_key(&pkid)
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
