//! Hosts: the documents that use a cache and receive update notifications.
//!
//! Hosts are grouped by frontend; a notification reaches each frontend once
//! with the list of its affected hosts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use stowage_core::{ErrorDetails, EventId};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// One notification delivered to hosts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Status(EventId),
    /// `url` is empty for the final progress event.
    Progress {
        url: String,
        total: u64,
        complete: u64,
    },
    Error(ErrorDetails),
}

impl HostEvent {
    pub fn event_id(&self) -> EventId {
        match self {
            HostEvent::Status(id) => *id,
            HostEvent::Progress { .. } => EventId::Progress,
            HostEvent::Error(_) => EventId::Error,
        }
    }
}

/// Receiver of notifications for a set of hosts.
pub trait HostFrontend: Send + Sync {
    fn on_event(&self, hosts: &[HostId], event: &HostEvent);
}

/// Frontend forwarding every notification into a channel.
pub struct ChannelFrontend {
    tx: mpsc::UnboundedSender<(Vec<HostId>, HostEvent)>,
}

impl ChannelFrontend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Vec<HostId>, HostEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl HostFrontend for ChannelFrontend {
    fn on_event(&self, hosts: &[HostId], event: &HostEvent) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send((hosts.to_vec(), event.clone()));
    }
}

/// A host together with the frontend that serves it.
#[derive(Clone)]
pub struct HostHandle {
    pub id: HostId,
    frontend: Arc<dyn HostFrontend>,
}

impl HostHandle {
    pub fn new(id: HostId, frontend: Arc<dyn HostFrontend>) -> Self {
        Self { id, frontend }
    }

    fn frontend_key(&self) -> usize {
        Arc::as_ptr(&self.frontend) as *const () as usize
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for HostHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Deliver `event` to every host, once per distinct frontend.
pub fn notify_hosts(hosts: &[HostHandle], event: &HostEvent) {
    let mut by_frontend: BTreeMap<usize, (Arc<dyn HostFrontend>, Vec<HostId>)> = BTreeMap::new();
    for host in hosts {
        let (_, ids) = by_frontend
            .entry(host.frontend_key())
            .or_insert_with(|| (host.frontend.clone(), Vec::new()));
        if !ids.contains(&host.id) {
            ids.push(host.id);
        }
    }
    for (frontend, ids) in by_frontend.into_values() {
        frontend.on_event(&ids, event);
    }
}
