//! In-process network that carries Raft messages between nodes.
//!
//! Every node talks through an [`Endpoint`] with a unique address. Delivery
//! from `a` to `b` only happens after `connect(a, b)` registered that
//! direction; anything else is dropped, which is how a stopped node is cut
//! off from the rest of the cluster.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};
use nanoid::nanoid;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Address of an endpoint in the fabric. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    fn generate() -> Self {
        Self(format!("inmem://{}", nanoid!()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Default)]
struct Links {
    inboxes: HashMap<Address, Sender<Message>>,
    /// `from -> {to}` for every registered direction.
    routes: HashMap<Address, HashSet<Address>>,
}

/// Shared handle to the fabric. Cloning is cheap.
#[derive(Clone, Default)]
pub struct Fabric {
    links: Arc<Mutex<Links>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh, unconnected endpoint.
    pub fn new_endpoint(&self) -> (Address, Endpoint) {
        let address = Address::generate();
        let (tx, rx) = unbounded();
        self.links().inboxes.insert(address.clone(), tx);
        let endpoint = Endpoint {
            address: address.clone(),
            fabric: self.clone(),
            inbox: rx,
        };
        (address, endpoint)
    }

    /// Registers the `from -> to` direction.
    ///
    /// Returns `false` (and registers nothing) if either endpoint is gone.
    pub fn connect(&self, from: &Address, to: &Address) -> bool {
        let mut links = self.links();
        if !links.inboxes.contains_key(from) || !links.inboxes.contains_key(to) {
            return false;
        }
        links
            .routes
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        true
    }

    /// Connects two endpoints in both directions.
    pub fn connect_pair(&self, a: &Address, b: &Address) -> bool {
        self.connect(a, b) && self.connect(b, a)
    }

    /// Removes every link from and to `address` and forgets its inbox.
    pub fn disconnect(&self, address: &Address) {
        let mut links = self.links();
        links.inboxes.remove(address);
        links.routes.remove(address);
        for targets in links.routes.values_mut() {
            targets.remove(address);
        }
    }

    pub fn is_connected(&self, from: &Address, to: &Address) -> bool {
        self.links()
            .routes
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Addresses `address` can currently deliver to.
    pub fn links_from(&self, address: &Address) -> Vec<Address> {
        let mut targets: Vec<Address> = self
            .links()
            .routes
            .get(address)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    fn deliver(&self, from: &Address, to: &Address, msg: Message) -> bool {
        let links = self.links();
        let routed = links
            .routes
            .get(from)
            .is_some_and(|targets| targets.contains(to));
        if !routed {
            return false;
        }
        match links.inboxes.get(to) {
            Some(inbox) => inbox.send(msg).is_ok(),
            None => false,
        }
    }
}

/// One node's attachment to the fabric.
///
/// Dropping the endpoint unregisters its inbox, so nothing can be delivered
/// to it afterwards even if stale routes still point at it.
pub struct Endpoint {
    address: Address,
    fabric: Fabric,
    inbox: Receiver<Message>,
}

impl Endpoint {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn inbox(&self) -> &Receiver<Message> {
        &self.inbox
    }

    /// Sends a message to `to`. Unroutable messages are dropped.
    pub fn send(&self, to: &Address, msg: Message) {
        let (from_id, to_id) = (msg.from, msg.to);
        if !self.fabric.deliver(&self.address, to, msg) {
            trace!(from = from_id, to = to_id, address = %to, "dropping unroutable raft message");
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.fabric.links().inboxes.remove(&self.address);
    }
}
