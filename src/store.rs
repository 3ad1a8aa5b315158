//! Named variables, subscriber sets, and the local shadow.
//!
//! The store is the broker's source of truth: one [`Variable`] per name,
//! holding the last published value and the set of remote addresses that
//! asked to receive it. The local shadow mirrors values for in-process
//! consumers; it is a separate map on purpose, since local consumption
//! never joins a variable's remote subscriber set.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::protocol::{self, Packet, Value};

#[derive(Debug)]
struct Variable {
    value: Value,
    subscribers: HashSet<SocketAddr>,
}

impl Variable {
    fn new() -> Self {
        Self {
            value: Value::Unknown,
            subscribers: HashSet::new(),
        }
    }
}

/// Everything needed to deliver one publish to its remote audience: the
/// re-encoded datagram (built from the variable's now-current stored value,
/// so every recipient sees identical bytes) and the subscriber addresses.
/// The broker filters the addresses against the live peer table before
/// sending.
#[derive(Debug)]
pub struct FanOut {
    pub datagram: Vec<u8>,
    pub recipients: Vec<SocketAddr>,
}

/// Variables and local shadow values. Variables are created lazily on first
/// subscribe or first publish and never deleted.
#[derive(Debug, Default)]
pub struct VariableStore {
    variables: HashMap<String, Variable>,
    shadow: HashMap<String, f64>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a remote address to the variable's subscriber set, creating the
    /// variable if absent. Repeat subscriptions are no-ops.
    pub fn subscribe_remote(&mut self, addr: SocketAddr, name: &str) {
        self.variables
            .entry(name.to_string())
            .or_insert_with(Variable::new)
            .subscribers
            .insert(addr);
    }

    /// Ensures a shadow entry and the variable exist for an in-process
    /// consumer. Does not touch the remote subscriber set.
    pub fn subscribe_local(&mut self, name: &str) {
        self.variables
            .entry(name.to_string())
            .or_insert_with(Variable::new);
        self.shadow.entry(name.to_string()).or_insert(0.0);
    }

    /// Last shadow value for `name`; 0.0 for names never locally
    /// subscribed.
    pub fn read(&self, name: &str) -> f64 {
        self.shadow.get(name).copied().unwrap_or(0.0)
    }

    /// Overwrites the variable's value (last-writer-wins, type tag
    /// included), mirrors it into an existing shadow entry, and returns the
    /// fan-out plan for the broker to execute.
    pub fn apply_publish(&mut self, name: &str, value: Value) -> FanOut {
        let variable = self
            .variables
            .entry(name.to_string())
            .or_insert_with(Variable::new);
        variable.value = value;

        if let Some(local) = self.shadow.get_mut(name) {
            *local = variable.value.as_f64();
        }

        FanOut {
            datagram: protocol::encode(&Packet::Publish {
                name: name.to_string(),
                value: variable.value,
            }),
            recipients: variable.subscribers.iter().copied().collect(),
        }
    }

    /// Resets the variable's numeric payload to zero, leaving its type tag
    /// and subscriber set alone, and zeroes the shadow entry if one exists.
    /// Subscribers are not notified of a clear.
    pub fn clear(&mut self, name: &str) {
        if let Some(variable) = self.variables.get_mut(name) {
            variable.value = variable.value.cleared();
        }
        if let Some(local) = self.shadow.get_mut(name) {
            *local = 0.0;
        }
    }

    /// Removes an expired peer from every subscriber set.
    pub fn prune_subscriber(&mut self, addr: &SocketAddr) {
        for variable in self.variables.values_mut() {
            variable.subscribers.remove(addr);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscribers(&self, name: &str) -> usize {
        self.variables
            .get(name)
            .map_or(0, |variable| variable.subscribers.len())
    }

    #[cfg(test)]
    pub(crate) fn value(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|variable| variable.value)
    }
}
