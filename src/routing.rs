use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use addon_plugin::{AddonHandle, AddonHandleType, CallbackHeader, CallbackOutput, HostError};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

/// `"<addon>.<callback>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetAddress {
    pub addon: String,
    pub callback: String,
}

impl TargetAddress {
    pub fn new(addon: impl Into<String>, callback: impl Into<String>) -> Self {
        Self { addon: addon.into(), callback: callback.into() }
    }

    pub fn parse(address: &str) -> Option<Self> {
        let (addon, callback) = address.split_once('.')?;
        if addon.is_empty() || callback.is_empty() {
            return None;
        }
        Some(Self::new(addon, callback))
    }
}

impl FromStr for TargetAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("'{s}' is not an <addon>.<callback> address"))
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.addon, self.callback)
    }
}

/// All routes of one started addon.
#[derive(Debug, Clone)]
struct RouteSet {
    handle: AddonHandle,
    callbacks: BTreeSet<String>,
}

/// A resolved target, ready to invoke.
#[derive(Debug, Clone)]
pub struct Route {
    pub address: TargetAddress,
    handle: AddonHandle,
}

impl Route {
    pub fn handle(&self) -> &AddonHandle {
        &self.handle
    }

    pub async fn invoke(
        &self,
        message_id: &str,
        from: &str,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, HostError> {
        let header = CallbackHeader::new(message_id, from);
        self.handle.execute(&self.address.callback, header, args).await
    }
}

/// Target address to callback handle, live only while the owning addon is started.
///
/// An addon's routes are kept as one set, so installing or removing them is a
/// single map write and lookups never see half of them.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: DashMap<String, RouteSet>,
    installed: Notify,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every callback of `handle`. Installing again replaces the set.
    pub fn install<I, S>(&self, handle: AddonHandle, callbacks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = handle.name().to_string();
        let callbacks: BTreeSet<String> = callbacks.into_iter().map(Into::into).collect();
        debug!(addon = %name, count = callbacks.len(), "installing routes");
        self.routes.insert(name, RouteSet { handle, callbacks });
        self.installed.notify_waiters();
    }

    /// Drop all routes of `addon`; `true` if it had any.
    pub fn remove(&self, addon: &str) -> bool {
        let removed = self.routes.remove(addon).is_some();
        if removed {
            debug!(addon, "routes removed");
        }
        removed
    }

    pub fn lookup(&self, address: &TargetAddress) -> Option<Route> {
        let set = self.routes.get(&address.addon)?;
        if !set.callbacks.contains(&address.callback) {
            return None;
        }
        Some(Route { address: address.clone(), handle: set.handle.clone() })
    }

    pub fn resolve(&self, address: &str) -> Option<Route> {
        TargetAddress::parse(address).and_then(|a| self.lookup(&a))
    }

    /// Number of routes owned by `addon`.
    pub fn count_for(&self, addon: &str) -> usize {
        self.routes.get(addon).map(|set| set.callbacks.len()).unwrap_or(0)
    }

    pub fn targets(&self) -> Vec<TargetAddress> {
        let mut targets: Vec<TargetAddress> = self
            .routes
            .iter()
            .flat_map(|entry| {
                let addon = entry.key().clone();
                entry
                    .value()
                    .callbacks
                    .iter()
                    .map(|cb| TargetAddress::new(addon.clone(), cb.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        targets.sort();
        targets
    }

    pub fn len(&self) -> usize {
        self.routes.iter().map(|set| set.callbacks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes on the next install. Enable it before checking the table.
    pub fn changed(&self) -> Notified<'_> {
        self.installed.notified()
    }
}
