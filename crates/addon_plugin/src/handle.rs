use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::addon::CallbackOutput;
use crate::addon_actor::{AddonEvent, LocalAddon};
use crate::error::HostError;
use crate::message::{AddonInfo, CallbackHeader, LifecycleSignal};
use crate::worker_proxy::RemoteAddon;

/// What the host can do with an addon, wherever it runs.
#[async_trait]
pub trait AddonHandleType: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn is_remote(&self) -> bool;
    /// `{name, callbacks, lockOn}`; a handshake for remote addons.
    async fn info(&self) -> Result<AddonInfo, HostError>;
    async fn execute(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, HostError>;
    async fn signal(&self, signal: LifecycleSignal) -> Result<(), HostError>;
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AddonEvent>>;
    async fn shutdown(&self);
}

#[derive(Clone)]
pub enum AddonHandle {
    Local(LocalAddon),
    Remote(RemoteAddon),
}

#[async_trait]
impl AddonHandleType for AddonHandle {
    fn name(&self) -> &str {
        match self {
            AddonHandle::Local(addon) => addon.name(),
            AddonHandle::Remote(addon) => addon.name(),
        }
    }

    fn is_remote(&self) -> bool {
        matches!(self, AddonHandle::Remote(_))
    }

    async fn info(&self) -> Result<AddonInfo, HostError> {
        match self {
            AddonHandle::Local(addon) => Ok(addon.info()),
            AddonHandle::Remote(addon) => addon.handshake().await,
        }
    }

    async fn execute(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, HostError> {
        match self {
            AddonHandle::Local(addon) => addon.execute(callback, header, args).await,
            AddonHandle::Remote(addon) => addon.call(callback, header, args).await,
        }
    }

    async fn signal(&self, signal: LifecycleSignal) -> Result<(), HostError> {
        match self {
            AddonHandle::Local(addon) => addon.signal(signal),
            AddonHandle::Remote(addon) => addon.signal(signal).await,
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AddonEvent>> {
        match self {
            AddonHandle::Local(addon) => addon.take_events(),
            AddonHandle::Remote(addon) => addon.take_events(),
        }
    }

    async fn shutdown(&self) {
        match self {
            AddonHandle::Local(addon) => addon.shutdown(),
            AddonHandle::Remote(addon) => addon.shutdown().await,
        }
    }
}

impl std::fmt::Debug for AddonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_remote() { "Remote" } else { "Local" };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}
