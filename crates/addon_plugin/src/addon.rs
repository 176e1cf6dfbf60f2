use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{AddonError, HostError};
use crate::message::{AddonInfo, CallbackHeader, Delivery};

// -----------------------------------------------------------------------------
// Addon trait – implement this in your addon code
// -----------------------------------------------------------------------------

/// Capability contract of an addon.
///
/// The same implementation runs in-process (wrapped by
/// [`LocalAddon`](crate::addon_actor::LocalAddon)) or inside a worker
/// process (driven by [`worker_runtime`](crate::worker_runtime)).
#[async_trait]
pub trait Addon: Send + Sync + 'static {
    /// Name, callbacks and dependencies of this addon.
    fn info(&self) -> AddonInfo;

    /// Called once per start transition. Keep `ctx` to call other addons.
    async fn start(&self, ctx: AddonContext) -> Result<(), AddonError> {
        let _ = ctx;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AddonError> {
        Ok(())
    }

    /// One of the addons in `lockOn` stopped.
    async fn sleep(&self) -> Result<(), AddonError> {
        Ok(())
    }

    async fn awake(&self) -> Result<(), AddonError> {
        Ok(())
    }

    /// Another addon finished starting.
    async fn addon_loaded(&self, name: &str) {
        let _ = name;
    }

    async fn execute_callback(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, AddonError>;
}

/// Chunks of a streamed result. An `Err` item ends the stream as failed.
pub type ChunkStream = BoxStream<'static, Result<Value, HostError>>;

/// Result of a callback: a single value or a lazily produced sequence.
pub enum CallbackOutput {
    Value(Value),
    Stream(ChunkStream),
}

impl CallbackOutput {
    pub fn stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        CallbackOutput::Stream(chunks.map(Ok).boxed())
    }

    /// A stream whose production can fail partway through.
    pub fn try_stream<S, E>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Value, E>> + Send + 'static,
        E: Into<HostError>,
    {
        CallbackOutput::Stream(chunks.map(|chunk| chunk.map_err(Into::into)).boxed())
    }

    pub fn chunks(chunks: Vec<Value>) -> Self {
        Self::stream(stream::iter(chunks))
    }
}

impl fmt::Debug for CallbackOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CallbackOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// -----------------------------------------------------------------------------
// Outbound calls
// -----------------------------------------------------------------------------

/// Receives the deliveries that answer one outbound call.
pub trait ReplySink: Send + Sync {
    fn deliver(&self, delivery: Delivery);
}

impl ReplySink for mpsc::UnboundedSender<Delivery> {
    fn deliver(&self, delivery: Delivery) {
        // caller may have given up on the reply
        let _ = self.send(delivery);
    }
}

/// An addon asking the host to run `target` (`"<addon>.<callback>"`).
pub struct OutboundCall {
    pub message_id: String,
    pub from: String,
    pub target: String,
    pub args: Vec<Value>,
    pub reply: Arc<dyn ReplySink>,
}

impl fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCall")
            .field("message_id", &self.message_id)
            .field("from", &self.from)
            .field("target", &self.target)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Handed to [`Addon::start`]; the addon's outbound channel towards the host.
#[derive(Clone, Debug)]
pub struct AddonContext {
    name: String,
    outbound: mpsc::UnboundedSender<OutboundCall>,
}

impl AddonContext {
    pub fn new(name: impl Into<String>, outbound: mpsc::UnboundedSender<OutboundCall>) -> Self {
        Self { name: name.into(), outbound }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the host to call `target` with `args`. The reply arrives on the
    /// returned [`Reply`].
    pub fn send_message(&self, target: impl Into<String>, args: Vec<Value>) -> Reply {
        let (tx, rx) = mpsc::unbounded_channel();
        let message_id = Uuid::new_v4().to_string();
        let call = OutboundCall {
            message_id: message_id.clone(),
            from: self.name.clone(),
            target: target.into(),
            args,
            reply: Arc::new(tx),
        };
        if let Err(rejected) = self.outbound.send(call) {
            rejected
                .0
                .reply
                .deliver(Delivery::Error(format!("addon '{}' is detached from the host", self.name)));
        }
        Reply { message_id, rx }
    }
}

/// Receiving side of an outbound call.
#[derive(Debug)]
pub struct Reply {
    message_id: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Reply {
    pub fn new(message_id: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { message_id: message_id.into(), rx }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Everything up to and including the terminal delivery.
    pub async fn collect(mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Some(delivery) = self.rx.recv().await {
            let done = delivery.is_terminal();
            out.push(delivery);
            if done {
                break;
            }
        }
        out
    }

    /// Wait for the whole result. A stream is gathered into an array.
    pub async fn value(mut self) -> Result<Value, AddonError> {
        let mut chunks = Vec::new();
        while let Some(delivery) = self.rx.recv().await {
            match delivery {
                Delivery::Body(v) => return Ok(v),
                Delivery::Chunk(v) => chunks.push(v),
                Delivery::Completed => return Ok(Value::Array(chunks)),
                Delivery::Error(e) => return Err(AddonError::Failed(e)),
            }
        }
        Err(AddonError::Failed(format!("reply to {} was dropped", self.message_id)))
    }
}

/// Best effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
