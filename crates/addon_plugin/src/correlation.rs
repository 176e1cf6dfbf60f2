use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::addon::CallbackOutput;
use crate::error::HostError;
use crate::message::Delivery;

pub type CallResult = Result<CallbackOutput, HostError>;

enum Resolver {
    /// No response frame seen yet.
    Waiting(oneshot::Sender<CallResult>),
    /// First chunk arrived; the caller holds the other end as a stream.
    Streaming(mpsc::UnboundedSender<Result<Value, HostError>>),
}

struct PendingCall {
    created_at: Instant,
    resolver: Resolver,
}

/// Pending calls sent to a worker, keyed by message id.
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<String, PendingCall>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call. Ids are never reused, so a duplicate is a protocol error.
    pub fn register(&self, message_id: &str) -> Result<oneshot::Receiver<CallResult>, HostError> {
        match self.pending.entry(message_id.to_string()) {
            Entry::Occupied(_) => Err(HostError::Protocol(format!(
                "message id {message_id} is already in flight"
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall { created_at: Instant::now(), resolver: Resolver::Waiting(tx) });
                Ok(rx)
            }
        }
    }

    /// Hand a delivery to the pending caller. Returns `false` when no call
    /// with this id is pending, in which case the delivery is dropped.
    pub fn resolve(&self, message_id: &str, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Chunk(chunk) => {
                let Some(mut pending) = self.pending.get_mut(message_id) else {
                    debug!(message_id, "dropping chunk for unknown call");
                    return false;
                };
                if let Resolver::Streaming(tx) = &pending.resolver {
                    let _ = tx.send(Ok(chunk));
                    return true;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(Ok(chunk));
                let previous = std::mem::replace(&mut pending.resolver, Resolver::Streaming(tx));
                if let Resolver::Waiting(waiter) = previous {
                    let _ = waiter.send(Ok(CallbackOutput::try_stream(receiver_stream(rx))));
                }
                true
            }
            Delivery::Completed => match self.pending.remove(message_id) {
                Some((_, pending)) => {
                    if let Resolver::Waiting(waiter) = pending.resolver {
                        let _ = waiter.send(Ok(CallbackOutput::chunks(Vec::new())));
                    }
                    true
                }
                None => {
                    debug!(message_id, "dropping completion for unknown call");
                    false
                }
            },
            Delivery::Body(body) => match self.pending.remove(message_id) {
                Some((_, pending)) => {
                    match pending.resolver {
                        Resolver::Waiting(waiter) => {
                            let _ = waiter.send(Ok(CallbackOutput::Value(body)));
                        }
                        Resolver::Streaming(tx) => {
                            let _ = tx.send(Ok(body));
                        }
                    }
                    true
                }
                None => {
                    debug!(message_id, "dropping late response");
                    false
                }
            },
            Delivery::Error(error) => match self.pending.remove(message_id) {
                Some((_, pending)) => {
                    match pending.resolver {
                        Resolver::Waiting(waiter) => {
                            let _ = waiter.send(Err(HostError::Callback(error)));
                        }
                        Resolver::Streaming(tx) => {
                            warn!(message_id, %error, "stream ended with an error");
                            let _ = tx.send(Err(HostError::Callback(error)));
                        }
                    }
                    true
                }
                None => {
                    debug!(message_id, "dropping late error");
                    false
                }
            },
        }
    }

    /// Forget a call, e.g. after its deadline passed. Returns how long it was pending.
    pub fn remove(&self, message_id: &str) -> Option<Duration> {
        self.pending
            .remove(message_id)
            .map(|(_, pending)| pending.created_at.elapsed())
    }

    /// Fail every pending call, open streams included; used when the worker
    /// goes away.
    pub fn fail_all(&self, addon: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let closed = HostError::ChannelClosed(addon.to_string());
                match pending.resolver {
                    Resolver::Waiting(waiter) => {
                        let _ = waiter.send(Err(closed));
                    }
                    Resolver::Streaming(tx) => {
                        let _ = tx.send(Err(closed));
                    }
                }
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn receiver_stream(
    rx: mpsc::UnboundedReceiver<Result<Value, HostError>>,
) -> impl futures::Stream<Item = Result<Value, HostError>> + Send + 'static {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) })
}
