pub mod addon;
pub mod addon_actor;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod message;
pub mod worker_proxy;
pub mod worker_runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use addon::{Addon, AddonContext, CallbackOutput, OutboundCall, Reply, ReplySink};
pub use addon_actor::{AddonEvent, LocalAddon};
pub use error::{AddonError, CodecError, HostError};
pub use handle::{AddonHandle, AddonHandleType};
pub use message::*;
pub use worker_proxy::{ProxyOptions, RemoteAddon, WorkerCommand};
