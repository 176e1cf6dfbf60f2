use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Value, json};

use crate::addon::{Addon, AddonContext, CallbackOutput, Reply};
use crate::error::AddonError;
use crate::message::{AddonInfo, CallbackHeader};

/// What a scripted callback does when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Returns its first argument.
    Echo,
    /// Returns the given chunks as a stream.
    Stream(Vec<Value>),
    /// Fails with the message.
    Fail(String),
    /// Returns `{"error": message}`.
    AppError(String),
    /// Waits, then returns the value.
    Delay(Duration, Value),
    Panic,
    /// Calls `args[0]` with the remaining args and returns the result.
    Forward,
    /// Streams the chunks, then fails with the message.
    BrokenStream(Vec<Value>, String),
    /// Streams the chunks, then panics.
    PanickingStream(Vec<Value>),
}

/// How often each lifecycle hook ran.
#[derive(Debug, Default)]
pub struct LifecycleCounters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub sleeps: AtomicUsize,
    pub awakes: AtomicUsize,
    pub loaded: Mutex<Vec<String>>,
}

impl LifecycleCounters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
    pub fn awakes(&self) -> usize {
        self.awakes.load(Ordering::SeqCst)
    }
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

/// Addon whose callbacks and lifecycle are configured by the test.
pub struct ScriptedAddon {
    info: AddonInfo,
    behaviors: HashMap<String, Behavior>,
    fail_start: bool,
    start_delay: Duration,
    counters: Arc<LifecycleCounters>,
    ctx: Mutex<Option<AddonContext>>,
}

impl ScriptedAddon {
    pub fn new(name: &str) -> Self {
        Self {
            info: AddonInfo::new(name),
            behaviors: HashMap::new(),
            fail_start: false,
            start_delay: Duration::ZERO,
            counters: Arc::new(LifecycleCounters::default()),
            ctx: Mutex::new(None),
        }
    }

    pub fn with_callback(mut self, name: &str, behavior: Behavior) -> Self {
        self.info = self.info.with_callback(name, None);
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    pub fn lock_on(mut self, dependency: &str) -> Self {
        self.info = self.info.with_lock_on(dependency);
        self
    }

    pub fn requires_core(mut self, requirement: &str) -> Self {
        self.info = self.info.with_core_version(requirement);
        self
    }

    /// Report a different name than the one it is registered under.
    pub fn reporting_name(mut self, name: &str) -> Self {
        self.info.name = name.to_string();
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn counters(&self) -> Arc<LifecycleCounters> {
        self.counters.clone()
    }

    pub fn context(&self) -> Option<AddonContext> {
        self.ctx.lock().ok().and_then(|c| c.clone())
    }

    /// Call another addon through the host, as the addon itself would.
    pub fn call(&self, target: &str, args: Vec<Value>) -> Option<Reply> {
        self.context().map(|ctx| ctx.send_message(target, args))
    }
}

#[async_trait]
impl Addon for ScriptedAddon {
    fn info(&self) -> AddonInfo {
        self.info.clone()
    }

    async fn start(&self, ctx: AddonContext) -> Result<(), AddonError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut slot) = self.ctx.lock() {
            *slot = Some(ctx);
        }
        if self.fail_start {
            return Err(AddonError::Failed(format!("{} refused to start", self.info.name)));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AddonError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sleep(&self) -> Result<(), AddonError> {
        self.counters.sleeps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn awake(&self) -> Result<(), AddonError> {
        self.counters.awakes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn addon_loaded(&self, name: &str) {
        if let Ok(mut loaded) = self.counters.loaded.lock() {
            loaded.push(name.to_string());
        }
    }

    async fn execute_callback(
        &self,
        callback: &str,
        _header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, AddonError> {
        let Some(behavior) = self.behaviors.get(callback) else {
            return Err(AddonError::UnknownCallback(callback.to_string()));
        };
        match behavior {
            Behavior::Echo => Ok(CallbackOutput::Value(args.into_iter().next().unwrap_or(Value::Null))),
            Behavior::Stream(chunks) => Ok(CallbackOutput::chunks(chunks.clone())),
            Behavior::BrokenStream(chunks, message) => {
                let items: Vec<Result<Value, AddonError>> = chunks
                    .iter()
                    .cloned()
                    .map(Ok)
                    .chain(std::iter::once(Err(AddonError::Failed(message.clone()))))
                    .collect();
                Ok(CallbackOutput::try_stream(stream::iter(items)))
            }
            Behavior::PanickingStream(chunks) => {
                let items = chunks.iter().cloned().map(Some).chain(std::iter::once(None));
                let items: Vec<Option<Value>> = items.collect();
                Ok(CallbackOutput::stream(stream::iter(items).map(|chunk| match chunk {
                    Some(value) => value,
                    None => panic!("scripted panic in stream"),
                })))
            }
            Behavior::Fail(message) => Err(AddonError::Failed(message.clone())),
            Behavior::AppError(message) => Ok(CallbackOutput::Value(json!({ "error": message }))),
            Behavior::Delay(delay, value) => {
                tokio::time::sleep(*delay).await;
                Ok(CallbackOutput::Value(value.clone()))
            }
            Behavior::Panic => panic!("scripted panic in {callback}"),
            Behavior::Forward => {
                let mut args = args.into_iter();
                let target = args
                    .next()
                    .and_then(|t| t.as_str().map(str::to_string))
                    .ok_or_else(|| AddonError::Failed("forward needs a target".into()))?;
                let reply = self
                    .call(&target, args.collect())
                    .ok_or_else(|| AddonError::Failed("not started".into()))?;
                Ok(CallbackOutput::Value(reply.value().await?))
            }
        }
    }
}
