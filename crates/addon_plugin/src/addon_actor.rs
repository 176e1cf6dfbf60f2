use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addon::{Addon, AddonContext, CallbackOutput, OutboundCall, panic_message};
use crate::error::{AddonError, HostError};
use crate::message::{AddonInfo, AddonState, CallbackHeader, LifecycleEvent, LifecycleSignal};

/// Everything an addon handle reports back to its owner.
#[derive(Debug)]
pub enum AddonEvent {
    Lifecycle(LifecycleEvent),
    Message(OutboundCall),
}

/// In-process addon driven by an actor task.
///
/// Lifecycle signals are handled one at a time by the actor, so start and
/// stop never overlap. Callbacks run on the caller's task.
#[derive(Clone)]
pub struct LocalAddon {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    addon: Arc<dyn Addon>,
    info: AddonInfo,
    signals: mpsc::UnboundedSender<LifecycleSignal>,
    events: Mutex<Option<mpsc::UnboundedReceiver<AddonEvent>>>,
    state: watch::Receiver<AddonState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalAddon {
    pub fn spawn(addon: Arc<dyn Addon>) -> Self {
        let info = addon.info();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundCall>();
        let (state_tx, state_rx) = watch::channel(AddonState::Loaded);

        let forward_tx = event_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(call) = outbound_rx.recv().await {
                if forward_tx.send(AddonEvent::Message(call)).is_err() {
                    break;
                }
            }
        });

        let actor = Actor {
            addon: addon.clone(),
            lock_on: info.lock_on.clone(),
            ctx: AddonContext::new(info.name.clone(), outbound_tx),
            events: event_tx,
            state: state_tx,
        };
        let actor = tokio::spawn(actor.run(signal_rx));

        Self {
            inner: Arc::new(LocalInner {
                addon,
                info,
                signals: signal_tx,
                events: Mutex::new(Some(event_rx)),
                state: state_rx,
                tasks: Mutex::new(vec![actor, forward]),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn info(&self) -> AddonInfo {
        self.inner.info.clone()
    }

    pub fn state(&self) -> AddonState {
        *self.inner.state.borrow()
    }

    /// Lifecycle events and outbound calls. Can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AddonEvent>> {
        self.inner.events.lock().ok()?.take()
    }

    pub fn signal(&self, signal: LifecycleSignal) -> Result<(), HostError> {
        self.inner
            .signals
            .send(signal)
            .map_err(|_| HostError::NotRunning(self.name().to_string()))
    }

    /// Run a callback. Errors and panics come back as [`HostError`].
    pub async fn execute(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, HostError> {
        let call = self.inner.addon.execute_callback(callback, header, args);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result.map_err(HostError::from),
            Err(payload) => Err(HostError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Wait until the addon reaches `wanted`; `false` on timeout.
    pub async fn wait_for(&self, wanted: AddonState, limit: Duration) -> bool {
        let mut state = self.inner.state.clone();
        tokio::time::timeout(limit, state.wait_for(|s| *s == wanted))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Actor
// -----------------------------------------------------------------------------

struct Actor {
    addon: Arc<dyn Addon>,
    lock_on: Vec<String>,
    ctx: AddonContext,
    events: mpsc::UnboundedSender<AddonEvent>,
    state: watch::Sender<AddonState>,
}

impl Actor {
    async fn run(self, mut signals: mpsc::UnboundedReceiver<LifecycleSignal>) {
        while let Some(signal) = signals.recv().await {
            let state = *self.state.borrow();
            match signal {
                LifecycleSignal::Start => match state {
                    AddonState::Started => debug!(addon = self.ctx.name(), "already started"),
                    AddonState::Sleeping => self.awake().await,
                    AddonState::Loaded | AddonState::Stopped => self.start().await,
                },
                LifecycleSignal::Stop => {
                    if state.is_running() {
                        self.stop().await;
                    } else {
                        debug!(addon = self.ctx.name(), %state, "stop ignored");
                    }
                }
                LifecycleSignal::Sleep => {
                    if state == AddonState::Started {
                        match guarded(self.addon.sleep()).await {
                            Ok(()) => {
                                self.state.send_replace(AddonState::Sleeping);
                                self.emit(LifecycleEvent::Sleep);
                            }
                            Err(e) => self.failed("sleep", e),
                        }
                    } else {
                        debug!(addon = self.ctx.name(), %state, "sleep ignored");
                    }
                }
                LifecycleSignal::AddonLoaded { from } => {
                    self.addon.addon_loaded(&from).await;
                    if state == AddonState::Sleeping && self.lock_on.contains(&from) {
                        self.awake().await;
                    }
                }
            }
        }
    }

    async fn start(&self) {
        info!(addon = self.ctx.name(), "starting");
        match guarded(self.addon.start(self.ctx.clone())).await {
            Ok(()) => {
                self.state.send_replace(AddonState::Started);
                self.emit(LifecycleEvent::Start);
                self.emit(LifecycleEvent::Ready);
            }
            Err(e) => {
                self.failed("start", e);
                if let Err(e) = guarded(self.addon.stop()).await {
                    warn!(addon = self.ctx.name(), error = %e, "stop after failed start also failed");
                }
                self.state.send_replace(AddonState::Stopped);
                self.emit(LifecycleEvent::Stop);
            }
        }
    }

    async fn stop(&self) {
        info!(addon = self.ctx.name(), "stopping");
        if let Err(e) = guarded(self.addon.stop()).await {
            self.failed("stop", e);
        }
        self.state.send_replace(AddonState::Stopped);
        self.emit(LifecycleEvent::Stop);
    }

    async fn awake(&self) {
        match guarded(self.addon.awake()).await {
            Ok(()) => {
                self.state.send_replace(AddonState::Started);
                self.emit(LifecycleEvent::Awake);
            }
            Err(e) => self.failed("awake", e),
        }
    }

    fn failed(&self, transition: &str, error: AddonError) {
        warn!(addon = self.ctx.name(), transition, error = %error, "transition failed");
        self.emit(LifecycleEvent::Failed {
            transition: transition.to_string(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(AddonEvent::Lifecycle(event));
    }
}

/// A panicking transition counts as a failed one.
async fn guarded<F>(transition: F) -> Result<(), AddonError>
where
    F: std::future::Future<Output = Result<(), AddonError>>,
{
    match AssertUnwindSafe(transition).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(AddonError::Failed(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        stops: AtomicUsize,
        sleeps: AtomicUsize,
        awakes: AtomicUsize,
        fail_start: bool,
    }

    #[async_trait]
    impl Addon for Counting {
        fn info(&self) -> AddonInfo {
            AddonInfo::new("counting").with_callback("echo", None).with_lock_on("dep")
        }
        async fn start(&self, _ctx: AddonContext) -> Result<(), AddonError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(AddonError::Failed("no database".into()));
            }
            Ok(())
        }
        async fn stop(&self) -> Result<(), AddonError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn sleep(&self) -> Result<(), AddonError> {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn awake(&self) -> Result<(), AddonError> {
            self.awakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn execute_callback(
            &self,
            callback: &str,
            _header: CallbackHeader,
            args: Vec<Value>,
        ) -> Result<CallbackOutput, AddonError> {
            match callback {
                "echo" => Ok(CallbackOutput::Value(args.into_iter().next().unwrap_or(Value::Null))),
                "explode" => panic!("kaboom"),
                other => Err(AddonError::UnknownCallback(other.to_string())),
            }
        }
    }

    async fn next_lifecycle(rx: &mut mpsc::UnboundedReceiver<AddonEvent>) -> LifecycleEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(AddonEvent::Lifecycle(e))) => return e,
                Ok(Some(AddonEvent::Message(_))) => continue,
                other => panic!("no lifecycle event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn start_emits_start_then_ready_once() {
        let addon = Arc::new(Counting::default());
        let local = LocalAddon::spawn(addon.clone());
        let mut events = local.take_events().unwrap();
        assert!(local.take_events().is_none());

        local.signal(LifecycleSignal::Start).unwrap();
        local.signal(LifecycleSignal::Start).unwrap();
        assert_eq!(next_lifecycle(&mut events).await, LifecycleEvent::Start);
        assert_eq!(next_lifecycle(&mut events).await, LifecycleEvent::Ready);
        assert!(local.wait_for(AddonState::Started, Duration::from_secs(1)).await);

        local.signal(LifecycleSignal::Stop).unwrap();
        assert_eq!(next_lifecycle(&mut events).await, LifecycleEvent::Stop);
        assert_eq!(addon.starts.load(Ordering::SeqCst), 1);
        assert_eq!(addon.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_reports_and_stops() {
        let addon = Arc::new(Counting { fail_start: true, ..Default::default() });
        let local = LocalAddon::spawn(addon.clone());
        let mut events = local.take_events().unwrap();
        local.signal(LifecycleSignal::Start).unwrap();

        match next_lifecycle(&mut events).await {
            LifecycleEvent::Failed { transition, message } => {
                assert_eq!(transition, "start");
                assert_eq!(message, "no database");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(next_lifecycle(&mut events).await, LifecycleEvent::Stop);
        assert_eq!(local.state(), AddonState::Stopped);
        assert_eq!(addon.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sleeps_and_wakes_on_dependency() {
        let addon = Arc::new(Counting::default());
        let local = LocalAddon::spawn(addon.clone());
        let mut events = local.take_events().unwrap();
        local.signal(LifecycleSignal::Start).unwrap();
        next_lifecycle(&mut events).await;
        next_lifecycle(&mut events).await;

        local.signal(LifecycleSignal::Sleep).unwrap();
        assert_eq!(next_lifecycle(&mut events).await, LifecycleEvent::Sleep);

        local.signal(LifecycleSignal::AddonLoaded { from: "other".into() }).unwrap();
        local.signal(LifecycleSignal::AddonLoaded { from: "dep".into() }).unwrap();
        assert_eq!(next_lifecycle(&mut events).await, LifecycleEvent::Awake);
        assert_eq!(addon.sleeps.load(Ordering::SeqCst), 1);
        assert_eq!(addon.awakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sleep_before_start_is_ignored() {
        let addon = Arc::new(Counting::default());
        let local = LocalAddon::spawn(addon.clone());
        local.signal(LifecycleSignal::Sleep).unwrap();
        local.signal(LifecycleSignal::Start).unwrap();
        assert!(local.wait_for(AddonState::Started, Duration::from_secs(1)).await);
        assert_eq!(addon.sleeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execute_maps_errors_and_panics() {
        let local = LocalAddon::spawn(Arc::new(Counting::default()));
        let header = CallbackHeader::new("1", "test");
        match local.execute("echo", header.clone(), vec![json!(7)]).await.unwrap() {
            CallbackOutput::Value(v) => assert_eq!(v, json!(7)),
            other => panic!("unexpected {other:?}"),
        }
        let err = local.execute("missing", header.clone(), vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown callback 'missing'");
        let err = local.execute("explode", header, vec![]).await.unwrap_err();
        assert!(matches!(err, HostError::Panicked(ref m) if m == "kaboom"));
    }
}
