use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use addon_plugin::worker_runtime::LOG_DIR_ENV;
use addon_plugin::{
    AddonEvent, AddonHandle, AddonHandleType, AddonInfo, AddonState, CORE_CALLER, Delivery,
    LifecycleEvent, LifecycleSignal, LocalAddon, OutboundCall, ProxyOptions, RemoteAddon, Reply,
    ReplySink, WorkerCommand,
};
use dashmap::DashMap;
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{AddonCatalog, EntryPoint};
use crate::config::{AddonDescriptor, ConfigStore, CoreSettings};
use crate::dump::Dumper;
use crate::error::AgentError;
use crate::locks::LockTracker;
use crate::router::Router;
use crate::routing::RoutingTable;
use crate::version::{CoreVersion, HOST_VERSION};

static AVAILABLE_CPUS: Lazy<usize> = Lazy::new(num_cpus::get);

/// Everything the reconciler needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Agent root; dumps go to `root/debug`, worker logs to `root/logs`.
    pub root: PathBuf,
    pub grace_period: Duration,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    pub stop_timeout: Duration,
    pub timeout_dump_threshold: u32,
    /// Standalone addons get a worker process only when this is above one.
    pub available_cpus: usize,
    /// Executable that hosts built-in addons with `worker <name>`.
    pub worker_exe: Option<PathBuf>,
}

impl CoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_settings(root, &CoreSettings::default())
    }

    pub fn from_settings(root: impl Into<PathBuf>, settings: &CoreSettings) -> Self {
        Self {
            root: root.into(),
            grace_period: Duration::from_millis(settings.grace_period_ms),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
            timeout_dump_threshold: settings.timeout_dump_threshold,
            available_cpus: *AVAILABLE_CPUS,
            worker_exe: std::env::current_exe().ok(),
        }
    }

    pub fn with_available_cpus(mut self, cpus: usize) -> Self {
        self.available_cpus = cpus;
        self
    }

    pub fn with_worker_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(exe.into());
        self
    }

    fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            call_timeout: self.call_timeout,
            handshake_timeout: self.handshake_timeout,
            shutdown_timeout: self.stop_timeout,
        }
    }
}

/// Registry record of one loaded addon. Never replaced once created.
struct AddonEntry {
    name: String,
    handle: AddonHandle,
    info: AddonInfo,
    state: watch::Sender<AddonState>,
    /// Last `active` flag seen in the configuration.
    desired: AtomicBool,
    /// Dependents were already put to sleep for the current stop.
    dependents_notified: AtomicBool,
}

impl AddonEntry {
    fn state(&self) -> AddonState {
        *self.state.borrow()
    }

    fn set_state(&self, state: AddonState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(addon = %self.name, from = %previous, to = %state, "state changed");
        }
    }

    async fn wait_for(&self, wanted: AddonState, limit: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|s| *s == wanted))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// The lifecycle reconciler: keeps the addon registry in line with the
/// configuration and wires every addon to the router.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    options: CoreOptions,
    config: Arc<ConfigStore>,
    catalog: AddonCatalog,
    registry: DashMap<String, Arc<AddonEntry>>,
    routing: Arc<RoutingTable>,
    router: Arc<Router>,
    locks: LockTracker,
    dumper: Arc<Dumper>,
    initialized: AtomicBool,
    shutdown: CancellationToken,
    reconcilers: DashMap<String, JoinHandle<()>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    pub fn new(options: CoreOptions, config: Arc<ConfigStore>, catalog: AddonCatalog) -> Self {
        let dumper = Arc::new(Dumper::new(&options.root));
        let routing = Arc::new(RoutingTable::new());
        let router = Router::new(routing.clone(), dumper.clone())
            .with_grace(options.grace_period)
            .with_timeout_dump_threshold(options.timeout_dump_threshold);
        Self {
            inner: Arc::new(CoreInner {
                options,
                config,
                catalog,
                registry: DashMap::new(),
                routing,
                router: Arc::new(router),
                locks: LockTracker::new(),
                dumper,
                initialized: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                reconcilers: DashMap::new(),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    fn from_weak(weak: &Weak<CoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn options(&self) -> &CoreOptions {
        &self.inner.options
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.inner.routing.clone()
    }

    pub fn locks(&self) -> &LockTracker {
        &self.inner.locks
    }

    pub fn dumper(&self) -> &Dumper {
        &self.inner.dumper
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn addon_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registry.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn state_of(&self, name: &str) -> Option<AddonState> {
        self.entry(name).map(|e| e.state())
    }

    pub fn info_of(&self, name: &str) -> Option<AddonInfo> {
        self.entry(name).map(|e| e.info.clone())
    }

    pub fn handle(&self, name: &str) -> Option<AddonHandle> {
        self.entry(name).map(|e| e.handle.clone())
    }

    fn entry(&self, name: &str) -> Option<Arc<AddonEntry>> {
        self.inner.registry.get(name).map(|e| e.value().clone())
    }

    /// Wait until `name` is registered and reaches `wanted`.
    pub async fn wait_for_state(&self, name: &str, wanted: AddonState, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some(entry) = self.entry(name) {
                let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                return entry.wait_for(wanted, left).await;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Subscribe to every configured addon, and to addons added later.
    pub fn initialize(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("core already initialized");
            return;
        }
        info!("initializing core {HOST_VERSION}");

        // subscribe first so a name written meanwhile is not missed
        let mut new_names = self.inner.config.subscribe_new();
        for name in self.inner.config.addons().into_keys() {
            self.spawn_reconciler(name);
        }

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = token.cancelled() => break,
                    name = new_names.recv() => match name {
                        Some(name) => name,
                        None => break,
                    },
                };
                let Some(core) = Core::from_weak(&weak) else { break };
                core.spawn_reconciler(name);
            }
        });
        self.push_background(watcher);
    }

    fn push_background(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.background.lock() {
            tasks.push(task);
        }
    }

    /// One loop per addon name: its changes are applied in order, while
    /// different addons proceed independently.
    fn spawn_reconciler(&self, name: String) {
        let dashmap::mapref::entry::Entry::Vacant(slot) = self.inner.reconcilers.entry(name.clone()) else {
            return;
        };
        let mut changes = self.inner.config.subscribe(&name);
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let descriptor = tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(descriptor) => descriptor,
                        None => break,
                    },
                };
                let Some(core) = Core::from_weak(&weak) else { break };
                core.reconcile(&name, descriptor).await;
            }
            debug!(addon = %name, "reconciler finished");
        });
        slot.insert(task);
    }

    /// Bring addon `name` in line with `descriptor`. Failures are dumped,
    /// never returned.
    pub async fn reconcile(&self, name: &str, descriptor: AddonDescriptor) {
        match self.entry(name) {
            None => {
                if !descriptor.active {
                    debug!(addon = name, "inactive, not loading");
                    return;
                }
                match self.load(name, &descriptor).await {
                    Ok(entry) => {
                        entry.desired.store(true, Ordering::SeqCst);
                        self.trigger(&entry, true).await;
                    }
                    Err(err) => {
                        self.inner.dumper.dump_error(&err);
                    }
                }
            }
            Some(entry) => {
                self.inner.locks.register(name, lock_set(&entry.info, &descriptor));
                let was = entry.desired.swap(descriptor.active, Ordering::SeqCst);
                let running = entry.state().is_running();
                if was != descriptor.active || running != descriptor.active {
                    self.trigger(&entry, descriptor.active).await;
                } else {
                    debug!(addon = name, active = descriptor.active, "nothing to do");
                }
            }
        }
    }

    /// Fire a start or stop transition without waiting for the addon.
    async fn trigger(&self, entry: &Arc<AddonEntry>, active: bool) {
        let (signal, transition) = if active {
            (LifecycleSignal::Start, "start")
        } else {
            self.notify_dependents(entry).await;
            (LifecycleSignal::Stop, "stop")
        };
        info!(addon = %entry.name, transition, "triggering");
        if let Err(e) = entry.handle.signal(signal).await {
            self.inner.dumper.dump_error(&AgentError::Transition {
                addon: entry.name.clone(),
                transition: transition.to_string(),
                message: e.to_string(),
            });
        }
    }

    /// Put every started dependent of `entry` to sleep, once per stop.
    async fn notify_dependents(&self, entry: &AddonEntry) {
        if entry.dependents_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        for dependent in self.inner.locks.dependents_of(&entry.name) {
            let Some(target) = self.entry(&dependent) else { continue };
            if target.state() != AddonState::Started {
                continue;
            }
            debug!(addon = %dependent, dependency = %entry.name, "sleep");
            if let Err(e) = target.handle.signal(LifecycleSignal::Sleep).await {
                warn!(addon = %dependent, error = %e, "could not deliver sleep");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    async fn load(&self, name: &str, descriptor: &AddonDescriptor) -> Result<Arc<AddonEntry>, AgentError> {
        let options = &self.inner.options;
        let entry_point = self
            .inner
            .catalog
            .resolve(&options.root, name)
            .ok_or_else(|| AgentError::Load {
                addon: name.to_string(),
                reason: "no built-in addon or executable with this name".to_string(),
            })?;
        let handle = self.instantiate(name, descriptor, entry_point)?;
        info!(addon = name, remote = handle.is_remote(), "loading");

        // ── 1. handshake + checks ──
        let checked = match handle.info().await {
            Ok(info) => check_contract(name, &info).and_then(|_| check_version(name, &info)).map(|_| info),
            Err(e) => Err(AgentError::Load {
                addon: name.to_string(),
                reason: format!("handshake failed: {e}"),
            }),
        };
        let info = match checked {
            Ok(info) => info,
            Err(err) => {
                handle.shutdown().await;
                return Err(err);
            }
        };
        let Some(events) = handle.take_events() else {
            handle.shutdown().await;
            return Err(AgentError::Load {
                addon: name.to_string(),
                reason: "addon events are already consumed".to_string(),
            });
        };

        // ── 2. register ──
        let (state, _) = watch::channel(AddonState::Loaded);
        let entry = Arc::new(AddonEntry {
            name: name.to_string(),
            handle,
            info,
            state,
            desired: AtomicBool::new(false),
            dependents_notified: AtomicBool::new(false),
        });
        self.inner.locks.register(name, lock_set(&entry.info, descriptor));
        self.inner.registry.insert(name.to_string(), entry.clone());

        // ── 3. listen ──
        let weak = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(listen(weak, entry.clone(), events));
        self.push_background(listener);
        Ok(entry)
    }

    fn instantiate(
        &self,
        name: &str,
        descriptor: &AddonDescriptor,
        entry_point: EntryPoint,
    ) -> Result<AddonHandle, AgentError> {
        let options = &self.inner.options;
        let log_dir = options.root.join("logs").to_string_lossy().into_owned();
        let command = match entry_point {
            EntryPoint::Builtin(factory) => {
                let isolate = descriptor.standalone && options.available_cpus > 1;
                match (&options.worker_exe, isolate) {
                    (Some(exe), true) => WorkerCommand::new(exe).arg("worker").arg(name),
                    (None, true) => {
                        warn!(addon = name, "no worker executable known, running in-process");
                        return Ok(AddonHandle::Local(LocalAddon::spawn(factory())));
                    }
                    (_, false) => return Ok(AddonHandle::Local(LocalAddon::spawn(factory()))),
                }
            }
            EntryPoint::Executable(path) => WorkerCommand::new(path),
        };
        let command = command.env(LOG_DIR_ENV, log_dir);
        RemoteAddon::spawn(name, command, options.proxy_options())
            .map(AddonHandle::Remote)
            .map_err(|e| {
                let reason = match std::error::Error::source(&e) {
                    Some(source) => format!("{e}: {source}"),
                    None => e.to_string(),
                };
                AgentError::Load { addon: name.to_string(), reason }
            })
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    async fn on_lifecycle(&self, entry: &Arc<AddonEntry>, event: LifecycleEvent) {
        debug!(addon = %entry.name, ?event, "lifecycle event");
        match event {
            LifecycleEvent::Start => {
                self.inner
                    .routing
                    .install(entry.handle.clone(), entry.info.callback_names());
                entry.dependents_notified.store(false, Ordering::SeqCst);
                entry.set_state(AddonState::Started);
            }
            LifecycleEvent::Ready => {
                info!(addon = %entry.name, "ready");
                self.announce_loaded(entry).await;
            }
            LifecycleEvent::Stop => {
                self.inner.routing.remove(&entry.name);
                entry.set_state(AddonState::Stopped);
                self.notify_dependents(entry).await;
            }
            LifecycleEvent::Sleep => entry.set_state(AddonState::Sleeping),
            LifecycleEvent::Awake => entry.set_state(AddonState::Started),
            LifecycleEvent::Failed { transition, message } => {
                self.inner.dumper.dump_error(&AgentError::Transition {
                    addon: entry.name.clone(),
                    transition,
                    message,
                });
            }
        }
    }

    /// Tell every other addon that `entry` is up, and wake dependents whose
    /// dependencies are all started again.
    async fn announce_loaded(&self, entry: &Arc<AddonEntry>) {
        let others: Vec<Arc<AddonEntry>> = self
            .inner
            .registry
            .iter()
            .filter(|e| e.key() != &entry.name)
            .map(|e| e.value().clone())
            .collect();
        for other in &others {
            let signal = LifecycleSignal::AddonLoaded { from: entry.name.clone() };
            if let Err(e) = other.handle.signal(signal).await {
                debug!(addon = %other.name, error = %e, "addonLoaded not delivered");
            }
        }

        for dependent in self.inner.locks.dependents_of(&entry.name) {
            let Some(target) = self.entry(&dependent) else { continue };
            if target.state() != AddonState::Sleeping {
                continue;
            }
            let all_up = self
                .inner
                .locks
                .locks_of(&dependent)
                .iter()
                .all(|dep| self.state_of(dep) == Some(AddonState::Started));
            if all_up {
                // start on a sleeping addon wakes it
                if let Err(e) = target.handle.signal(LifecycleSignal::Start).await {
                    warn!(addon = %dependent, error = %e, "could not wake");
                }
            }
        }
    }

    fn on_message(&self, entry: &AddonEntry, call: OutboundCall) {
        if entry.state() == AddonState::Stopped {
            debug!(addon = %entry.name, target = %call.target, "dropping call from stopped addon");
            call.reply
                .deliver(Delivery::Error(format!("addon '{}' is stopped", entry.name)));
            return;
        }
        let router = self.inner.router.clone();
        tokio::spawn(async move { router.dispatch(call).await });
    }

    /// Call `target` from the host itself.
    pub fn call(&self, target: &str, args: Vec<Value>) -> Reply {
        let (tx, rx) = mpsc::unbounded_channel();
        let message_id = Uuid::new_v4().to_string();
        let call = OutboundCall {
            message_id: message_id.clone(),
            from: CORE_CALLER.to_string(),
            target: target.to_string(),
            args,
            reply: Arc::new(tx),
        };
        let router = self.inner.router.clone();
        tokio::spawn(async move { router.dispatch(call).await });
        Reply::new(message_id, rx)
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop every addon, wait for them (bounded by the stop timeout), release
    /// the workers and close the configuration.
    pub async fn exit(&self) -> Result<(), AgentError> {
        if !self.inner.initialized.swap(false, Ordering::SeqCst) {
            return Err(AgentError::NotInitialized);
        }
        info!("core shutting down");
        self.inner.shutdown.cancel();

        let entries: Vec<Arc<AddonEntry>> = self.inner.registry.iter().map(|e| e.value().clone()).collect();
        let limit = self.inner.options.stop_timeout;
        let stops = entries.iter().map(|entry| async move {
            if entry.state() == AddonState::Stopped {
                return;
            }
            entry.desired.store(false, Ordering::SeqCst);
            if let Err(e) = entry.handle.signal(LifecycleSignal::Stop).await {
                warn!(addon = %entry.name, error = %e, "stop not delivered");
                return;
            }
            if !entry.wait_for(AddonState::Stopped, limit).await {
                warn!(addon = %entry.name, "did not stop within {:?}", limit);
            }
        });
        join_all(stops).await;
        join_all(entries.iter().map(|entry| entry.handle.shutdown())).await;

        self.inner.config.close();
        for task in self.inner.reconcilers.iter() {
            task.value().abort();
        }
        self.inner.reconcilers.clear();
        if let Ok(mut tasks) = self.inner.background.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("core stopped");
        Ok(())
    }
}

async fn listen(weak: Weak<CoreInner>, entry: Arc<AddonEntry>, mut events: mpsc::UnboundedReceiver<AddonEvent>) {
    while let Some(event) = events.recv().await {
        let Some(core) = Core::from_weak(&weak) else { break };
        match event {
            AddonEvent::Lifecycle(event) => core.on_lifecycle(&entry, event).await,
            AddonEvent::Message(call) => core.on_message(&entry, call),
        }
    }
    debug!(addon = %entry.name, "event stream closed");
}

/// Declared `lockOn` plus the configured one.
fn lock_set(info: &AddonInfo, descriptor: &AddonDescriptor) -> BTreeSet<String> {
    info.lock_on
        .iter()
        .cloned()
        .chain(descriptor.lock_on.iter().cloned())
        .collect()
}

fn check_contract(name: &str, info: &AddonInfo) -> Result<(), AgentError> {
    let mismatch = |reason: String| AgentError::ContractMismatch { addon: name.to_string(), reason };
    if info.name != name {
        return Err(mismatch(format!("reports name '{}'", info.name)));
    }
    if name.contains('.') {
        return Err(mismatch("addon names cannot contain '.'".to_string()));
    }
    if info.callback_names().any(str::is_empty) {
        return Err(mismatch("empty callback name".to_string()));
    }
    Ok(())
}

fn check_version(name: &str, info: &AddonInfo) -> Result<(), AgentError> {
    let Some(requirement) = &info.core_version else {
        return Ok(());
    };
    let required: CoreVersion = requirement.parse().map_err(|e| AgentError::ContractMismatch {
        addon: name.to_string(),
        reason: format!("coreVersion: {e}"),
    })?;
    if CoreVersion::host().satisfies(&required) {
        Ok(())
    } else {
        Err(AgentError::VersionMismatch {
            addon: name.to_string(),
            required: requirement.clone(),
            host: HOST_VERSION.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_plugin::test_util::{Behavior, ScriptedAddon};
    use crate::config::AgentConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn info(name: &str) -> AddonInfo {
        AddonInfo::new(name).with_callback("echo", None)
    }

    #[test]
    fn contract_requires_matching_name() {
        assert!(check_contract("a", &info("a")).is_ok());
        assert_eq!(check_contract("a", &info("b")).unwrap_err().code(), "E_CONTRACT");
        assert_eq!(check_contract("a.b", &info("a.b")).unwrap_err().code(), "E_CONTRACT");
    }

    #[test]
    fn version_requirement_is_checked() {
        assert!(check_version("a", &info("a")).is_ok());
        assert!(check_version("a", &info("a").with_core_version(format!(">={HOST_VERSION}"))).is_ok());
        assert_eq!(
            check_version("a", &info("a").with_core_version("99.0.0")).unwrap_err().code(),
            "E_VERSION"
        );
        assert_eq!(
            check_version("a", &info("a").with_core_version("latest")).unwrap_err().code(),
            "E_CONTRACT"
        );
    }

    #[test]
    fn lock_set_merges_declared_and_configured() {
        let declared = AddonInfo::new("d").with_lock_on("x");
        let descriptor = AddonDescriptor::active().lock_on("y").lock_on("x");
        let set: Vec<String> = lock_set(&declared, &descriptor).into_iter().collect();
        assert_eq!(set, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_loads_starts_and_stops() {
        let root = tempdir().unwrap();
        let mut catalog = AddonCatalog::new();
        catalog.register("b", || -> Arc<dyn addon_plugin::Addon> {
            Arc::new(ScriptedAddon::new("b").with_callback("echo", Behavior::Echo))
        });
        let config = ConfigStore::in_memory(AgentConfig::default());
        let core = Core::new(CoreOptions::new(root.path()), config, catalog);

        core.reconcile("b", AddonDescriptor::default()).await;
        assert!(core.state_of("b").is_none(), "inactive addons are not loaded");

        core.reconcile("b", AddonDescriptor::active()).await;
        assert!(core.wait_for_state("b", AddonState::Started, Duration::from_secs(2)).await);
        assert_eq!(core.routing_table().count_for("b"), 1);
        assert_eq!(core.call("b.echo", vec![json!(1)]).value().await.unwrap(), json!(1));

        core.reconcile("b", AddonDescriptor::default()).await;
        assert!(core.wait_for_state("b", AddonState::Stopped, Duration::from_secs(2)).await);
        assert_eq!(core.routing_table().count_for("b"), 0);
        assert_eq!(core.addon_names(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn missing_entry_point_is_dumped() {
        let root = tempdir().unwrap();
        let config = ConfigStore::in_memory(AgentConfig::default());
        let core = Core::new(CoreOptions::new(root.path()), config, AddonCatalog::new());
        core.reconcile("ghost", AddonDescriptor::active()).await;
        assert!(core.state_of("ghost").is_none());

        let mut found = false;
        for _ in 0..50 {
            if std::fs::read_dir(root.path().join("debug")).map(|d| d.count() > 0).unwrap_or(false) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found, "a dump should have been written");
    }
}
