use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use jsonschema::Validator;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::{AddonCatalog, discover_addons};
use crate::error::AgentError;
use crate::watcher::{DirectoryWatcher, WatchedType};

pub const CONFIG_FILE: &str = "agent.json";

/// Configuration record of one installed addon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddonDescriptor {
    #[serde(default)]
    pub active: bool,
    /// Run in a worker process when more than one CPU is available.
    #[serde(default)]
    pub standalone: bool,
    /// Extra dependencies on top of the ones the addon declares itself.
    #[serde(default)]
    pub lock_on: BTreeSet<String>,
}

impl AddonDescriptor {
    pub fn active() -> Self {
        Self { active: true, ..Default::default() }
    }

    pub fn standalone(mut self) -> Self {
        self.standalone = true;
        self
    }

    pub fn lock_on(mut self, dependency: &str) -> Self {
        self.lock_on.insert(dependency.to_string());
        self
    }
}

fn default_grace_period_ms() -> u64 {
    750
}
fn default_call_timeout_ms() -> u64 {
    500
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_stop_timeout_ms() -> u64 {
    2_000
}
fn default_timeout_dump_threshold() -> u32 {
    3
}

/// Host timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CoreSettings {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Consecutive timeouts of one addon before a dump is written. 0 disables.
    #[serde(default = "default_timeout_dump_threshold")]
    pub timeout_dump_threshold: u32,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            timeout_dump_threshold: default_timeout_dump_threshold(),
        }
    }
}

/// Contents of `agent.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    #[serde(default)]
    pub addons: BTreeMap<String, AddonDescriptor>,
    #[serde(default)]
    pub core: CoreSettings,
}

impl AgentConfig {
    pub fn with_addon(mut self, name: &str, descriptor: AddonDescriptor) -> Self {
        self.addons.insert(name.to_string(), descriptor);
        self
    }
}

static VALIDATOR: Lazy<Result<Validator, String>> =
    Lazy::new(|| jsonschema::validator_for(&ConfigStore::schema()).map_err(|e| e.to_string()));

/// Addon configuration with per-addon change notification.
pub struct ConfigStore {
    path: Option<PathBuf>,
    state: RwLock<AgentConfig>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<AddonDescriptor>>>,
    new_names: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    closed: AtomicBool,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl ConfigStore {
    fn with_state(path: Option<PathBuf>, config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            path,
            state: RwLock::new(config),
            subscribers: DashMap::new(),
            new_names: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            watcher: Mutex::new(None),
        })
    }

    /// Load `path`, creating it with defaults when missing.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
            write_config(&path, &AgentConfig::default())?;
            info!("created {}", path.display());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("invalid {}", path.display()))?;
        Ok(Self::with_state(Some(path), config))
    }

    pub fn in_memory(config: AgentConfig) -> Arc<Self> {
        Self::with_state(None, config)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema() -> Value {
        serde_json::to_value(schemars::schema_for!(AgentConfig)).unwrap_or(Value::Null)
    }

    pub fn validate(value: &Value) -> Result<(), AgentError> {
        let validator = VALIDATOR.as_ref().map_err(|e| AgentError::Config(e.clone()))?;
        let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(errors.join("; ")))
        }
    }

    /// Parse and validate the text of a configuration file.
    pub fn parse(text: &str) -> Result<AgentConfig, AgentError> {
        let value: Value = serde_json::from_str(text).map_err(|e| AgentError::Config(e.to_string()))?;
        Self::validate(&value)?;
        serde_json::from_value(value).map_err(|e| AgentError::Config(e.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AgentConfig> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AgentConfig> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> AgentConfig {
        self.read().clone()
    }

    pub fn addons(&self) -> BTreeMap<String, AddonDescriptor> {
        self.read().addons.clone()
    }

    pub fn get(&self, name: &str) -> Option<AddonDescriptor> {
        self.read().addons.get(name).cloned()
    }

    pub fn settings(&self) -> CoreSettings {
        self.read().core.clone()
    }

    /// Changes of one addon's descriptor. The current value, if any, arrives first.
    pub fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<AddonDescriptor> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.closed.load(Ordering::SeqCst) {
            return rx;
        }
        // held so that no write slips between the current value and registration
        let state = self.read();
        if let Some(current) = state.addons.get(name) {
            let _ = tx.send(current.clone());
        }
        self.subscribers.entry(name.to_string()).or_default().push(tx);
        rx
    }

    /// Names of addons that appear after this call.
    pub fn subscribe_new(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            if let Ok(mut senders) = self.new_names.lock() {
                senders.push(tx);
            }
        }
        rx
    }

    fn notify(&self, name: &str, descriptor: &AddonDescriptor) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(mut senders) = self.subscribers.get_mut(name) {
            senders.retain(|tx| tx.send(descriptor.clone()).is_ok());
        }
    }

    fn announce(&self, name: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut senders) = self.new_names.lock() {
            senders.retain(|tx| tx.send(name.to_string()).is_ok());
        }
    }

    fn persist(&self, config: &AgentConfig) -> Result<(), AgentError> {
        match &self.path {
            Some(path) => write_config(path, config).map_err(|e| AgentError::Config(format!("{e:#}"))),
            None => Ok(()),
        }
    }

    /// Write one descriptor through to disk and notify its subscribers.
    pub fn set(&self, name: &str, descriptor: AddonDescriptor) -> Result<(), AgentError> {
        let mut state = self.write();
        let mut next = state.clone();
        let previous = next.addons.insert(name.to_string(), descriptor.clone());
        self.persist(&next)?;
        *state = next;
        debug!(addon = name, ?descriptor, "descriptor written");
        self.notify(name, &descriptor);
        if previous.is_none() {
            self.announce(name);
        }
        Ok(())
    }

    pub fn set_active(&self, name: &str, active: bool) -> Result<(), AgentError> {
        let mut descriptor = self.get(name).unwrap_or_default();
        descriptor.active = active;
        self.set(name, descriptor)
    }

    /// Record `names` as inactive addons unless they are known already.
    pub fn seed<I>(&self, names: I) -> Result<usize, AgentError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.write();
        let mut next = state.clone();
        let mut added = Vec::new();
        for name in names {
            if !next.addons.contains_key(&name) {
                next.addons.insert(name.clone(), AddonDescriptor::default());
                added.push(name);
            }
        }
        if added.is_empty() {
            return Ok(0);
        }
        self.persist(&next)?;
        *state = next;
        for name in &added {
            info!(addon = %name, "discovered addon");
            self.announce(name);
        }
        Ok(added.len())
    }

    /// Seed an empty configuration from `root/addons` and the built-in catalog.
    pub fn discover(&self, root: &Path, catalog: &AddonCatalog) -> Result<usize, AgentError> {
        if !self.read().addons.is_empty() {
            return Ok(0);
        }
        let mut names: BTreeSet<String> = discover_addons(root).into_iter().collect();
        names.extend(catalog.names());
        self.seed(names)
    }

    /// Re-read the file and notify every addon whose descriptor changed.
    /// Addons missing from the file stay recorded as inactive.
    pub fn reload(&self) -> Result<(), AgentError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::Config(e.to_string()))?;
        let mut fresh = Self::parse(&text)?;

        let mut state = self.write();
        for (name, old) in state.addons.iter() {
            if !fresh.addons.contains_key(name) {
                let mut kept = old.clone();
                kept.active = false;
                fresh.addons.insert(name.clone(), kept);
            }
        }
        let changed: Vec<(String, AddonDescriptor, bool)> = fresh
            .addons
            .iter()
            .filter_map(|(name, descriptor)| match state.addons.get(name) {
                Some(old) if old == descriptor => None,
                old => Some((name.clone(), descriptor.clone(), old.is_none())),
            })
            .collect();
        if state.core != fresh.core {
            info!("core settings changed; they apply on the next start");
        }
        *state = fresh;

        for (name, descriptor, is_new) in changed {
            debug!(addon = %name, ?descriptor, "descriptor reloaded");
            self.notify(&name, &descriptor);
            if is_new {
                self.announce(&name);
            }
        }
        Ok(())
    }

    /// Reload automatically whenever the file changes on disk.
    pub async fn watch(self: &Arc<Self>, poll_interval: Duration) -> anyhow::Result<()> {
        let path = self.path.clone().context("in-memory configuration cannot be watched")?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .context("configuration file has no parent directory")?;
        let file_name = path.file_name().map(|n| n.to_os_string()).context("no file name")?;
        let reloader = Arc::new(ConfigReloader { store: Arc::downgrade(self), file_name });
        let watcher = DirectoryWatcher::new(dir, reloader, false, true, poll_interval).await?;
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }
        info!("watching {}", path.display());
        Ok(())
    }

    /// Stop notifying subscribers and stop watching the file.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.clear();
        if let Ok(mut senders) = self.new_names.lock() {
            senders.clear();
        }
        let watcher = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(watcher) = watcher {
            watcher.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn write_config(path: &Path, config: &AgentConfig) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))
}

struct ConfigReloader {
    store: Weak<ConfigStore>,
    file_name: std::ffi::OsString,
}

#[async_trait]
impl WatchedType for ConfigReloader {
    fn is_relevant(&self, path: &Path) -> bool {
        path.file_name() == Some(self.file_name.as_os_str())
    }

    async fn on_create_or_modify(&self, _path: &Path) -> anyhow::Result<()> {
        match self.store.upgrade() {
            Some(store) => Ok(store.reload()?),
            None => Ok(()),
        }
    }

    async fn on_remove(&self, path: &Path) -> anyhow::Result<()> {
        warn!("{} was removed; keeping the last known configuration", path.display());
        Ok(())
    }
}
