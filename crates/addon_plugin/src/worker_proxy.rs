use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::addon::{CallbackOutput, OutboundCall, ReplySink};
use crate::addon_actor::AddonEvent;
use crate::correlation::CorrelationTable;
use crate::envelope::{self, CallFrame, Frame, ResponseFrame};
use crate::error::HostError;
use crate::message::{AddonInfo, CORE_CALLER, CallbackHeader, Delivery, GET_INFO, LifecycleEvent, LifecycleSignal};

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), envs: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Deadline for the first response frame of a callback.
    pub call_timeout: Duration,
    /// Deadline for the `get_info` exchange.
    pub handshake_timeout: Duration,
    /// How long a worker may take to exit after its stdin is closed.
    pub shutdown_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Addon living in a worker process, reached over line-delimited envelopes.
///
/// The process is kept across stop/start toggles. A worker that died is
/// respawned on the next start signal when the proxy knows how to launch it.
#[derive(Clone)]
pub struct RemoteAddon {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    name: String,
    options: ProxyOptions,
    launcher: Option<WorkerCommand>,
    correlation: CorrelationTable,
    link: Mutex<Option<WorkerLink>>,
    events_tx: mpsc::UnboundedSender<AddonEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AddonEvent>>>,
    started: AtomicBool,
    consecutive_timeouts: AtomicU32,
}

struct WorkerLink {
    writer: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    child: Option<JoinHandle<()>>,
}

impl RemoteAddon {
    fn with_launcher(name: &str, options: ProxyOptions, launcher: Option<WorkerCommand>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RemoteInner {
                name: name.to_string(),
                options,
                launcher,
                correlation: CorrelationTable::new(),
                link: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                started: AtomicBool::new(false),
                consecutive_timeouts: AtomicU32::new(0),
            }),
        }
    }

    /// Launch the worker process and connect to its stdin/stdout.
    pub fn spawn(name: &str, command: WorkerCommand, options: ProxyOptions) -> Result<Self, HostError> {
        let remote = Self::with_launcher(name, options, Some(command));
        remote.launch()?;
        Ok(remote)
    }

    /// Connect to an already running worker over arbitrary byte streams.
    pub fn attach<R, W>(name: &str, options: ProxyOptions, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let remote = Self::with_launcher(name, options, None);
        remote.connect(reader, writer, None);
        remote
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_alive(&self) -> bool {
        self.inner
            .link
            .lock()
            .ok()
            .and_then(|link| link.as_ref().map(|l| l.alive.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.correlation.len()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.inner.consecutive_timeouts.load(Ordering::SeqCst)
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AddonEvent>> {
        self.inner.events_rx.lock().ok()?.take()
    }

    fn launch(&self) -> Result<(), HostError> {
        let Some(command) = &self.inner.launcher else {
            return Err(HostError::NotRunning(self.inner.name.clone()));
        };
        let mut child = TokioCommand::new(&command.program)
            .args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn { addon: self.inner.name.clone(), source })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(HostError::Protocol("worker stdio is not piped".to_string()));
        };
        info!(addon = %self.inner.name, pid = ?child.id(), program = %command.program.display(), "worker spawned");
        self.connect(stdout, stdin, Some(child));
        Ok(())
    }

    fn connect<R, W>(&self, reader: R, writer: W, child: Option<Child>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

        // ── task that proxies line_rx → worker stdin ─────────────────────
        let name = self.inner.name.clone();
        tokio::spawn(async move {
            let mut w = BufWriter::new(writer);
            while let Some(line) = line_rx.recv().await {
                if w.write_all(line.as_bytes()).await.is_err() || w.flush().await.is_err() {
                    warn!(addon = %name, "worker stdin closed");
                    break;
                }
            }
            let _ = w.shutdown().await;
        });

        // ── task that reads worker stdout → correlation / events ─────────
        let reader = tokio::spawn(read_loop(
            self.inner.clone(),
            reader,
            line_tx.downgrade(),
            alive.clone(),
        ));

        let child = child.map(|mut child| {
            let name = self.inner.name.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => info!(addon = %name, %status, "worker exited"),
                    Err(e) => error!(addon = %name, error = %e, "failed to wait for worker"),
                }
            })
        });

        let link = WorkerLink { writer: line_tx, alive, reader, child };
        if let Ok(mut slot) = self.inner.link.lock() {
            if let Some(old) = slot.replace(link) {
                old.reader.abort();
                if let Some(child) = old.child {
                    child.abort();
                }
            }
        }
    }

    fn writer(&self) -> Result<mpsc::UnboundedSender<String>, HostError> {
        let link = self
            .inner
            .link
            .lock()
            .map_err(|_| HostError::NotRunning(self.inner.name.clone()))?;
        match link.as_ref() {
            Some(link) if link.alive.load(Ordering::SeqCst) => Ok(link.writer.clone()),
            _ => Err(HostError::NotRunning(self.inner.name.clone())),
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), HostError> {
        let line = envelope::encode(frame).map_err(|e| HostError::Protocol(e.to_string()))?;
        self.writer()?
            .send(line)
            .map_err(|_| HostError::ChannelClosed(self.inner.name.clone()))
    }

    /// Respawn a dead worker if this proxy launched it.
    fn ensure_running(&self) -> Result<(), HostError> {
        if self.is_alive() {
            return Ok(());
        }
        warn!(addon = %self.inner.name, "worker is not running, respawning");
        self.launch()
    }

    pub async fn call(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, HostError> {
        self.call_with_timeout(callback, header, args, self.inner.options.call_timeout)
            .await
    }

    async fn call_with_timeout(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
        limit: Duration,
    ) -> Result<CallbackOutput, HostError> {
        // every frame gets its own id so a late answer can never match a later call
        let message_id = Uuid::new_v4().to_string();
        let rx = self.inner.correlation.register(&message_id)?;
        let frame = Frame::Call(CallFrame {
            message_id: message_id.clone(),
            callback: callback.to_string(),
            header,
            args,
        });
        if let Err(e) = self.send_frame(&frame) {
            self.inner.correlation.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => {
                self.inner.consecutive_timeouts.store(0, Ordering::SeqCst);
                result
            }
            Ok(Err(_)) => Err(HostError::ChannelClosed(self.inner.name.clone())),
            Err(_) => {
                let waited = self.inner.correlation.remove(&message_id);
                let consecutive = self.inner.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    addon = %self.inner.name,
                    callback,
                    message_id = %message_id,
                    waited_ms = waited.map(|d| d.as_millis() as u64),
                    consecutive,
                    "call timed out"
                );
                Err(HostError::Timeout {
                    addon: self.inner.name.clone(),
                    callback: callback.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                    consecutive,
                })
            }
        }
    }

    /// Ask the worker who it is.
    pub async fn handshake(&self) -> Result<AddonInfo, HostError> {
        let header = CallbackHeader::new(Uuid::new_v4().to_string(), CORE_CALLER);
        let limit = self.inner.options.handshake_timeout;
        match self.call_with_timeout(GET_INFO, header, Vec::new(), limit).await? {
            CallbackOutput::Value(v) => {
                serde_json::from_value(v).map_err(|e| HostError::InvalidInfo(e.to_string()))
            }
            CallbackOutput::Stream(_) => Err(HostError::InvalidInfo("get_info answered with a stream".into())),
        }
    }

    pub async fn signal(&self, signal: LifecycleSignal) -> Result<(), HostError> {
        if signal == LifecycleSignal::Start {
            self.ensure_running()?;
        }
        debug!(addon = %self.inner.name, ?signal, "signal worker");
        self.send_frame(&Frame::Signal { signal })
    }

    /// Close the worker's stdin and give it time to exit before killing it.
    pub async fn shutdown(&self) {
        let link = match self.inner.link.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(link) = link else { return };
        drop(link.writer);
        if let Some(mut child) = link.child {
            let limit = self.inner.options.shutdown_timeout;
            if tokio::time::timeout(limit, &mut child).await.is_err() {
                warn!(addon = %self.inner.name, "worker did not exit in time, killing it");
                child.abort();
            }
        }
        link.reader.abort();
        self.inner.correlation.fail_all(&self.inner.name);
    }
}

async fn read_loop<R>(
    inner: Arc<RemoteInner>,
    reader: R,
    writer: mpsc::WeakUnboundedSender<String>,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(addon = %inner.name, error = %e, "failed to read from worker");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match envelope::decode(&line) {
            Ok(Frame::Response(response)) => {
                let message_id = response.message_id.clone();
                for delivery in response.into_deliveries() {
                    inner.correlation.resolve(&message_id, delivery);
                }
            }
            Ok(Frame::Relay(relay)) => {
                let reply = RelayReply { message_id: relay.message_id.clone(), writer: writer.clone() };
                let call = OutboundCall {
                    message_id: relay.message_id,
                    from: inner.name.clone(),
                    target: relay.address,
                    args: relay.args,
                    reply: Arc::new(reply),
                };
                let _ = inner.events_tx.send(AddonEvent::Message(call));
            }
            Ok(Frame::Event { event }) => {
                match event {
                    LifecycleEvent::Start => inner.started.store(true, Ordering::SeqCst),
                    LifecycleEvent::Stop => inner.started.store(false, Ordering::SeqCst),
                    _ => {}
                }
                let _ = inner.events_tx.send(AddonEvent::Lifecycle(event));
            }
            Ok(other) => warn!(addon = %inner.name, frame = ?other, "unexpected frame from worker"),
            Err(e) => warn!(addon = %inner.name, error = %e, "dropping malformed line from worker"),
        }
    }

    alive.store(false, Ordering::SeqCst);
    let failed = inner.correlation.fail_all(&inner.name);
    info!(addon = %inner.name, failed_calls = failed, "worker channel closed");
    if inner.started.swap(false, Ordering::SeqCst) {
        let _ = inner.events_tx.send(AddonEvent::Lifecycle(LifecycleEvent::Failed {
            transition: "worker".to_string(),
            message: "worker process exited".to_string(),
        }));
        let _ = inner.events_tx.send(AddonEvent::Lifecycle(LifecycleEvent::Stop));
    }
}

/// Re-frames the answer to a worker's relay as `relay-response` frames.
struct RelayReply {
    message_id: String,
    writer: mpsc::WeakUnboundedSender<String>,
}

impl ReplySink for RelayReply {
    fn deliver(&self, delivery: Delivery) {
        let frame = Frame::RelayResponse(ResponseFrame::from_delivery(self.message_id.clone(), delivery));
        let Some(writer) = self.writer.upgrade() else {
            debug!(message_id = %self.message_id, "worker gone, dropping relay response");
            return;
        };
        match envelope::encode(&frame) {
            Ok(line) => {
                let _ = writer.send(line);
            }
            Err(e) => error!(message_id = %self.message_id, error = %e, "failed to encode relay response"),
        }
    }
}
