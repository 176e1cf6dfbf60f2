//! Worker side of the envelope protocol.
//!
//! A worker binary hosts exactly one addon and talks to the host over
//! **stdin / stdout**. Nothing else may be written to stdout; logs go to
//! stderr or to a rolling file.
//!
//! Usage:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     addon_plugin::worker_runtime::init_worker_logging("my_addon");
//!     addon_plugin::worker_runtime::run(std::sync::Arc::new(MyAddon::default())).await
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::daily;
use tracing_subscriber::EnvFilter;

use crate::addon::{Addon, CallbackOutput, ChunkStream, ReplySink, panic_message};
use crate::addon_actor::{AddonEvent, LocalAddon};
use crate::envelope::{self, CallFrame, Frame, RelayFrame, ResponseFrame};
use crate::error::HostError;
use crate::message::{AddonState, Delivery, GET_INFO, LifecycleSignal};

/// Directory the host hands to its workers for log files.
pub const LOG_DIR_ENV: &str = "ADDON_AGENT_LOG_DIR";

const STOP_ON_EOF_TIMEOUT: Duration = Duration::from_secs(2);

/// Install a tracing subscriber that never touches stdout.
pub fn init_worker_logging(addon: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                eprintln!("cannot create log dir {dir}: {e}");
            }
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(daily(dir, format!("{addon}.log")))
                .try_init()
        }
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if installed.is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

/// Serve `addon` over this process' stdin/stdout until stdin closes.
pub async fn run(addon: Arc<dyn Addon>) -> Result<()> {
    serve(addon, io::stdin(), io::stdout()).await
}

/// Serve `addon` over any pair of byte streams.
pub async fn serve<R, W>(addon: Arc<dyn Addon>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let local = LocalAddon::spawn(addon);
    let name = local.name().to_string();
    let Some(mut events) = local.take_events() else {
        anyhow::bail!("event stream of '{name}' already taken");
    };

    // ── 1. writer task: everything headed for the host goes through tx ──
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(line) = rx.recv().await {
            if w.write_all(line.as_bytes()).await.is_err() || w.flush().await.is_err() {
                eprintln!("stdout write error");
                break;
            }
        }
    });

    // ── 2. bridge lifecycle events and outbound calls of the addon ────────
    let relays: Arc<DashMap<String, Arc<dyn ReplySink>>> = Arc::new(DashMap::new());
    let pump = {
        let tx = tx.clone();
        let relays = relays.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let frame = match event {
                    AddonEvent::Lifecycle(event) => Frame::Event { event },
                    AddonEvent::Message(call) => {
                        relays.insert(call.message_id.clone(), call.reply);
                        Frame::Relay(RelayFrame {
                            message_id: call.message_id,
                            address: call.target,
                            args: call.args,
                        })
                    }
                };
                enqueue(&tx, &frame);
            }
        })
    };

    // ── 3. read the host's frames ─────────────────────────────────────────
    info!(addon = %name, "worker ready");
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match envelope::decode(&line) {
            Ok(Frame::Call(call)) => {
                let local = local.clone();
                let tx = tx.clone();
                tokio::spawn(async move { answer_call(&local, call, &tx).await });
            }
            Ok(Frame::Signal { signal }) => {
                debug!(addon = %name, ?signal, "signal from host");
                if let Err(e) = local.signal(signal) {
                    error!(addon = %name, error = %e, "cannot deliver signal");
                }
            }
            Ok(Frame::RelayResponse(response)) => {
                let message_id = response.message_id.clone();
                for delivery in response.into_deliveries() {
                    let terminal = delivery.is_terminal();
                    let sink = relays.get(&message_id).map(|sink| sink.value().clone());
                    match sink {
                        Some(sink) => sink.deliver(delivery),
                        None => debug!(message_id = %message_id, "relay response for unknown call"),
                    }
                    if terminal {
                        relays.remove(&message_id);
                    }
                }
            }
            Ok(other) => warn!(addon = %name, frame = ?other, "unexpected frame from host"),
            Err(e) => warn!(addon = %name, error = %e, "dropping malformed line from host"),
        }
    }

    // ── 4. host went away: stop the addon and leave ───────────────────────
    info!(addon = %name, "host closed the channel");
    if local.state().is_running() {
        let _ = local.signal(LifecycleSignal::Stop);
        if !local.wait_for(AddonState::Stopped, STOP_ON_EOF_TIMEOUT).await {
            warn!(addon = %name, "addon did not stop in time");
        }
    }
    local.shutdown();
    pump.abort();
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_millis(200), writer_task).await;
    Ok(())
}

async fn answer_call(local: &LocalAddon, call: CallFrame, tx: &UnboundedSender<String>) {
    let CallFrame { message_id, callback, header, args } = call;
    if callback == GET_INFO {
        let body = serde_json::to_value(local.info()).unwrap_or_default();
        respond(tx, &message_id, Delivery::Body(body));
        return;
    }
    match local.execute(&callback, header, args).await {
        Ok(CallbackOutput::Value(body)) => respond(tx, &message_id, Delivery::Body(body)),
        Ok(CallbackOutput::Stream(chunks)) => {
            // a failing or panicking stream still ends with exactly one terminal frame
            let last = match AssertUnwindSafe(forward_chunks(tx, &message_id, chunks)).catch_unwind().await {
                Ok(Ok(())) => Delivery::Completed,
                Ok(Err(e)) => Delivery::Error(e.to_string()),
                Err(payload) => Delivery::Error(HostError::Panicked(panic_message(payload.as_ref())).to_string()),
            };
            respond(tx, &message_id, last);
        }
        Err(e) => respond(tx, &message_id, Delivery::Error(e.to_string())),
    }
}

async fn forward_chunks(tx: &UnboundedSender<String>, message_id: &str, mut chunks: ChunkStream) -> Result<(), HostError> {
    while let Some(chunk) = chunks.next().await {
        respond(tx, message_id, Delivery::Chunk(chunk?));
    }
    Ok(())
}

fn respond(tx: &UnboundedSender<String>, message_id: &str, delivery: Delivery) {
    enqueue(tx, &Frame::Response(ResponseFrame::from_delivery(message_id, delivery)));
}

fn enqueue(tx: &UnboundedSender<String>, frame: &Frame) {
    match envelope::encode(frame) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => error!(error = %e, "failed to encode frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon_actor::AddonEvent;
    use crate::error::HostError;
    use crate::handle::{AddonHandle, AddonHandleType};
    use crate::message::{CallbackHeader, LifecycleEvent};
    use crate::test_util::{Behavior, ScriptedAddon};
    use crate::worker_proxy::{ProxyOptions, RemoteAddon};
    use serde_json::{Value, json};
    use tokio::task::JoinHandle;

    fn worker_addon() -> ScriptedAddon {
        ScriptedAddon::new("b")
            .with_callback("echo", Behavior::Echo)
            .with_callback("count", Behavior::Stream(vec![json!(1), json!(2), json!(3)]))
            .with_callback("slow", Behavior::Delay(Duration::from_millis(300), json!("late")))
            .with_callback("broken", Behavior::Fail("bad input".into()))
            .with_callback("forward", Behavior::Forward)
            .with_callback("broken_feed", Behavior::BrokenStream(vec![json!(1)], "disk full".into()))
            .with_callback("panicking_feed", Behavior::PanickingStream(vec![json!(1)]))
    }

    /// Host proxy and worker runtime joined by an in-memory pipe.
    fn connect(addon: ScriptedAddon, call_timeout: Duration) -> (RemoteAddon, JoinHandle<Result<()>>) {
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let worker = tokio::spawn(serve(Arc::new(addon), worker_read, worker_write));
        let (host_read, host_write) = tokio::io::split(host_side);
        let options = ProxyOptions { call_timeout, ..Default::default() };
        (RemoteAddon::attach("b", options, host_read, host_write), worker)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<AddonEvent>) -> AddonEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    async fn start(remote: &RemoteAddon, events: &mut mpsc::UnboundedReceiver<AddonEvent>) {
        remote.signal(LifecycleSignal::Start).await.unwrap();
        for expected in [LifecycleEvent::Start, LifecycleEvent::Ready] {
            match next_event(events).await {
                AddonEvent::Lifecycle(e) => assert_eq!(e, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn header() -> CallbackHeader {
        CallbackHeader::new("h", "a")
    }

    #[tokio::test]
    async fn handshake_reports_info() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_millis(500));
        let handle = AddonHandle::Remote(remote);
        let info = handle.info().await.unwrap();
        assert_eq!(info.name, "b");
        assert!(info.callbacks.contains_key("echo"));
        assert!(handle.is_remote());
    }

    #[tokio::test]
    async fn call_round_trip_and_errors() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_millis(500));
        let mut events = remote.take_events().unwrap();
        start(&remote, &mut events).await;

        match remote.call("echo", header(), vec![json!(42)]).await.unwrap() {
            CallbackOutput::Value(v) => assert_eq!(v, json!(42)),
            other => panic!("unexpected {other:?}"),
        }
        let err = remote.call("broken", header(), vec![]).await.unwrap_err();
        assert!(matches!(err, HostError::Callback(ref m) if m == "bad input"));
        let err = remote.call("nope", header(), vec![]).await.unwrap_err();
        assert!(err.to_string().contains("unknown callback"));
        assert_eq!(remote.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stream_is_reassembled_in_order() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_millis(500));
        let CallbackOutput::Stream(stream) = remote.call("count", header(), vec![]).await.unwrap() else {
            panic!("expected a stream");
        };
        let chunks: Vec<Value> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(remote.pending_calls(), 0);
    }

    async fn stream_items(remote: &RemoteAddon, callback: &str) -> Vec<Result<Value, HostError>> {
        let CallbackOutput::Stream(stream) = remote.call(callback, header(), vec![]).await.unwrap() else {
            panic!("expected a stream");
        };
        tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .expect("stream must terminate")
    }

    #[tokio::test]
    async fn stream_failing_midway_ends_with_an_error() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_millis(500));
        let items = stream_items(&remote, "broken_feed").await;
        assert_eq!(items.len(), 2, "{items:?}");
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert!(matches!(&items[1], Err(HostError::Callback(m)) if m == "disk full"), "{items:?}");
        assert_eq!(remote.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stream_panicking_midway_ends_with_an_error() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_millis(500));
        let items = stream_items(&remote, "panicking_feed").await;
        assert_eq!(items.len(), 2, "{items:?}");
        match &items[1] {
            Err(HostError::Callback(m)) => assert!(m.contains("panicked"), "{m}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(remote.pending_calls(), 0);
    }

    #[tokio::test]
    async fn timeout_drops_late_response() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_millis(50));

        let err = remote.call("slow", header(), vec![]).await.unwrap_err();
        match err {
            HostError::Timeout { consecutive, timeout_ms, .. } => {
                assert_eq!(consecutive, 1);
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(remote.pending_calls(), 0);

        // let the late answer arrive; it must not leak into the next call
        tokio::time::sleep(Duration::from_millis(400)).await;
        match remote.call("echo", header(), vec![json!("fresh")]).await.unwrap() {
            CallbackOutput::Value(v) => assert_eq!(v, json!("fresh")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(remote.consecutive_timeouts(), 0);
        assert_eq!(remote.pending_calls(), 0);
    }

    #[tokio::test]
    async fn relay_answer_travels_back_to_worker() {
        let (remote, _worker) = connect(worker_addon(), Duration::from_secs(2));
        let mut events = remote.take_events().unwrap();
        start(&remote, &mut events).await;

        let pending = tokio::spawn({
            let remote = remote.clone();
            async move { remote.call("forward", header(), vec![json!("x.echo"), json!(7)]).await }
        });

        let AddonEvent::Message(call) = next_event(&mut events).await else {
            panic!("expected a relayed call");
        };
        assert_eq!(call.from, "b");
        assert_eq!(call.target, "x.echo");
        assert_eq!(call.args, vec![json!(7)]);
        call.reply.deliver(Delivery::Body(json!(7)));

        match pending.await.unwrap().unwrap() {
            CallbackOutput::Value(v) => assert_eq!(v, json!(7)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_exit_fails_calls_and_reports_stop() {
        // the test plays the worker by hand
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let remote = RemoteAddon::attach("b", ProxyOptions::default(), host_read, host_write);
        let mut events = remote.take_events().unwrap();

        let (worker_read, mut worker_write) = tokio::io::split(worker_side);
        for event in [LifecycleEvent::Start, LifecycleEvent::Ready] {
            let line = envelope::encode(&Frame::Event { event }).unwrap();
            worker_write.write_all(line.as_bytes()).await.unwrap();
        }
        for _ in 0..2 {
            next_event(&mut events).await;
        }

        let pending = tokio::spawn({
            let remote = remote.clone();
            async move { remote.call("echo", header(), vec![json!(1)]).await }
        });
        let mut worker_lines = BufReader::new(worker_read).lines();
        let call_line = worker_lines.next_line().await.unwrap().unwrap();
        assert!(matches!(envelope::decode(&call_line).unwrap(), Frame::Call(_)));

        // worker dies without answering
        drop(worker_lines);
        drop(worker_write);

        assert!(matches!(pending.await.unwrap(), Err(HostError::ChannelClosed(_))));
        match next_event(&mut events).await {
            AddonEvent::Lifecycle(LifecycleEvent::Failed { transition, .. }) => assert_eq!(transition, "worker"),
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut events).await {
            AddonEvent::Lifecycle(e) => assert_eq!(e, LifecycleEvent::Stop),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!remote.is_alive());
        let err = remote.call("echo", header(), vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, HostError::NotRunning(_)));
        // attached workers cannot be respawned
        assert!(remote.signal(LifecycleSignal::Start).await.is_err());
    }

    #[tokio::test]
    async fn host_eof_stops_the_addon() {
        let addon = worker_addon();
        let counters = addon.counters();
        let (remote, worker) = connect(addon, Duration::from_secs(2));
        let mut events = remote.take_events().unwrap();
        start(&remote, &mut events).await;

        remote.shutdown().await;
        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
        assert_eq!(counters.stops(), 1);
    }
}
