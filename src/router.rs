use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use addon_plugin::addon::panic_message;
use addon_plugin::{CallbackOutput, Delivery, HostError, OutboundCall, ReplySink};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dump::Dumper;
use crate::error::AgentError;
use crate::logger::CallMetrics;
use crate::routing::{Route, RoutingTable, TargetAddress};

/// Fixed wait for a target whose addon is still starting.
pub const GRACE_PERIOD: Duration = Duration::from_millis(750);

/// Delivers addon-originated calls to the addon owning the target address.
pub struct Router {
    table: Arc<RoutingTable>,
    grace: Duration,
    dumper: Arc<Dumper>,
    metrics: CallMetrics,
    timeout_dump_threshold: u32,
}

impl Router {
    pub fn new(table: Arc<RoutingTable>, dumper: Arc<Dumper>) -> Self {
        Self {
            table,
            grace: GRACE_PERIOD,
            dumper,
            metrics: CallMetrics::new(),
            timeout_dump_threshold: 3,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Consecutive timeouts of one addon that produce a dump. 0 disables.
    pub fn with_timeout_dump_threshold(mut self, threshold: u32) -> Self {
        self.timeout_dump_threshold = threshold;
        self
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Look the target up, waiting up to the grace period for it to appear.
    /// Any install wakes the wait early; the deadline is not extended.
    pub async fn resolve(&self, target: &str) -> Option<Route> {
        let address = TargetAddress::parse(target)?;
        let deadline = Instant::now() + self.grace;
        loop {
            let notified = self.table.changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(route) = self.table.lookup(&address) {
                return Some(route);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.table.lookup(&address);
            }
        }
    }

    /// Route one call and answer it through its reply sink. Never fails and
    /// never panics; every problem reaches the caller as an error delivery.
    pub async fn dispatch(&self, call: OutboundCall) {
        let started = Instant::now();
        self.metrics.started();

        let outcome = AssertUnwindSafe(self.route_call(&call)).catch_unwind().await;
        let status = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.maybe_dump(&err);
                call.reply.deliver(Delivery::Error(err.to_string()));
                Err(err.code())
            }
            Err(payload) => {
                let message = format!("call to '{}' panicked: {}", call.target, panic_message(payload.as_ref()));
                warn!(from = %call.from, target = %call.target, "{message}");
                call.reply.deliver(Delivery::Error(message));
                Err("E_PANIC")
            }
        };

        let elapsed = started.elapsed();
        self.metrics.finished(elapsed, status.is_ok());
        tracing::event!(
            target: "call",
            tracing::Level::INFO,
            message_id = %call.message_id,
            from = %call.from,
            target_address = %call.target,
            latency_ms = elapsed.as_secs_f64() * 1_000.0,
            status = match status {
                Ok(()) => "ok",
                Err(code) => code,
            },
        );
    }

    async fn route_call(&self, call: &OutboundCall) -> Result<(), AgentError> {
        let route = self.resolve(&call.target).await.ok_or_else(|| AgentError::TargetNotFound {
            target: call.target.clone(),
            from: call.from.clone(),
        })?;
        debug!(message_id = %call.message_id, from = %call.from, target = %call.target, "routing call");

        match route.invoke(&call.message_id, &call.from, call.args.clone()).await? {
            CallbackOutput::Value(value) => {
                if let Some(message) = application_error(&value) {
                    return Err(AgentError::Application(message));
                }
                call.reply.deliver(Delivery::Body(value));
            }
            CallbackOutput::Stream(mut chunks) => {
                while let Some(chunk) = chunks.next().await {
                    call.reply.deliver(Delivery::Chunk(chunk?));
                }
                call.reply.deliver(Delivery::Completed);
            }
        }
        Ok(())
    }

    fn maybe_dump(&self, err: &AgentError) {
        if let AgentError::Host(HostError::Timeout { consecutive, .. }) = err {
            if self.timeout_dump_threshold > 0 && *consecutive == self.timeout_dump_threshold {
                self.dumper.dump_error(err);
            }
        }
    }
}

/// The text of a non-null `error` field on an object result.
fn application_error(value: &Value) -> Option<String> {
    match value.as_object()?.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_plugin::envelope::{self, Frame, ResponseFrame};
    use addon_plugin::test_util::{Behavior, ScriptedAddon};
    use addon_plugin::{AddonHandle, LifecycleEvent, LocalAddon, ProxyOptions, RemoteAddon, Reply};
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    fn local(addon: ScriptedAddon) -> AddonHandle {
        AddonHandle::Local(LocalAddon::spawn(Arc::new(addon)))
    }

    fn outbound(target: &str, args: Vec<Value>) -> (OutboundCall, Reply) {
        let (tx, rx) = mpsc::unbounded_channel();
        let call = OutboundCall {
            message_id: uuid::Uuid::new_v4().to_string(),
            from: "a".into(),
            target: target.into(),
            args,
            reply: Arc::new(tx),
        };
        let reply = Reply::new(call.message_id.clone(), rx);
        (call, reply)
    }

    fn router(grace: Duration) -> (Router, tempfile::TempDir) {
        let root = tempdir().unwrap();
        let router = Router::new(Arc::new(RoutingTable::new()), Arc::new(Dumper::new(root.path())))
            .with_grace(grace);
        (router, root)
    }

    #[test]
    fn application_errors_need_a_non_null_error_field() {
        assert_eq!(application_error(&json!({"error": "nope"})), Some("nope".into()));
        assert_eq!(application_error(&json!({"error": {"code": 1}})), Some("{\"code\":1}".into()));
        assert_eq!(application_error(&json!({"error": null})), None);
        assert_eq!(application_error(&json!("error")), None);
        assert_eq!(application_error(&json!([{"error": 1}])), None);
    }

    #[tokio::test]
    async fn value_is_delivered_as_body() {
        let (router, _root) = router(Duration::from_millis(100));
        router.table().install(local(ScriptedAddon::new("b").with_callback("echo", Behavior::Echo)), ["echo"]);
        let (call, reply) = outbound("b.echo", vec![json!(42)]);
        router.dispatch(call).await;
        assert_eq!(reply.collect().await, vec![Delivery::Body(json!(42))]);
    }

    #[tokio::test]
    async fn stream_is_forwarded_chunk_by_chunk() {
        let (router, _root) = router(Duration::from_millis(100));
        let chunks = vec![json!(1), json!(2), json!(3)];
        router
            .table()
            .install(local(ScriptedAddon::new("b").with_callback("s", Behavior::Stream(chunks))), ["s"]);
        let (call, reply) = outbound("b.s", vec![]);
        router.dispatch(call).await;
        assert_eq!(
            reply.collect().await,
            vec![
                Delivery::Chunk(json!(1)),
                Delivery::Chunk(json!(2)),
                Delivery::Chunk(json!(3)),
                Delivery::Completed
            ]
        );
    }

    /// Attaches a worker played by the test and returns its side of the pipe.
    async fn scripted_worker(
        router: &Router,
    ) -> (Lines<BufReader<ReadHalf<DuplexStream>>>, WriteHalf<DuplexStream>) {
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
            tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        }
        router.table().install(AddonHandle::Remote(remote), ["feed"]);
        (BufReader::new(worker_read).lines(), worker_write)
    }

    async fn answer(worker: &mut WriteHalf<DuplexStream>, message_id: &str, delivery: Delivery) {
        let frame = Frame::Response(ResponseFrame::from_delivery(message_id, delivery));
        worker.write_all(envelope::encode(&frame).unwrap().as_bytes()).await.unwrap();
    }

    async fn call_id(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> String {
        let line = lines.next_line().await.unwrap().unwrap();
        match envelope::decode(&line).unwrap() {
            Frame::Call(call) => call.message_id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_error_midway_through_a_stream_is_not_completed() {
        let (router, _root) = router(Duration::from_millis(100));
        let (mut lines, mut worker) = scripted_worker(&router).await;
        let (call, reply) = outbound("b.feed", vec![]);
        let routed = tokio::spawn(async move { router.dispatch(call).await });

        let id = call_id(&mut lines).await;
        answer(&mut worker, &id, Delivery::Chunk(json!(1))).await;
        answer(&mut worker, &id, Delivery::Error("disk full".into())).await;
        routed.await.unwrap();

        assert_eq!(
            reply.collect().await,
            vec![Delivery::Chunk(json!(1)), Delivery::Error("disk full".into())]
        );
    }

    #[tokio::test]
    async fn worker_exit_midway_through_a_stream_is_not_completed() {
        let (router, _root) = router(Duration::from_millis(100));
        let (mut lines, mut worker) = scripted_worker(&router).await;
        let (call, reply) = outbound("b.feed", vec![]);
        let routed = tokio::spawn(async move { router.dispatch(call).await });

        let id = call_id(&mut lines).await;
        answer(&mut worker, &id, Delivery::Chunk(json!(1))).await;
        drop(lines);
        drop(worker);
        tokio::time::timeout(Duration::from_secs(2), routed).await.unwrap().unwrap();

        match reply.collect().await.as_slice() {
            [Delivery::Chunk(first), Delivery::Error(message)] => {
                assert_eq!(first, &json!(1));
                assert!(message.contains("closed"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_stream_failure_ends_with_an_error() {
        let (router, _root) = router(Duration::from_millis(100));
        let addon = ScriptedAddon::new("b")
            .with_callback("broken", Behavior::BrokenStream(vec![json!(1)], "disk full".into()));
        router.table().install(local(addon), ["broken"]);
        let (call, reply) = outbound("b.broken", vec![]);
        router.dispatch(call).await;
        assert_eq!(
            reply.collect().await,
            vec![Delivery::Chunk(json!(1)), Delivery::Error("disk full".into())]
        );
    }

    #[tokio::test]
    async fn failures_become_single_error_frames() {
        let (router, _root) = router(Duration::from_millis(100));
        let addon = ScriptedAddon::new("b")
            .with_callback("app", Behavior::AppError("bad input".into()))
            .with_callback("fail", Behavior::Fail("exploded".into()))
            .with_callback("panic", Behavior::Panic);
        router.table().install(local(addon), ["app", "fail", "panic"]);

        for (target, expected) in [("b.app", "bad input"), ("b.fail", "exploded"), ("b.panic", "scripted panic")] {
            let (call, reply) = outbound(target, vec![]);
            router.dispatch(call).await;
            let got = reply.collect().await;
            assert_eq!(got.len(), 1, "{target}: {got:?}");
            match &got[0] {
                Delivery::Error(message) => assert!(message.contains(expected), "{target}: {message}"),
                other => panic!("{target}: unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unknown_target_waits_for_the_grace_period() {
        let (router, _root) = router(Duration::from_millis(200));
        let started = Instant::now();
        let (call, reply) = outbound("ghost.echo", vec![]);
        router.dispatch(call).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200), "{waited:?}");
        assert!(waited < Duration::from_millis(800), "{waited:?}");
        match reply.collect().await.as_slice() {
            [Delivery::Error(message)] => {
                assert_eq!(message, "Unable to find target 'ghost.echo' requested by addon 'a'")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_install_is_picked_up_before_the_deadline() {
        let (router, _root) = router(Duration::from_millis(750));
        let router = Arc::new(router);
        let (call, reply) = outbound("b.echo", vec![json!("late")]);
        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.dispatch(call).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        router.table().install(local(ScriptedAddon::new("b").with_callback("echo", Behavior::Echo)), ["echo"]);
        pending.await.unwrap();
        assert_eq!(reply.value().await.unwrap(), json!("late"));
    }
}
