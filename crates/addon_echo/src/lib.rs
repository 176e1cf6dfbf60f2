use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use addon_plugin::{Addon, AddonContext, AddonError, AddonInfo, CallbackHeader, CallbackOutput};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::info;

pub const NAME: &str = "echo";

/// Sample addon: echoes, counts and forwards calls to other addons.
#[derive(Default)]
pub struct EchoAddon {
    ctx: Mutex<Option<AddonContext>>,
    asleep: AtomicBool,
}

impl EchoAddon {
    fn context(&self) -> Option<AddonContext> {
        self.ctx.lock().ok().and_then(|c| c.clone())
    }
}

#[async_trait]
impl Addon for EchoAddon {
    fn info(&self) -> AddonInfo {
        AddonInfo::new(NAME)
            .with_callback("echo", Some("returns its first argument"))
            .with_callback("stream", Some("streams 0..n"))
            .with_callback("wait", Some("sleeps for n milliseconds, then answers"))
            .with_callback("fail", Some("always fails"))
            .with_callback("forward", Some("calls args[0] with the remaining arguments"))
    }

    async fn start(&self, ctx: AddonContext) -> Result<(), AddonError> {
        info!("[echo] started");
        if let Ok(mut slot) = self.ctx.lock() {
            *slot = Some(ctx);
        }
        self.asleep.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AddonError> {
        info!("[echo] stopped");
        Ok(())
    }

    async fn sleep(&self) -> Result<(), AddonError> {
        self.asleep.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn awake(&self) -> Result<(), AddonError> {
        self.asleep.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute_callback(
        &self,
        callback: &str,
        header: CallbackHeader,
        args: Vec<Value>,
    ) -> Result<CallbackOutput, AddonError> {
        info!("[echo] {} called by {}", callback, header.from);
        match callback {
            "echo" => Ok(CallbackOutput::Value(args.into_iter().next().unwrap_or(Value::Null))),
            "stream" => {
                let n = args.first().and_then(Value::as_u64).unwrap_or(3);
                let chunks = futures::stream::iter(0..n).then(|i| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    json!(i)
                });
                Ok(CallbackOutput::stream(chunks))
            }
            "wait" => {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(CallbackOutput::Value(json!(ms)))
            }
            "fail" => Err(AddonError::Failed("echo was asked to fail".into())),
            "forward" => {
                if self.asleep.load(Ordering::SeqCst) {
                    return Ok(CallbackOutput::Value(json!({ "error": "echo is asleep" })));
                }
                let mut args = args.into_iter();
                let target = args
                    .next()
                    .and_then(|t| t.as_str().map(str::to_string))
                    .ok_or_else(|| AddonError::Failed("forward needs a target address".into()))?;
                let ctx = self
                    .context()
                    .ok_or_else(|| AddonError::Failed("echo is not started".into()))?;
                let value = ctx.send_message(target, args.collect()).value().await?;
                Ok(CallbackOutput::Value(value))
            }
            other => Err(AddonError::UnknownCallback(other.to_string())),
        }
    }
}
