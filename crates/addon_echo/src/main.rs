use std::sync::Arc;

use addon_echo::EchoAddon;
use addon_plugin::worker_runtime::{init_worker_logging, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_worker_logging("echo");
    run(Arc::new(EchoAddon::default())).await
}
