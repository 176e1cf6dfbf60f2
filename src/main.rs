use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use addon_agent::{
    catalog::{AddonCatalog, discover_addons},
    config::{CONFIG_FILE, ConfigStore},
    logger::init_tracing,
    reconciler::{Core, CoreOptions},
};
use addon_plugin::worker_runtime::{self, init_worker_logging};
use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "addon-agent", about = "Local addon host", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until Ctrl-C
    Run(RunArgs),

    /// Create the agent layout and a default configuration
    Init,

    /// Write the JSON-Schema of agent.json into the agent root
    Schema,

    /// List configured and installed addons
    List,

    /// Host one built-in addon over stdin/stdout (used by the agent itself)
    #[command(hide = true)]
    Worker { addon: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log level (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Do not reload agent.json when it changes on disk
    #[arg(long)]
    no_watch: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self { log_level: "info".to_string(), otel_endpoint: None, no_watch: false }
    }
}

/// Resolve the agent root from the environment or use the default.
fn resolve_root_dir() -> PathBuf {
    match env::var("ADDON_AGENT_ROOT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("./agent"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    // .env is optional
    let _ = dotenvy::from_path(root.join(".env"));

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(root, args).await,
        Commands::Worker { addon } => worker(&addon).await,
        Commands::Init => {
            for dir in ["addons", "logs", "debug"] {
                fs::create_dir_all(root.join(dir))
                    .with_context(|| format!("cannot create {}", root.join(dir).display()))?;
            }
            let store = ConfigStore::open(root.join(CONFIG_FILE))?;
            let added = store.discover(&root, &AddonCatalog::with_builtins())?;
            println!("Initialized agent layout at {} ({added} addons configured)", root.display());
            Ok(())
        }
        Commands::Schema => {
            fs::create_dir_all(&root)?;
            let out = root.join("agent.schema.json");
            fs::write(&out, serde_json::to_string_pretty(&ConfigStore::schema())?)?;
            println!("Schema written to {}", out.display());
            Ok(())
        }
        Commands::List => {
            let path = root.join(CONFIG_FILE);
            if !path.exists() {
                bail!("no configuration at {}, run `addon-agent init` first", path.display());
            }
            let store = ConfigStore::open(path)?;
            for (name, descriptor) in store.addons() {
                let status = if descriptor.active { "active" } else { "inactive" };
                let mode = if descriptor.standalone { " standalone" } else { "" };
                println!("{name:<24} {status}{mode}");
            }
            let configured = store.addons();
            for name in discover_addons(&root).into_iter().filter(|n| !configured.contains_key(n)) {
                println!("{name:<24} installed, not configured");
            }
            Ok(())
        }
    }
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    if !root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `addon-agent init` first.",
            root.display()
        );
    }
    let telemetry = init_tracing(
        root.clone(),
        "logs/agent.log".to_string(),
        "logs/agent_events.log".to_string(),
        args.log_level.clone(),
        args.otel_endpoint.clone(),
    )?;
    info!("addon agent starting in {}", root.display());

    let catalog = AddonCatalog::with_builtins();
    let store = ConfigStore::open(root.join(CONFIG_FILE))?;
    let added = store.discover(&root, &catalog)?;
    if added > 0 {
        info!("configured {added} discovered addons");
    }
    if !args.no_watch {
        if let Err(e) = store.watch(Duration::from_millis(500)).await {
            warn!("not watching {}: {e:#}", CONFIG_FILE);
        }
    }

    let options = CoreOptions::from_settings(&root, &store.settings());
    let core = Core::new(options, Arc::clone(&store), catalog);
    core.initialize();

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    if let Err(e) = core.exit().await {
        error!("exit failed: {e}");
    }
    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    Ok(())
}

async fn worker(addon: &str) -> anyhow::Result<()> {
    init_worker_logging(addon);
    let Some(instance) = AddonCatalog::with_builtins().builtin(addon) else {
        bail!("no built-in addon named '{addon}'");
    };
    worker_runtime::run(instance).await
}
