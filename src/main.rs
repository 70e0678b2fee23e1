//! Mock Simulator - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use mock_simulator::{
    Configuration, ConfigSource, EmbeddedSource, EngineOptions, FileSource, Listener,
    SimulationEngine,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

const DEMO_CONFIG: &str = include_str!("../demos/default-config.yaml");

#[derive(Parser, Debug)]
#[command(
    name = "mock-simulator",
    about = "Configuration-driven HTTP mock server - routing, response selection, templates and delays",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-simulator.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Poll the configuration file for changes every N milliseconds (0 disables)
    #[arg(long, default_value_t = 2000)]
    reload_interval_ms: u64,

    /// Number of requests kept in the history
    #[arg(long, default_value_t = 200)]
    history_capacity: usize,

    /// Queue length of each event subscriber
    #[arg(long, default_value_t = 256)]
    event_buffer: usize,

    /// Print the demo configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Serve the bundled demo configuration instead of --config
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", DEMO_CONFIG);
        return Ok(());
    }

    if args.validate {
        if !args.config.exists() {
            anyhow::bail!("Configuration file not found: {:?}", args.config);
        }
        let config = Configuration::from_file(&args.config)?;
        println!(
            "Configuration is valid ({} endpoints defined)",
            config.endpoints.len()
        );
        return Ok(());
    }

    let source: Arc<dyn ConfigSource> = if args.demo {
        info!("Using bundled demo configuration");
        Arc::new(EmbeddedSource::new("demo", DEMO_CONFIG))
    } else {
        info!(path = ?args.config, "Loading configuration");
        Arc::new(FileSource::new(&args.config))
    };

    let options = EngineOptions {
        history_capacity: args.history_capacity,
        event_buffer: args.event_buffer,
    };
    let engine = Arc::new(SimulationEngine::new(source, options));

    // Keep serving with an empty configuration; the watcher picks up a fixed file
    let _ = engine.load().await;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(kind = ?event.kind, payload = %event.payload, "Event");
        }
    });

    let _watcher = (args.reload_interval_ms > 0 && !args.demo)
        .then(|| engine.spawn_reload_watcher(Duration::from_millis(args.reload_interval_ms)));

    let listener = Listener::new(engine.clone());
    let addr = listener.start(args.listen).await?;
    info!(
        address = %addr,
        endpoints = engine.snapshot().config.endpoints.len(),
        "Mock simulator v{} ready",
        env!("CARGO_PKG_VERSION")
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    listener.stop().await;

    let stats = engine.stats();
    info!(
        total = stats.total_requests,
        matched = stats.matched,
        unmatched = stats.unmatched,
        errored = stats.errored,
        "Request totals"
    );
    Ok(())
}
