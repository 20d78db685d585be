use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use presetd::App;
use presetd::Config;
use presetd::config::LoggingConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps smart speaker preset buttons pointed at streams you choose.
#[derive(Parser, Debug)]
#[command(name = "presetd", version, about)]
struct Cli {
    /// Config files, merged in order. Each field may be set in only one of them.
    #[arg(short, long = "config", default_value = "presetd.toml")]
    config: Vec<PathBuf>,
}

fn init_logging(logging: &LoggingConfig) {
    let targets = logging.overrides.iter().fold(
        Targets::new().with_default(LevelFilter::from(logging.level)),
        |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, diagnostics) = Config::from_files(&cli.config).context("Failed to load config")?;
    init_logging(&config.logging);

    if !diagnostics.is_empty() {
        for line in presetd::format_diagnostics(&diagnostics).lines() {
            tracing::warn!("{}", line);
        }
    }

    tracing::info!("presetd {} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Speakers will fetch descriptors from {}",
        config.server.public_url
    );

    let app = Arc::new(App::from_config(&config).context("Failed to start")?);

    let periodic = config
        .sync
        .interval
        .map(|interval| app.spawn_periodic_sync(interval));
    if periodic.is_none() {
        tracing::info!("No sync interval configured; sync runs only on request");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut server = tokio::spawn(presetd::api::serve(
        app.clone(),
        config.server.listen,
        config.server.port,
        shutdown_rx,
    ));

    tracing::info!("Press Ctrl+C to exit");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        },
        // The server only returns early if it could not start
        result = &mut server => {
            result.context("HTTP server task panicked")?.context("HTTP server failed")?;
        }
    }

    if let Some(periodic) = periodic {
        periodic.abort();
    }
    shutdown_tx.send(()).ok();
    if !server.is_finished() {
        server
            .await
            .context("HTTP server task panicked")?
            .context("HTTP server failed")?;
    }

    tracing::info!("presetd shutdown complete");
    Ok(())
}
