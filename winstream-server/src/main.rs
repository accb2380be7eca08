//! winstream-server: entry point.
//!
//! ```text
//! winstream-server                  Run in the foreground
//! winstream-server --config <path>  Load a custom config TOML
//! winstream-server --listen <addr>  Override the listen address
//! winstream-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use winstream_server::config::ServerConfig;
use winstream_server::service::StreamService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "winstream-server", about = "Stream a synthetic window to winstream clients")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "winstream-server.toml")]
    config: PathBuf,

    /// Listen address, overrides `network.listen`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.listen = listen;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("winstream-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}", config.network.listen);
    info!(
        "pattern: {}x{} @ {} fps",
        config.pattern.width, config.pattern.height, config.pattern.fps
    );

    let service = StreamService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
