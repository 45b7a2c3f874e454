//! deskcast agent entry point.
//!
//! ```text
//! deskcast-agent                  Run in the foreground
//! deskcast-agent --config <path>  Load a custom config TOML
//! deskcast-agent --gen-config     Write default config to stdout
//! deskcast-agent --list-displays  Print the attached displays and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskcast_agent::config::AgentConfig;
use deskcast_agent::service::AgentService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "deskcast-agent", about = "Adaptive desktop streaming agent")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "deskcast-agent.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Print the attached displays and exit.
    #[arg(long)]
    list_displays: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", AgentConfig::default_toml()?);
        return Ok(());
    }

    let config = AgentConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("deskcast-agent v{}", env!("CARGO_PKG_VERSION"));

    let service = AgentService::new(config);

    if cli.list_displays {
        let selected = service.displays().selected_or_primary();
        for display in service.displays().displays() {
            let marker = if selected.as_ref() == Some(&display) { '*' } else { ' ' };
            let area = display.monitor_area;
            println!(
                "{marker} {:<16} {:<24} {}x{} at ({}, {}){}",
                display.device_name,
                display.display_name,
                area.width,
                area.height,
                area.left,
                area.top,
                if display.is_primary { " primary" } else { "" },
            );
        }
        return Ok(());
    }

    let cancel = service.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        cancel.cancel();
    });

    service.run().await?;

    Ok(())
}
