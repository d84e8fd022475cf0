//! proxy-upstream: drive the upstream fetch engine from the command line.
//!
//! ```text
//!   urls ──▶ FetchHandle ──▶ Driver ──▶ Upstream engine ──▶ origins
//!                                 │
//!                                 └──▶ MemoryStore (objects)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use proxy_upstream::config::{load_config, UpstreamConfig};
use proxy_upstream::http::Method;
use proxy_upstream::observability::{logging, metrics};
use proxy_upstream::upstream::render_listing;
use proxy_upstream::{Driver, Shutdown};

#[derive(Parser)]
#[command(name = "proxy-upstream")]
#[command(about = "Fetch URLs through the caching proxy's upstream engine", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch each URL into the in-memory store and print what arrived
    Fetch {
        urls: Vec<String>,
        /// Issue HEAD instead of GET
        #[arg(long)]
        head: bool,
        /// Print the origin table afterwards
        #[arg(long)]
        listing: bool,
        /// Print the origin table as JSON
        #[arg(long, requires = "listing")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => UpstreamConfig::default().normalize(),
    };
    logging::init_logging(&config.observability);

    tracing::info!(
        proxy_name = %config.proxy.proxy_name,
        server_slots = config.pool.server_slots,
        parent = ?config.parent.host,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    let (driver, handle) = Driver::new(Arc::new(config));
    let driver_task = tokio::spawn(driver.run(shutdown.subscribe()));

    let Commands::Fetch {
        urls,
        head,
        listing,
        json,
    } = cli.command;
    let method = if head { Method::Head } else { Method::Get };

    let fetches: Vec<_> = urls
        .into_iter()
        .map(|url| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let result = handle.fetch(&url, method).await;
                (url, result)
            })
        })
        .collect();

    let mut failed = 0;
    for fetch in fetches {
        let (url, result) = fetch.await?;
        match result {
            Ok(report) => println!(
                "{} {} {} {}",
                report.status,
                report
                    .length
                    .map_or_else(|| "-".to_string(), |l| l.to_string()),
                report.body.len(),
                url
            ),
            Err(e) => {
                failed += 1;
                println!("{} - - {} ({})", e.status().as_u16(), url, e);
            }
        }
    }

    if listing {
        let origins = handle.listing().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&origins)?);
        } else {
            print!("{}", render_listing(&origins));
        }
    }

    drop(handle);
    shutdown.trigger();
    driver_task.await?;

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
