use clap::{App, Arg};
use spacepark::config::{ConfigError, ServerConfig, DEFAULT_CONFIG_FILE};
use spacepark::{DockAllocator, DockServer, SqliteLedger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("spacepark-server")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Headless docking coordination server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("PATH")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_FILE),
        )
        .arg(
            Arg::with_name("db")
                .short("d")
                .long("db")
                .value_name("PATH")
                .help("Ledger database file (overrides db_path)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("First port to try (overrides port)")
                .takes_value(true),
        )
        .get_matches();

    let config_path = PathBuf::from(matches.value_of("config").unwrap_or(DEFAULT_CONFIG_FILE));
    let mut config = match ServerConfig::load(&config_path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            ServerConfig::write_default(&path)?;
            error!(
                path = %path.display(),
                "Configuration file not found; a default has been written. Check it and restart."
            );
            return Err(ConfigError::NotFound(path).into());
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(db) = matches.value_of("db") {
        config.db_path = PathBuf::from(db);
    }
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse()?;
        if config.port_range_end.is_some_and(|end| end < config.port) {
            config.port_range_end = None;
        }
    }
    config.validate()?;

    if !config.db_path.exists() {
        warn!(
            path = %config.db_path.display(),
            "Ledger database not found; a new one will be created"
        );
    }
    let ledger = SqliteLedger::open(&config.db_path)?;
    let allocator = Arc::new(DockAllocator::new(ledger));

    let server = DockServer::bind(&config, allocator).await?;
    let stats = server.stats();
    info!(address = %server.local_addr()?, "Spacepark server running");

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let totals = stats.snapshot();
    info!(
        accepted = totals.accepted,
        rejected = totals.rejected,
        requests = totals.requests,
        protocol_errors = totals.protocol_errors,
        "Spacepark server stopped"
    );
    Ok(())
}
