use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use trellis_store::{AuthStore, SqliteHubStore};

#[derive(Parser)]
#[command(name = "trellis", about = "Trellis — hub for an address-routed message bus")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file path (default: discover trellis.*, then setup.*).
    #[arg(long, global = true, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind to (overrides the config value).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides the config value).
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub (default when no subcommand is provided).
    Serve,
    /// Validate the configuration and check store connectivity.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("starting hub");
            trellis_hub::run(trellis_hub::RunOptions {
                config_path: cli.config,
                bind: cli.bind,
                port: cli.port,
            })
            .await
        },
        Commands::Doctor => doctor(cli.config).await,
    }
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(true))
            .init();
    }
}

async fn doctor(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = trellis_config::load(config.as_deref())?;
    config.validate()?;
    println!(
        "config ok: address {}, listening on {}:{}",
        config.address, config.listen.bind, config.listen.port
    );
    if config.setup_mode {
        println!("setup mode is ON: only setup actions will be honored");
    }

    let store = SqliteHubStore::connect(&config.store.url).await?;
    let snapshot = store.export_all().await?;
    println!(
        "store ok: {} auth records, {} endpoints",
        snapshot.get("auth").map_or(0, Vec::len),
        snapshot.get("endpoints").map_or(0, Vec::len),
    );
    Ok(())
}
