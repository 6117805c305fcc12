use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "handover")]
#[command(about = "Handover CLI — bot/operator message relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: HANDOVER_CONFIG_PATH or ~/.handover/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the relay: restore the last snapshot, then serve the control API and transport bridge endpoint.
    Serve {
        /// Config file path (default: HANDOVER_CONFIG_PATH or ~/.handover/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 3001)
        #[arg(long, short)]
        port: Option<u16>,

        /// Operator inactivity timeout in minutes (overrides config)
        #[arg(long, value_name = "MINUTES")]
        operator_timeout: Option<u64>,

        /// Delay in seconds before the bot is asked to reply after an operator disconnects (overrides config)
        #[arg(long, value_name = "SECONDS")]
        bot_delay: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("handover {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve {
            config,
            port,
            operator_timeout,
            bot_delay,
        }) => {
            if let Err(e) = run_serve(config, port, operator_timeout, bot_delay).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(handover::config::default_config_path);
    let dir = handover::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    operator_timeout: Option<u64>,
    bot_delay: Option<u64>,
) -> anyhow::Result<()> {
    let (mut config, path) = handover::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if let Some(minutes) = operator_timeout.filter(|m| *m > 0) {
        config.ownership.operator_timeout_minutes = minutes;
    }
    if let Some(seconds) = bot_delay.filter(|s| *s > 0) {
        config.ownership.bot_delay_seconds = seconds;
    }
    log::info!(
        "starting relay on {}:{} (operator timeout {} min, bot delay {} s)",
        config.gateway.bind,
        config.gateway.port,
        config.ownership.operator_timeout_minutes,
        config.ownership.bot_delay_seconds
    );
    handover::gateway::run_gateway(config, path).await
}
