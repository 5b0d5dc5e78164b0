use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use botfleet::config::OrchestratorConfig;
use botfleet::node::Node;
use botfleet::operations::OperationRegistry;
use botfleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "botfleet")]
#[command(version)]
#[command(about = "Job claim and bot health orchestrator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator: API server, health monitor, optional local bots
    Server(ServerArgs),

    /// List the operations this build can execute
    Operations {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// TOML configuration file; defaults apply to anything it leaves out
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the configured listen address port)
    #[arg(long)]
    port: Option<u16>,

    /// Number of bots to run inside this process
    #[arg(long, default_value = "0")]
    local_bots: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            OrchestratorConfig::load(path)?
        }
        None => OrchestratorConfig::default(),
    };
    if let Some(port) = args.port {
        let addr = SocketAddr::new(config.listen_addr.ip(), port);
        config = config.with_listen_addr(addr);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        lease_secs = config.claims.lease_secs,
        session_ttl_secs = config.session.ttl_secs,
        local_bots = args.local_bots,
        "Starting orchestrator"
    );

    let node = Node::new(config, OperationRegistry::with_defaults())?.with_local_bots(args.local_bots);
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;

    tracing::info!("Orchestrator shut down cleanly");
    Ok(())
}

fn print_operations(output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let operations = OperationRegistry::with_defaults().list();
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&operations)?);
        }
        OutputFormat::Table => {
            println!("{:<12} DESCRIPTION", "NAME");
            println!("{}", "-".repeat(60));
            for op in &operations {
                println!("{:<12} {}", op.name, op.description);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Operations { output } => {
            print_operations(&output)?;
        }
    }

    Ok(())
}
