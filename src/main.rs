use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet_coord::client::Client;
use fleet_coord::config::{FleetFile, ServerConfig, UntrustedPeerPolicy, DEFAULT_BASE_PORT};
use fleet_coord::protocol::ExperimentId;
use fleet_coord::shutdown::install_shutdown_handler;
use fleet_coord::WorkerServer;

#[derive(Parser, Debug)]
#[command(name = "fleet-coord")]
#[command(version)]
#[command(about = "Coordination server for a fleet of training workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordination server
    Server(ServerArgs),

    /// Reset an experiment on its worker and on the server
    Reset {
        #[command(flatten)]
        client: ClientArgs,

        /// Experiment id, "project:run"
        exp: String,
    },

    /// Deploy a run's launch files to a worker
    Deploy {
        #[command(flatten)]
        client: ClientArgs,

        /// Target worker, "ip:port"
        #[arg(long)]
        worker: String,

        /// Experiment id, "project:run"
        exp: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// JSON file with TRUSTED_ADDR and available_worker_clients
    #[arg(long)]
    fleet_file: PathBuf,

    /// Address to bind all listeners on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Base port; services use P, P+2, P+4 and P+6
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    port: u16,

    /// Seconds between worker status polls
    #[arg(long, default_value = "60")]
    poll_interval_secs: u64,

    /// Root of the run directory tree
    #[arg(long, default_value = "runs")]
    runs_dir: PathBuf,

    /// Directory for per-worker status files
    #[arg(long, default_value = "workers_meta")]
    workers_meta_dir: PathBuf,

    /// Socket read timeout in seconds
    #[arg(long, default_value = "30")]
    io_timeout_secs: u64,

    /// Outbound connect timeout in seconds
    #[arg(long, default_value = "5")]
    connect_timeout_secs: u64,

    /// Attempts to reach a worker during an experiment reset
    #[arg(long, default_value = "5")]
    reset_attempts: u32,

    /// Let the OS choose source ports for outbound connections
    #[arg(long)]
    no_pin_outbound: bool,

    /// Drop untrusted connections instead of stopping the listener
    #[arg(long)]
    reject_untrusted: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server listener address, e.g. 127.0.0.1:14790 for resets
    #[arg(long, short = 'a')]
    addr: String,

    /// Local address to connect from; must be in the server's trust list
    #[arg(long)]
    local: Option<SocketAddr>,
}

impl ClientArgs {
    fn client(&self) -> Client {
        let client = Client::new(self.addr.clone());
        match self.local {
            Some(local) => client.with_local(local),
            None => client,
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let fleet = FleetFile::load(&args.fleet_file).await?;

    let mut config = ServerConfig::new(args.bind, args.port)
        .with_fleet(fleet)?
        .with_dirs(args.runs_dir, args.workers_meta_dir);
    config.poll_interval = Duration::from_secs(args.poll_interval_secs);
    config.io_timeout = Duration::from_secs(args.io_timeout_secs);
    config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    config.reset_attempts = args.reset_attempts;
    config.pin_outbound_ports = !args.no_pin_outbound;
    if args.reject_untrusted {
        config.untrusted_policy = UntrustedPeerPolicy::RejectConnection;
    }

    tracing::info!(
        bind = %config.bind_ip,
        base_port = config.base_port,
        poll_interval_secs = args.poll_interval_secs,
        workers = ?config.workers.iter().collect::<Vec<_>>(),
        untrusted_policy = ?config.untrusted_policy,
        "Starting fleet-coord server"
    );

    let shutdown = install_shutdown_handler()?;
    WorkerServer::new(config).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Reset { client, exp } => {
            let exp: ExperimentId = exp.parse()?;
            let reply = client.client().reset(&exp).await?;
            println!("{}", reply);
        }
        Commands::Deploy {
            client,
            worker,
            exp,
        } => {
            let exp: ExperimentId = exp.parse()?;
            let reply = client.client().deploy(&worker, &exp).await?;
            println!("{}", reply);
        }
    }

    Ok(())
}
