use std::sync::Arc;

use clap::{Parser, Subcommand};
use reqwest::Client;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seedr::agents::{AgentInfo, AgentRegistry};
use seedr::config::Config;
use seedr::scheduler::Scheduler;
use seedr::seeds::{MySqlTopology, SeedStateMachine};
use seedr::shutdown::Shutdown;
use seedr::storage::SqliteStorage;

#[derive(Parser)]
#[command(name = "seedr")]
#[command(about = "Coordinator for distributed MySQL seeding", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator (seed scheduler + agent refresh)
    Serve,
    /// Manage agents
    Agents {
        #[command(subcommand)]
        action: AgentActions,
    },
    /// Manage seeds
    Seeds {
        #[command(subcommand)]
        action: SeedActions,
    },
}

#[derive(Subcommand)]
enum AgentActions {
    /// Register an agent and fetch its capability snapshot
    Register {
        hostname: String,
        #[arg(short, long, default_value = "3002")]
        port: u16,
        #[arg(short, long)]
        token: String,
        #[arg(short, long, default_value = "3306")]
        mysql_port: u16,
    },
    /// List all known agents
    List,
    /// Show one agent with its capability snapshot
    Show { hostname: String },
    /// Unmount an agent's snapshot mount point
    Unmount { hostname: String },
    /// Delete agents unseen past the forget horizon
    ForgetUnseen,
}

#[derive(Subcommand)]
enum SeedActions {
    /// Create a new seed after a feasibility check
    Create {
        /// Seed method (Mydumper, Mysqldump, Xtrabackup)
        method: String,
        /// Host that will be overwritten
        target: String,
        /// Host the data comes from
        source: String,
    },
    /// List seeds
    List {
        /// Only non-terminal seeds
        #[arg(long)]
        active: bool,
    },
    /// Show one seed with its stage observations
    Show { seed_id: i64 },
    /// Abort a seed (terminal; best-effort agent aborts)
    Abort { seed_id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "seedr=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::load());
    let storage = SqliteStorage::open(&config.database_path())?;
    let http = Client::new();
    let registry = AgentRegistry::new(storage.clone(), config.clone(), http.clone());

    match cli.command {
        Commands::Serve => cmd_serve(storage, config, registry, http).await?,
        Commands::Agents { action } => match action {
            AgentActions::Register {
                hostname,
                port,
                token,
                mysql_port,
            } => {
                let info = AgentInfo {
                    hostname,
                    port,
                    token,
                    mysql_port,
                };
                let hostname = registry.register(info).await?;
                println!("✓ Agent '{}' registered", hostname);
            }
            AgentActions::List => {
                let agents = registry.read_agents_info().await?;
                if agents.is_empty() {
                    println!("No agents registered.");
                    return Ok(());
                }
                println!("{:<30} {:<10} {:<10} {:<20}", "HOSTNAME", "PORT", "STATUS", "LAST SEEN");
                println!("{}", "-".repeat(72));
                for agent in agents {
                    println!(
                        "{:<30} {:<10} {:<10} {:<20}",
                        agent.info.hostname,
                        agent.info.port,
                        agent.status.to_string(),
                        agent.last_seen.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            AgentActions::Show { hostname } => {
                let agent = registry.read_agent(&hostname).await?;
                println!("{}", serde_json::to_string_pretty(&agent)?);
            }
            AgentActions::Unmount { hostname } => {
                registry.unmount(&hostname).await?;
                println!("✓ Unmounted snapshot on '{}'", hostname);
            }
            AgentActions::ForgetUnseen => {
                let deleted = registry.forget_long_unseen_agents().await?;
                println!("✓ Forgot {} agent(s)", deleted);
            }
        },
        Commands::Seeds { action } => match action {
            SeedActions::Create {
                method,
                target,
                source,
            } => {
                let target = registry.read_agent(&target).await?;
                let source = registry.read_agent(&source).await?;
                let seed_id =
                    seedr::seeds::create_seed(&storage, &config, &method, &target, &source).await?;
                println!("✓ Seed {} created ({} -> {})", seed_id, source.info.hostname, target.info.hostname);
            }
            SeedActions::List { active } => {
                let seeds = if active {
                    storage.read_active_seeds().await?
                } else {
                    storage.read_recent_seeds(config.recent_seeds_limit).await?
                };
                if seeds.is_empty() {
                    println!("No seeds.");
                    return Ok(());
                }
                println!(
                    "{:<6} {:<20} {:<20} {:<12} {:<14} {:<10} {:<8}",
                    "ID", "TARGET", "SOURCE", "METHOD", "STAGE", "STATUS", "RETRIES"
                );
                println!("{}", "-".repeat(94));
                for seed in seeds {
                    println!(
                        "{:<6} {:<20} {:<20} {:<12} {:<14} {:<10} {:<8}",
                        seed.seed_id,
                        seed.target_hostname,
                        seed.source_hostname,
                        seed.method.to_string(),
                        seed.stage.to_string(),
                        seed.status.to_string(),
                        seed.retries
                    );
                }
            }
            SeedActions::Show { seed_id } => {
                let seed = storage.read_seed(seed_id).await?;
                println!("{}", serde_json::to_string_pretty(&seed)?);
                let states = storage.read_seed_stage_states(seed_id).await?;
                if !states.is_empty() {
                    println!();
                    println!(
                        "{:<22} {:<20} {:<14} {:<10} DETAILS",
                        "TIMESTAMP", "HOSTNAME", "STAGE", "STATUS"
                    );
                    println!("{}", "-".repeat(90));
                    for state in states {
                        println!(
                            "{:<22} {:<20} {:<14} {:<10} {}",
                            state.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            state.hostname,
                            state.stage.to_string(),
                            state.status.to_string(),
                            state.details
                        );
                    }
                }
            }
            SeedActions::Abort { seed_id } => {
                let topology = Arc::new(MySqlTopology::new(config.clone()));
                let machine =
                    SeedStateMachine::new(storage.clone(), config.clone(), http, topology);
                let mut seed = storage.read_seed(seed_id).await?;
                machine.abort(&mut seed).await?;
                println!("✓ Seed {} aborted", seed_id);
            }
        },
    }

    Ok(())
}

async fn cmd_serve(
    storage: SqliteStorage,
    config: Arc<Config>,
    registry: AgentRegistry,
    http: Client,
) -> anyhow::Result<()> {
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let topology = Arc::new(MySqlTopology::new(config.clone()));
    let machine = SeedStateMachine::new(storage.clone(), config.clone(), http, topology);
    let (scheduler, mut seeded_rx) =
        Scheduler::new(storage, config, registry, machine, shutdown.clone());

    // Observability stream of freshly seeded agents.
    tokio::spawn(async move {
        while let Some(agent) = seeded_rx.recv().await {
            tracing::info!(agent = %agent.hostname, mysql_port = agent.mysql_port, "agent seeded");
        }
    });

    scheduler.run().await;
    Ok(())
}
