use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use whatsmux::connection::LoopbackConnector;
use whatsmux::gateway::{self, AdminCredentials, AppState};
use whatsmux::storage::SqliteStorageFactory;
use whatsmux::supervisor;
use whatsmux::users::{SqliteUserStore, UserRepository, UserUpdate};
use whatsmux::{Config, SessionManager, SessionRegistry};

const DEFAULT_LOG_FILTER: &str = "whatsmux=info";

#[derive(Parser, Debug)]
#[command(name = "whatsmux")]
#[command(about = "One self-healing messaging session per registered user")]
#[command(version)]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway and the reconnection supervisors
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage registered users
    Users {
        #[command(subcommand)]
        action: UsersCommand,
    },
}

#[derive(Subcommand, Debug)]
enum UsersCommand {
    /// Register a user
    Add {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// List registered users
    List,
    /// Delete a user and their stored device credentials
    Remove { id: i64 },
    /// Enable or disable a user
    SetActive {
        id: i64,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;
            serve(config).await
        }
        Command::Users { action } => manage_users(&config, action),
    }
}

async fn serve(config: Config) -> Result<()> {
    let users: Arc<dyn UserRepository> = Arc::new(
        SqliteUserStore::open(&config.storage.users_db).with_context(|| {
            format!("Failed to open user database {}", config.storage.users_db.display())
        })?,
    );
    let registry = SessionRegistry::new(
        Arc::new(SqliteStorageFactory::new(
            &config.storage.data_dir,
            config.storage.separate_key_store,
        )),
        Arc::new(LoopbackConnector),
    );
    let manager = Arc::new(SessionManager::new(
        registry,
        Duration::from_secs(config.gateway.pairing_timeout_secs),
    ));

    let cancel = CancellationToken::new();
    let (boot, health) = if config.supervisor.enabled {
        let boot = supervisor::spawn_boot_sweep(
            Arc::clone(&manager),
            Arc::clone(&users),
            config.supervisor.boot_policy,
            Duration::from_secs(config.supervisor.boot_grace_secs),
            cancel.clone(),
        );
        let health = supervisor::spawn_health_supervisor(
            Arc::clone(&manager),
            config.supervisor.periodic_policy,
            Duration::from_secs(config.supervisor.interval_secs),
            cancel.clone(),
        );
        (Some(boot), Some(health))
    } else {
        tracing::info!("Reconnection supervisors disabled");
        (None, None)
    };

    let admin = config
        .admin_credentials()
        .map(|(user, pass)| Arc::new(AdminCredentials::new(&user, &pass)));
    if admin.is_none() {
        tracing::warn!("gateway.admin_username/admin_password not set; admin routes disabled");
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    let state = AppState {
        manager: Arc::clone(&manager),
        users,
        admin,
    };
    let result = gateway::run_gateway(&config, state, cancel.clone()).await;

    cancel.cancel();
    if let Some(boot) = boot {
        let _ = boot.await;
    }
    if let Some(health) = health {
        let _ = health.await;
    }
    manager.shutdown().await;
    result
}

fn manage_users(config: &Config, action: UsersCommand) -> Result<()> {
    let store = SqliteUserStore::open(&config.storage.users_db)?;
    match action {
        UsersCommand::Add { username, password } => {
            let user = store.create(&username, &password)?;
            println!("Created user {} (id {})", user.username, user.id);
        }
        UsersCommand::List => {
            for user in store.get_all()? {
                println!(
                    "{:>6}  {:<50}  {}",
                    user.id,
                    user.username,
                    if user.is_active { "active" } else { "inactive" }
                );
            }
        }
        UsersCommand::Remove { id } => {
            if !store.delete(id)? {
                bail!("User {id} not found");
            }
            let locator = SqliteStorageFactory::new(
                &config.storage.data_dir,
                config.storage.separate_key_store,
            )
            .locator(id);
            for path in std::iter::once(locator.identity_path).chain(locator.keys_path) {
                match std::fs::remove_file(&path) {
                    Ok(()) => println!("Removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                    }
                }
            }
            println!("Deleted user {id}");
        }
        UsersCommand::SetActive { id, active } => {
            let user = store.update(
                id,
                &UserUpdate {
                    is_active: Some(active),
                    ..Default::default()
                },
            )?;
            println!(
                "User {} is now {}",
                user.username,
                if user.is_active { "active" } else { "inactive" }
            );
        }
    }
    Ok(())
}
