use anyhow::Context;
use clap::{Parser, Subcommand};
use hub::authn::{Authenticator, ClientType, PasswordStore, SessionAuthenticator};
use hub::authz::{AuthzService, Role, ALL_GROUP_ID};
use hub::clients::HttpClient;
use hub::config;
use hub::router::HubRouter;
use hub::servers::TransportManager;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the discovery record says the directory TD can be read.
const DIRECTORY_PATH: &str = "/things/directory";

#[derive(Parser)]
#[command(name = "hubd")]
#[command(about = "IoT hub daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the config file, the data directory and the authorization store with the `all` group.
    Init {
        /// Config file path (default: HIVEOT_CONFIG_PATH or ~/.hiveot/hub.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the hub (HTTP, SSE and websocket transports) until Ctrl+C or SIGTERM.
    Serve {
        /// Config file path (default: HIVEOT_CONFIG_PATH or ~/.hiveot/hub.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Listening port (default from config or 8444)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Add a user account and give it a role in a group.
    AddUser {
        /// Client ID of the new user
        id: String,

        password: String,

        /// viewer, operator or manager
        #[arg(long, default_value = "viewer")]
        role: String,

        /// Group to add the user to
        #[arg(long, default_value = ALL_GROUP_ID)]
        group: String,

        /// Config file path (default: HIVEOT_CONFIG_PATH or ~/.hiveot/hub.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Check that a hub is answering.
    Ping {
        /// Hub base URL (default: http://{bind}:{port} from config)
        #[arg(long)]
        url: Option<String>,

        /// Config file path (default: HIVEOT_CONFIG_PATH or ~/.hiveot/hub.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("hubd {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("hub failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::AddUser {
            id,
            password,
            role,
            group,
            config,
        }) => {
            if let Err(e) = run_add_user(config, &id, &password, &role, &group) {
                log::error!("add-user failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ping { url, config }) => {
            if let Err(e) = run_ping(config, url).await {
                log::error!("ping failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let res = hub::init::init_hub(&path)?;
    println!(
        "initialized hub: config {}, data {}",
        res.config_path.display(),
        res.data_dir.display()
    );
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    hub::init::require_initialized(&path, &config)?;
    let data_dir = config::resolve_data_dir(&config);

    let password_file = config::resolve_password_file(&config, &data_dir);
    let passwords = PasswordStore::open(&password_file)
        .with_context(|| format!("opening password store {}", password_file.display()))?;
    let authn: Arc<dyn Authenticator> = Arc::new(SessionAuthenticator::new(
        Arc::new(passwords),
        config.authn.token_validity(),
    ));
    let acl_file = config::resolve_acl_file(&config, &data_dir);
    let authz = Arc::new(
        AuthzService::start(&acl_file)
            .with_context(|| format!("opening authorization store {}", acl_file.display()))?,
    );

    let transport = Arc::new(TransportManager::new(&config.server, authn));
    let router = HubRouter::with_wait_timeout(
        authz.clone(),
        transport.clone(),
        config.client.rpc_timeout(),
    );
    router.install();
    transport.start().await?;
    transport.start_discovery(DIRECTORY_PATH);
    log::info!(
        "hub running at {}, preferred protocol {}",
        transport.connect_url(),
        transport.preferred_protocol()
    );

    shutdown_signal().await;
    log::info!("shutdown signal received, closing connections");
    transport.stop_discovery();
    transport.stop().await;
    authz.stop();
    Ok(())
}

fn run_add_user(
    config_path: Option<PathBuf>,
    client_id: &str,
    password: &str,
    role: &str,
    group: &str,
) -> anyhow::Result<()> {
    let role: Role = role.parse()?;
    if !role.is_user_role() {
        anyhow::bail!("'{}' is not a user role (viewer, operator or manager)", role);
    }
    let (config, path) = config::load_config(config_path)?;
    hub::init::require_initialized(&path, &config)?;
    let data_dir = config::resolve_data_dir(&config);

    let password_file = config::resolve_password_file(&config, &data_dir);
    let passwords = PasswordStore::open(&password_file)
        .with_context(|| format!("opening password store {}", password_file.display()))?;
    passwords.add(client_id, client_id, ClientType::User, password)?;

    let acl_file = config::resolve_acl_file(&config, &data_dir);
    let authz = AuthzService::start(&acl_file)
        .with_context(|| format!("opening authorization store {}", acl_file.display()))?;
    authz.add_user(client_id, role, group)?;
    println!("added user '{}' as {} in group '{}'", client_id, role, group);
    Ok(())
}

async fn run_ping(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<()> {
    let url = match url {
        Some(u) => u,
        None => {
            let (config, _) = config::load_config(config_path)?;
            format!("http://{}:{}", config.server.bind, config.server.port)
        }
    };
    let client = HttpClient::new(&url)?;
    let reply = client
        .ping()
        .await
        .with_context(|| format!("pinging {}", url))?;
    println!("{}", reply);
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
