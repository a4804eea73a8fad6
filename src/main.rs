use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, Subcommand};
use pia_wg::config::{Config, ConfigError, DEFAULT_CONFIG_FILE};
use pia_wg::connection::{ConnectError, ConnectOptions, ConnectionManager, Outcome};
use pia_wg::hooks::ShellHook;
use pia_wg::pia::{ApiError, Credentials, HttpTransport, PiaClient, TransportError};
use pia_wg::platform::{self, PlatformError};
use pia_wg::state::{DataStore, StoreError};
use pia_wg::wireguard::{format_bytes, TunnelError, TunnelSupervisor, WgQuickSupervisor};
use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const EXIT_CONNECT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_IO: u8 = 3;
const EXIT_REQUIREMENTS: u8 = 4;

#[derive(Parser)]
#[command(name = "pia-wg")]
#[command(about = "Establish and maintain a Private Internet Access WireGuard connection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ./pia-wg.toml, then the user config directory)
    #[arg(short, long, global = true, env = "PIA_WG_CONFIG")]
    config: Option<PathBuf>,

    /// PIA username
    #[arg(short, long, global = true, env = "PIA_WG_USERNAME")]
    username: Option<String>,

    /// PIA password (prompted for when missing)
    #[arg(short, long, global = true, env = "PIA_WG_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Region ID to connect to (see `pia-wg regions`)
    #[arg(short, long, global = true, env = "PIA_WG_REGION")]
    region: Option<String>,

    /// Request a forwarded port after connecting
    #[arg(
        short = 'P',
        long,
        global = true,
        env = "PIA_WG_PORT_FORWARD",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    port_forward: bool,

    /// Command run when a new port is forwarded; {port} is replaced by the port
    #[arg(long, global = true, env = "PIA_WG_PORT_FORWARD_COMMAND")]
    port_forward_command: Option<String>,

    /// Persistent data file
    #[arg(long, global = true, env = "PIA_WG_DATA_FILE")]
    data_file: Option<PathBuf>,

    /// WireGuard interface name
    #[arg(long, global = true, env = "PIA_WG_INTERFACE")]
    interface: Option<String>,

    /// Directory holding WireGuard configs
    #[arg(long, global = true, env = "PIA_WG_WIREGUARD_DIR")]
    wireguard_dir: Option<PathBuf>,

    /// Skip the root and wg/wg-quick checks
    #[arg(long, global = true)]
    skip_checks: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(short = 'L', long, global = true, env = "PIA_WG_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, or verify and refresh an existing connection (default)
    Connect,
    /// Show connection status
    Status,
    /// List available regions (* = port forwarding)
    Regions,
    /// Bring the interface down and remove its config
    Disconnect,
    /// Generate default config file
    Init {
        /// Where to write it
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// A failed command: what to log and which exit code to leave with
struct Exit {
    code: u8,
    message: String,
}

impl Exit {
    fn new(code: u8, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

impl From<ConfigError> for Exit {
    fn from(e: ConfigError) -> Self {
        Exit::new(EXIT_CONFIG, e)
    }
}

impl From<PlatformError> for Exit {
    fn from(e: PlatformError) -> Self {
        Exit::new(EXIT_REQUIREMENTS, e)
    }
}

impl From<StoreError> for Exit {
    fn from(e: StoreError) -> Self {
        Exit::new(EXIT_IO, e)
    }
}

impl From<TunnelError> for Exit {
    fn from(e: TunnelError) -> Self {
        Exit::new(EXIT_IO, e)
    }
}

impl From<TransportError> for Exit {
    fn from(e: TransportError) -> Self {
        let code = if e.is_local() { EXIT_IO } else { EXIT_CONNECT_FAILED };
        Exit::new(code, e)
    }
}

impl From<ApiError> for Exit {
    fn from(e: ApiError) -> Self {
        let code = match &e {
            ApiError::UnknownRegion(_) => EXIT_CONFIG,
            ApiError::Store(_) => EXIT_IO,
            ApiError::Transport { source, .. } if source.is_local() => EXIT_IO,
            _ => EXIT_CONNECT_FAILED,
        };
        Exit::new(code, e)
    }
}

impl From<ConnectError> for Exit {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Api(e) => e.into(),
            ConnectError::Store(e) => e.into(),
            ConnectError::Tunnel(e) => e.into(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(&cli);

    // Set up logging
    // Everything goes to stderr so command output stays clean
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().and_then(|c| c.log_level.clone()))
        .unwrap_or_else(|| if cli.verbose { "debug" } else { "info" }.to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let result = match config {
        Ok(config) => run(cli.command.unwrap_or(Commands::Connect), &config, cli.skip_checks).await,
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => {
            error!("{}", exit.message);
            ExitCode::from(exit.code)
        }
    }
}

/// Config file, then environment and flags on top
fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(username) = &cli.username {
        config.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    if let Some(region) = &cli.region {
        config.region = Some(region.clone());
    }
    if cli.port_forward {
        config.port_forward = true;
    }
    if let Some(command) = &cli.port_forward_command {
        config.port_forward_command = Some(command.clone());
    }
    if let Some(data_file) = &cli.data_file {
        config.data_file = Some(data_file.clone());
    }
    if let Some(interface) = &cli.interface {
        config.interface = interface.clone();
    }
    if let Some(dir) = &cli.wireguard_dir {
        config.wireguard_dir = dir.clone();
    }
    Ok(config)
}

async fn run(command: Commands, config: &Config, skip_checks: bool) -> Result<(), Exit> {
    match command {
        Commands::Connect => {
            if !skip_checks {
                platform::check_requirements()?;
            }
            connect(config).await
        }
        Commands::Status => status(config).await,
        Commands::Regions => regions(config).await,
        Commands::Disconnect => {
            if !skip_checks {
                platform::check_requirements()?;
            }
            disconnect(config).await
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                return Err(Exit::new(
                    EXIT_CONFIG,
                    format!("{} already exists (use --force to overwrite)", path.display()),
                ));
            }
            info!("Generating default config...");
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> Result<(), Exit> {
    let username = config.username()?.to_string();
    let region = config.region()?.to_string();
    let password = password(config)?;

    let store = DataStore::open_for_account(config.data_file(), &username)?;
    let transport = HttpTransport::new(config.ca_cert_path())?;
    let client = PiaClient::new(transport, Credentials::new(username, password), store);
    let supervisor = WgQuickSupervisor::new(&config.wireguard_dir, &config.interface);

    let mut options = ConnectOptions::new(region);
    options.port_forward = config.port_forward;
    options.port_forward_command = config.port_forward_command.clone();

    let mut manager = ConnectionManager::new(client, supervisor, ShellHook, options);
    match manager.update().await? {
        Outcome::Connected { port_forward, .. } => {
            if let Some(forward) = port_forward {
                info!("Forwarded port: {}", forward.port);
            }
            Ok(())
        }
        Outcome::Failed { reason, .. } => Err(Exit::new(
            EXIT_CONNECT_FAILED,
            format!("Connection failed: {}", reason),
        )),
    }
}

fn password(config: &Config) -> Result<String, Exit> {
    if let Some(password) = &config.password {
        return Ok(password.clone());
    }
    if !std::io::stdin().is_terminal() {
        return Err(ConfigError::Missing("password").into());
    }
    rpassword::prompt_password("PIA password: ")
        .map_err(|e| Exit::new(EXIT_CONFIG, format!("Failed to read password: {}", e)))
}

async fn status(config: &Config) -> Result<(), Exit> {
    let store = DataStore::open(config.data_file())?;
    let data = store.data();
    let supervisor = WgQuickSupervisor::new(&config.wireguard_dir, &config.interface);

    println!(
        "Config: {}",
        if supervisor.config_exists() {
            supervisor.config_path().display().to_string()
        } else {
            "not present".to_string()
        }
    );
    let active = supervisor.interface_active().await;
    println!(
        "Interface {}: {}",
        supervisor.interface(),
        if active { "up" } else { "down" }
    );
    match data.last_success {
        Some(at) => println!("Last successful refresh: {}", at.to_rfc3339()),
        None => println!("Last successful refresh: never"),
    }
    if let Some(connection) = &data.connection {
        println!(
            "  Server: {} ({})",
            connection.endpoint.hostname,
            connection.endpoint_addr()
        );
    }
    if let Some(stats) = supervisor.traffic_stats().await {
        match stats.latest_handshake {
            Some(at) => println!("  Last handshake: {}", at.to_rfc3339()),
            None => println!("  Last handshake: none"),
        }
        if let Some(endpoint) = stats.endpoint {
            println!("  Endpoint: {}", endpoint);
        }
        println!(
            "  Transfer: {} received, {} sent",
            format_bytes(stats.rx_bytes.into()),
            format_bytes(stats.tx_bytes.into())
        );
    }
    if let Some(lease) = &data.lease {
        match lease.claims() {
            Ok(claims) => println!(
                "  Forwarded port: {} (lease expires {})",
                claims.port,
                claims.expires_at.to_rfc3339()
            ),
            Err(e) => println!("  Forwarded port: unreadable lease ({})", e),
        }
    }
    Ok(())
}

async fn regions(config: &Config) -> Result<(), Exit> {
    let store = DataStore::open(config.data_file())?;
    let username = store.data().username.clone();
    let transport = HttpTransport::new(config.ca_cert_path())?;
    // The region list needs no credentials
    let mut client = PiaClient::new(transport, Credentials::new(username, String::new()), store);

    for region in client.regions().await? {
        let marker = if region.port_forward { "*" } else { " " };
        println!("{} {:<24} {}", marker, region.id, region.name);
    }
    Ok(())
}

async fn disconnect(config: &Config) -> Result<(), Exit> {
    let supervisor = WgQuickSupervisor::new(&config.wireguard_dir, &config.interface);
    info!("Disconnecting {}...", supervisor.interface());
    supervisor.remove_config().await?;

    let mut store = DataStore::open(config.data_file())?;
    if store.data().connection.is_some() || store.data().lease.is_some() {
        store.update(|data| {
            data.connection = None;
            data.lease = None;
        })?;
    }
    println!("Disconnected");
    Ok(())
}
