use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};
use tokio::net::TcpListener;

use dzstream::{
    config::Config,
    decrypt::BlowfishStripe,
    error::{Error, ErrorKind, Result},
    fallback::{HttpProbe, Resolver},
    gateway::Gateway,
    secrets::Secrets,
    server::{self, AppState},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Holds the `arl`, the `bf_secret` and optionally an `access_token`.
    /// Keep this file private: it grants access to your account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"), env = "DZSTREAM_SECRETS_FILE")]
    secrets_file: String,

    /// Address to listen on
    #[arg(short, long, value_name = "ADDR", default_value_t = SocketAddr::from(([127, 0, 0, 1], Config::DEFAULT_LISTEN_PORT)), env = "DZSTREAM_LISTEN")]
    listen: SocketAddr,

    /// Seconds to wait for each quality probe
    #[arg(long, value_name = "SECONDS", default_value_t = Config::DEFAULT_PROBE_TIMEOUT.as_secs(), value_parser = clap::value_parser!(u64).range(1..))]
    probe_timeout: u64,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive, and `verbose` is 0
            // by default. So this arm means: quiet mode.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("dzstream", level);
    }

    logger.init();
}

/// Loads the secrets, pointing to the documentation when the file is
/// missing.
fn load_secrets(secrets_file: &str) -> Result<Secrets> {
    let secrets = Secrets::from_file(secrets_file);

    if let Err(ref e) = secrets {
        if e.kind == ErrorKind::NotFound {
            info!("read the documentation on how to set your secrets in {secrets_file}");
        }
    }

    secrets
}

/// Resolves when the process receives Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down gracefully"),
        Err(e) => error!("failed to listen for shutdown signal: {e}"),
    }
}

/// Wires up the catalog, resolver and key provider and serves until
/// interrupted.
///
/// # Errors
///
/// Returns an error if the secrets cannot be loaded, the HTTP client cannot
/// be built or the listen address cannot be bound.
async fn run(args: Args) -> Result<()> {
    let secrets = load_secrets(&args.secrets_file)?;

    let mut config = Config::new();
    config.listen = args.listen;
    config.probe_timeout = Duration::from_secs(args.probe_timeout);
    config.arl = Some(secrets.arl);
    config.access_token = secrets.access_token;
    debug!("{config:#?}");

    let gateway = Arc::new(Gateway::new(&config)?);
    let cdn = gateway.cdn_client();

    let probe = Arc::new(HttpProbe::new(cdn.clone(), config.probe_timeout));
    let resolver = Resolver::new(probe, gateway);
    let keys = Arc::new(BlowfishStripe::new(secrets.bf_secret));

    let listener = TcpListener::bind(config.listen).await.map_err(|e| {
        Error::unavailable(format!("cannot listen on {}: {e}", config.listen))
    })?;
    info!("listening on http://{}", listener.local_addr()?);

    let state = AppState::new(resolver, keys, cdn);
    server::serve(listener, state, shutdown_signal()).await
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the server.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
