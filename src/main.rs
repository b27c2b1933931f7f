//! Gatehouse - authorization service for an identity-aware access proxy

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gatehouse_authorize::{
    AuthorizeServer, AuthorizeService, CedarEvaluator, Options, SessionClaims, SharedSnapshot,
    Snapshot,
};

/// Gatehouse - decides whether proxied requests may proceed
#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the ext_authz and native authorization gRPC services
    ///
    /// Sending SIGHUP re-reads the config file and the policy file. A reload
    /// that fails validation leaves the running configuration untouched.
    Serve(ServeArgs),

    /// Mint a session token and print it with its Set-Cookie values
    Token(TokenArgs),
}

/// Serve mode arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "GATEHOUSE_LISTEN", default_value = "0.0.0.0:5443")]
    listen: SocketAddr,

    #[command(flatten)]
    options: OptionArgs,
}

/// Token mode arguments
#[derive(Args, Debug)]
struct TokenArgs {
    /// Subject (user ID)
    #[arg(long)]
    subject: String,

    /// Email claim
    #[arg(long)]
    email: Option<String>,

    /// Group claim; repeat for several groups
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Token lifetime in seconds
    #[arg(long, default_value = "3600")]
    lifetime_secs: u64,

    #[command(flatten)]
    options: OptionArgs,
}

/// Options file plus per-field overrides
#[derive(Args, Debug, Clone)]
struct OptionArgs {
    /// Path to the YAML options file
    #[arg(short = 'c', long = "config", env = "GATEHOUSE_CONFIG")]
    config_file: Option<PathBuf>,

    /// Secret shared with the authenticate service
    #[arg(long, env = "GATEHOUSE_SHARED_SECRET", hide_env_values = true)]
    shared_secret: Option<String>,

    /// URL of the authenticate service
    #[arg(long, env = "GATEHOUSE_AUTHENTICATE_URL")]
    authenticate_url: Option<String>,

    /// Session cookie name
    #[arg(long, env = "GATEHOUSE_COOKIE_NAME")]
    cookie_name: Option<String>,

    /// Session cookie domain
    #[arg(long, env = "GATEHOUSE_COOKIE_DOMAIN")]
    cookie_domain: Option<String>,

    /// Cedar policy file
    #[arg(long, env = "GATEHOUSE_POLICY_FILE")]
    policy_file: Option<PathBuf>,

    /// Policy evaluation deadline in milliseconds
    #[arg(long, env = "GATEHOUSE_EVALUATION_TIMEOUT_MS")]
    evaluation_timeout_ms: Option<u64>,
}

impl OptionArgs {
    /// Read the options file (if any), apply overrides and validate
    fn load(&self) -> anyhow::Result<Options> {
        let mut options = match &self.config_file {
            Some(path) => Options::from_file(path)?,
            None => Options::default(),
        };

        if let Some(v) = &self.shared_secret {
            options.shared_secret = v.clone();
        }
        if let Some(v) = &self.authenticate_url {
            options.authenticate_url = v.clone();
        }
        if let Some(v) = &self.cookie_name {
            options.cookie_name = v.clone();
        }
        if let Some(v) = &self.cookie_domain {
            options.cookie_domain = v.clone();
        }
        if let Some(v) = &self.policy_file {
            options.policy_file = Some(v.clone());
        }
        if let Some(v) = self.evaluation_timeout_ms {
            options.evaluation_timeout_ms = v;
        }

        options.validate()?;
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Token(args) => run_token(args),
    }
}

/// Run the authorization server until Ctrl-C
async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let options = args.options.load()?;
    info!(options = ?options, "Loaded options");

    let snapshot = SharedSnapshot::new(options.clone());
    let evaluator = Arc::new(CedarEvaluator::new(snapshot.clone()));
    load_policies(&evaluator, options.policy_file.as_deref())?;

    spawn_reload_on_hangup(args.options.clone(), snapshot.clone(), evaluator.clone());

    let service = AuthorizeService::new(snapshot, evaluator);
    AuthorizeServer::new(service, args.listen)
        .run(shutdown_signal())
        .await?;

    info!("Authorize server stopped");
    Ok(())
}

fn load_policies(evaluator: &CedarEvaluator, policy_file: Option<&Path>) -> anyhow::Result<()> {
    match policy_file {
        Some(path) => {
            evaluator.reload_file(path)?;
            Ok(())
        }
        None => {
            warn!("No policy file configured; every request will be denied");
            Ok(())
        }
    }
}

/// Reload options and policies on SIGHUP
#[cfg(unix)]
fn spawn_reload_on_hangup(
    args: OptionArgs,
    snapshot: SharedSnapshot,
    evaluator: Arc<CedarEvaluator>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler; reload disabled");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading configuration");
            let options = match args.load() {
                Ok(options) => options,
                Err(e) => {
                    warn!(error = %e, "Reload failed; keeping current configuration");
                    continue;
                }
            };
            if let Err(e) = load_policies(&evaluator, options.policy_file.as_deref()) {
                warn!(error = %e, "Policy reload failed; keeping current policies");
            }
            snapshot.publish(options);
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _args: OptionArgs,
    _snapshot: SharedSnapshot,
    _evaluator: Arc<CedarEvaluator>,
) {
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Mint a session token for operators and tests
fn run_token(args: TokenArgs) -> anyhow::Result<()> {
    let options = args.options.load()?;
    let snapshot = Snapshot::new(options);
    let store = snapshot.session_store()?;

    let mut claims = SessionClaims::new(&args.subject, Duration::from_secs(args.lifetime_secs))
        .with_groups(args.groups);
    if let Some(email) = args.email {
        claims = claims.with_email(email);
    }

    let token = store.signer().sign(&claims)?;
    println!("{}", token);
    for cookie in store.session_cookies(&token)? {
        println!("Set-Cookie: {}", cookie);
    }
    Ok(())
}
