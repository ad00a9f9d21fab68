//! `loopauth` - sign in to an OAuth 2.0 / OpenID Connect provider from the terminal

mod redirect;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use la_auth::{
    AuthConfig, AuthorizationOrchestrator, EnvSecretProvider, FileTokenStore, IpcBackend, KdfParams,
    KeySource, PrintUrl, Transport,
};
use la_config::{ConfigFile, GrantKind, Profile};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::redirect::StdinRedirect;

/// OAuth 2.0 sign-in for command-line tools
#[derive(Parser)]
#[command(name = "loopauth")]
#[command(about = "Sign in with OAuth 2.0 / OpenID Connect and hand out access tokens")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Profile in loopauth.toml
    #[arg(short, long, env = "LOOPAUTH_PROFILE", global = true)]
    profile: Option<String>,

    /// Path to the config file. Defaults to the platform config directory
    #[arg(long, env = "LOOPAUTH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override the profile's client id
    #[arg(long, env = "LOOPAUTH_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// Override the profile's issuer URL
    #[arg(long, env = "LOOPAUTH_ISSUER", global = true)]
    issuer: Option<Url>,

    /// Override the profile's scopes
    #[arg(long, env = "LOOPAUTH_SCOPES", global = true)]
    scopes: Option<String>,

    /// Paste the redirect URL instead of running a loopback listener
    #[arg(long, global = true)]
    manual: bool,

    /// Print the sign-in URL instead of opening a browser
    #[arg(long, global = true)]
    no_browser: bool,

    /// Derive the storage key from LOOPAUTH_PASSPHRASE instead of the OS keyring
    #[arg(long, global = true)]
    no_keyring: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in, silently when a stored refresh token still works
    SignIn,
    /// Print a valid access token as "<type> <token>"
    Token {
        /// Refresh even if the cached token is still valid
        #[arg(short, long)]
        force: bool,
    },
    /// Revoke and forget stored tokens
    SignOut,
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Serve the selected profile over newline-delimited JSON on stdin/stdout
    Serve,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the selected profile
    Show,
    /// Write a starter profile
    Init {
        /// Replace an existing profile of the same name
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => ConfigFile::default_path()?,
    };

    match &cli.command {
        Commands::Config { action } => run_config(&cli, action, &config_path).await,
        Commands::SignIn => {
            let auth = orchestrator(&cli, &config_path).await?;
            auth.sign_in().await.context("Sign-in failed")?;
            match auth.expires_at() {
                Some(expiry) => eprintln!("Signed in, access token valid until {expiry}"),
                None => eprintln!("Signed in"),
            }
            Ok(())
        }
        Commands::Token { force } => {
            let auth = orchestrator(&cli, &config_path).await?;
            if !auth.sign_in_silent().await {
                bail!("Not signed in - run `loopauth sign-in` first");
            }
            let bearer = if *force {
                auth.refresh_access_token().await?
            } else {
                auth.get_access_token().await?
            };
            println!("{bearer}");
            Ok(())
        }
        Commands::SignOut => {
            let auth = orchestrator(&cli, &config_path).await?;
            auth.sign_out().await;
            eprintln!("Signed out");
            Ok(())
        }
        Commands::Serve => {
            let auth = Arc::new(orchestrator(&cli, &config_path).await?);
            let backend = IpcBackend::new(auth);
            info!(namespace = backend.names().namespace(), "Serving on stdin/stdout");
            backend
                .serve(tokio::io::stdin(), tokio::io::stdout())
                .await
                .context("IPC session failed")
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LOOPAUTH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_config(cli: &Cli, action: &ConfigAction, path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let file = ConfigFile::load(path).await?;
            let (name, profile) = file.profile(cli.profile.as_deref())?;
            let rendered =
                toml::to_string_pretty(profile).context("Failed to render profile")?;
            println!("# {}\n[profile.{name}]\n{rendered}", path.display());
            Ok(())
        }
        ConfigAction::Init { force } => {
            let name = cli
                .profile
                .clone()
                .unwrap_or_else(|| la_config::DEFAULT_PROFILE.to_string());
            let mut file = ConfigFile::load_or_default(path).await?;
            if file.profile(Some(&name)).is_ok() && !*force {
                bail!("Profile '{name}' already exists in {}, pass --force to replace it", path.display());
            }
            file.insert_profile(name.clone(), Profile::example()?);
            file.save(path).await?;
            eprintln!("Wrote profile '{name}' to {}", path.display());
            Ok(())
        }
    }
}

/// Profile from the config file with command-line overrides applied
async fn resolve_config(cli: &Cli, path: &Path) -> anyhow::Result<(Profile, AuthConfig)> {
    let file = ConfigFile::load_or_default(path).await?;

    let (name, mut profile) = match file.profile(cli.profile.as_deref()) {
        Ok((name, profile)) => (name.to_string(), profile.clone()),
        Err(e) => {
            let (Some(client_id), Some(issuer)) = (&cli.client_id, &cli.issuer) else {
                return Err(e).context("Pass --client-id and --issuer, or run `loopauth config init`");
            };
            debug!("No profile found, using command-line settings only");
            let mut profile = Profile::example()?;
            profile.client_id = client_id.clone();
            profile.issuer = issuer.clone();
            ("command-line".to_string(), profile)
        }
    };

    if let Some(client_id) = &cli.client_id {
        profile.client_id = client_id.clone();
    }
    if let Some(issuer) = &cli.issuer {
        profile.issuer = issuer.clone();
    }
    if let Some(scopes) = &cli.scopes {
        profile.scopes = scopes.clone();
    }

    let config = profile.to_auth_config(&name)?;
    Ok((profile, config))
}

async fn orchestrator(cli: &Cli, path: &Path) -> anyhow::Result<AuthorizationOrchestrator> {
    let (profile, config) = resolve_config(cli, path).await?;

    let mut builder = AuthorizationOrchestrator::builder(config);
    builder = match profile.grant {
        GrantKind::ClientCredentials => builder.transport(Transport::ClientCredentials),
        GrantKind::AuthorizationCode => {
            let source = if cli.no_keyring {
                KeySource::Passphrase
            } else {
                KeySource::default()
            };
            let store = FileTokenStore::open_with(
                FileTokenStore::default_storage_dir()?,
                source,
                Arc::new(EnvSecretProvider::default()),
                KdfParams::default(),
            )
            .await
            .context("Failed to open token store")?;

            let builder = builder.store(Arc::new(store));
            if cli.manual {
                builder.transport(Transport::ManualRedirect(Arc::new(StdinRedirect)))
            } else {
                builder
            }
        }
    };

    if cli.no_browser || cli.manual {
        builder = builder.browser(Arc::new(PrintUrl));
    }

    Ok(builder.build()?)
}
