//! Whisper session - command line tool for the session store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whisper_session::{
    config::Config,
    db::{self, repositories::SqlxSessionRepository},
    services::{spawn_expired_session_sweeper, SessionService, SessionServiceError},
};

#[derive(Parser)]
#[command(name = "whisper-session")]
#[command(about = "Issue, check and revoke server-side session tokens")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Create a session for a user and print its token
    Issue {
        #[arg(long)]
        user_id: i64,
    },
    /// Validate a token, renewing it if it is close to expiry
    Check { token: String },
    /// Revoke the session behind a token
    Revoke { token: String },
    /// Revoke every session of a user
    RevokeUser {
        #[arg(long)]
        user_id: i64,
    },
    /// Delete all expired sessions once
    Purge,
    /// Purge expired sessions periodically until interrupted
    Sweep,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_session=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config::load_with_env(&cli.config)?;
    tracing::debug!("Configuration loaded from {}", cli.config.display());

    let pool = db::create_pool(&config.database).await?;
    pool.ping().await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    let applied = db::migrations::run_migrations(&pool).await?;
    if let Commands::Migrate = cli.command {
        println!("{} migration(s) applied", applied);
        pool.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    let service = Arc::new(SessionService::new(SqlxSessionRepository::boxed(
        pool.clone(),
    )));

    let outcome = run(&cli.command, service, &config).await;
    pool.close().await;

    Ok(match outcome? {
        Outcome::Done => ExitCode::SUCCESS,
        Outcome::Rejected => ExitCode::FAILURE,
    })
}

/// How a subcommand ended, short of an error
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Done,
    /// `check` was handed a token with no live session
    Rejected,
}

async fn run(command: &Commands, service: Arc<SessionService>, config: &Config) -> Result<Outcome> {
    match command {
        Commands::Migrate => {}
        Commands::Issue { user_id } => {
            let issued = service
                .create_session(*user_id)
                .await
                .context("Failed to issue session")?;
            println!("{}", issued.token.as_str());
            eprintln!("expires_at: {}", issued.session.expires_at.to_rfc3339());
        }
        Commands::Check { token } => match service.validate_session_token(token).await {
            Ok(session) => println!(
                "{}",
                serde_json::to_string_pretty(&session).context("Failed to render session")?
            ),
            Err(e) if e.requires_reauthentication() => {
                println!("{}", reauth_reason(&e));
                return Ok(Outcome::Rejected);
            }
            Err(e) => return Err(e).context("Failed to validate session"),
        },
        Commands::Revoke { token } => {
            service
                .invalidate_token(token)
                .await
                .context("Failed to revoke session")?;
            println!("revoked");
        }
        Commands::RevokeUser { user_id } => {
            let removed = service
                .invalidate_user_sessions(*user_id)
                .await
                .context("Failed to revoke user sessions")?;
            println!("{} session(s) revoked", removed);
        }
        Commands::Purge => {
            let removed = service
                .purge_expired()
                .await
                .context("Failed to purge expired sessions")?;
            println!("{} expired session(s) purged", removed);
        }
        Commands::Sweep => {
            let every = Duration::from_secs(config.session.sweep_interval_seconds);
            let Some(handle) = spawn_expired_session_sweeper(service, every) else {
                anyhow::bail!("Sweeping is disabled (session.sweep_interval_seconds is 0)");
            };
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutting down sweeper");
            handle.abort();
        }
    }
    Ok(Outcome::Done)
}

fn reauth_reason(err: &SessionServiceError) -> &'static str {
    match err {
        SessionServiceError::SessionExpired => "expired",
        _ => "not found",
    }
}
