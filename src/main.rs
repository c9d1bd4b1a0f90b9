//! # Postlater: Scheduled Message Delivery
//!
//! Usage:
//!   postlater serve                                   # Run the scheduler until Ctrl-C
//!   postlater connect --workspace T1 --user U1 --token xoxp-...
//!   postlater schedule --workspace T1 --user U1 --channel C1 --text "hi" \
//!       --at 2026-03-01T12:00:00Z --tz Europe/Berlin
//!   postlater send-now <ID> | cancel <ID> | list --workspace T1 --user U1
//!   postlater tick                                    # One delivery pass, then exit

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use postlater_core::types::expiry_after;
use postlater_core::{CredentialKey, CredentialRecord, NewMessage, PostlaterConfig};
use postlater_scheduler::{CancelOutcome, MessageService};
use postlater_slack::SlackConnector;
use postlater_store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "postlater",
    version,
    about = "⏰ Postlater: schedule workspace messages for later"
)]
struct Cli {
    /// Config file (default: ~/.postlater/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the background scheduler until Ctrl-C
    Serve,
    /// Store credentials for a (workspace, user) pair
    Connect {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        user: String,
        /// Access token
        #[arg(long)]
        token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Seconds until the access token expires
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Forget the credentials for a (workspace, user) pair
    Disconnect {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        user: String,
    },
    /// Schedule a message
    Schedule {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        user: String,
        /// Channel id
        #[arg(long)]
        channel: String,
        /// Channel display name
        #[arg(long)]
        channel_name: Option<String>,
        #[arg(long)]
        text: String,
        /// RFC 3339 instant, e.g. 2026-03-01T12:00:00Z
        #[arg(long)]
        at: String,
        /// IANA timezone the user scheduled in
        #[arg(long, default_value = "UTC")]
        tz: String,
    },
    /// Deliver a pending message immediately
    SendNow { id: String },
    /// Cancel a pending message
    Cancel { id: String },
    /// List messages for a (workspace, user) pair
    List {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        user: String,
    },
    /// Run one scheduler pass and exit
    Tick,
}

fn config_path(path: Option<&str>) -> PathBuf {
    match path {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => PostlaterConfig::default_path(),
    }
}

fn load_config(path: Option<&str>) -> Result<PostlaterConfig> {
    if path.is_none() {
        return Ok(PostlaterConfig::load()?);
    }
    let path = config_path(path);
    let mut config = PostlaterConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("'{s}' is not an RFC 3339 timestamp"))?;
    Ok(at.with_timezone(&Utc))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "postlater=debug" } else { "postlater=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::Init { force } = cli.command {
        let path = config_path(cli.config.as_deref());
        if path.exists() && !force {
            anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
        }
        PostlaterConfig::default().save_to(&path)?;
        println!("✅ Wrote {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;

    let db_path = config.database.resolved_path();
    let store = Arc::new(
        SqliteStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );
    let connector = Arc::new(SlackConnector::new(config.slack.clone()));
    let service = MessageService::new(store.clone(), store, connector, &config.scheduler);

    match cli.command {
        // Handled before the database is opened.
        Command::Init { .. } => {}
        Command::Serve => {
            println!("⏰ Postlater v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database:   {}", db_path.display());
            println!("   🔁 Tick:       every {}s", config.scheduler.tick_secs);
            println!();

            if config.scheduler.start_on_boot {
                service.start_scheduler();
            } else {
                tracing::warn!("scheduler.start_on_boot is off, nothing will be delivered");
            }

            tokio::signal::ctrl_c().await?;
            println!("\n🛑 Shutting down...");
            service.shutdown().await;
        }
        Command::Connect {
            workspace,
            user,
            token,
            refresh_token,
            expires_in,
        } => {
            let key = CredentialKey::new(workspace, user);
            let mut record = CredentialRecord::new(&key, token);
            record.refresh_token = refresh_token;
            record.expires_at = expires_in
                .map(|secs| {
                    expiry_after(Utc::now(), secs)
                        .with_context(|| format!("--expires-in {secs} is out of range"))
                })
                .transpose()?;
            let stored = service.connect(record).await?;
            println!("✅ Connected {key} ({})", stored.redacted_token());
        }
        Command::Disconnect { workspace, user } => {
            let key = CredentialKey::new(workspace, user);
            if service.disconnect(&key).await? {
                println!("✅ Disconnected {key}");
            } else {
                println!("⚠️  No credentials stored for {key}");
            }
        }
        Command::Schedule {
            workspace,
            user,
            channel,
            channel_name,
            text,
            at,
            tz,
        } => {
            let message = service
                .schedule(NewMessage {
                    workspace_id: workspace,
                    user_id: user,
                    channel_id: channel,
                    channel_name,
                    content: text,
                    scheduled_for: parse_instant(&at)?,
                    timezone: tz,
                })
                .await?;
            println!("✅ Scheduled {} for {}", message.id, message.local_scheduled_time());
        }
        Command::SendNow { id } => match service.deliver_now(&id).await? {
            Some(message) => println!("{}", serde_json::to_string_pretty(&message)?),
            None => anyhow::bail!("message {id} not found"),
        },
        Command::Cancel { id } => match service.cancel(&id).await? {
            CancelOutcome::Cancelled => println!("✅ Cancelled {id}"),
            CancelOutcome::NotFound => anyhow::bail!("message {id} not found"),
            CancelOutcome::Rejected(status) => {
                anyhow::bail!("message {id} is {status} and can no longer be cancelled")
            }
        },
        Command::List { workspace, user } => {
            let key = CredentialKey::new(workspace, user);
            let messages = service.list_for_owner(&key).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Command::Tick => {
            let dispatched = service.tick().await;
            println!("🔔 Dispatched {dispatched} due message(s)");
        }
    }

    Ok(())
}
