//! Huddle Server - signaling relay for Huddle calls

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use huddle_server::config::Config;
use huddle_server::storage::Storage;
use huddle_server::{crypto, now_millis, router, spawn_cleanup, spawn_invite_sweeper, AppState};

/// Huddle Server CLI
#[derive(Parser)]
#[command(name = "huddle-server")]
#[command(about = "Signaling relay for Huddle calls")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a session token, creating the user if needed
    IssueToken {
        /// Admin master key for authorization
        #[arg(long)]
        admin_key: String,

        /// Optional user ID (will be generated if not provided)
        #[arg(long)]
        user_id: Option<String>,

        /// Display name for a new user
        #[arg(long)]
        display_name: Option<String>,
    },

    /// List all registered users
    ListUsers {
        /// Admin master key
        #[arg(long)]
        admin_key: String,
    },

    /// Deactivate a user and invalidate their sessions
    RevokeUser {
        /// Admin master key
        #[arg(long)]
        admin_key: String,

        /// User ID to revoke
        #[arg(long)]
        user_id: String,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "huddle_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::IssueToken {
            admin_key,
            user_id,
            display_name,
        } => {
            issue_token(&config, &admin_key, user_id, display_name).await?;
        }
        Commands::ListUsers { admin_key } => {
            list_users(&config, &admin_key).await?;
        }
        Commands::RevokeUser { admin_key, user_id } => {
            revoke_user(&config, &admin_key, &user_id).await?;
        }
        Commands::Run => {
            run_server(config).await?;
        }
    }

    Ok(())
}

fn check_admin_key(config: &Config, admin_key: &str) -> anyhow::Result<()> {
    if admin_key != config.admin.master_key {
        anyhow::bail!("Invalid admin key");
    }
    Ok(())
}

async fn issue_token(
    config: &Config,
    admin_key: &str,
    user_id: Option<String>,
    display_name: Option<String>,
) -> anyhow::Result<()> {
    check_admin_key(config, admin_key)?;

    let storage = Storage::new(&config.storage.database_path).await?;

    let user_id = user_id.unwrap_or_else(crypto::generate_user_id);
    if storage.get_user(&user_id).await?.is_none() {
        storage.create_user(&user_id, display_name.as_deref()).await?;
    } else if let Some(name) = display_name.as_deref() {
        storage.set_display_name(&user_id, name).await?;
    }

    let device_id = crypto::generate_device_id();
    let token = crypto::generate_session_token();
    let expires_at = storage
        .create_session(
            &user_id,
            &device_id,
            &token,
            config.storage.session_ttl_hours as i64,
        )
        .await?;

    println!("=== New Session Token ===");
    println!("User ID: {}", user_id);
    println!("Device ID: {}", device_id);
    println!("Token: {}", token);
    println!("Expires: {}", expires_at.to_rfc3339());
    println!("=========================");
    println!("The token will NOT be shown again!");

    Ok(())
}

async fn list_users(config: &Config, admin_key: &str) -> anyhow::Result<()> {
    check_admin_key(config, admin_key)?;

    let storage = Storage::new(&config.storage.database_path).await?;
    let users = storage.list_users().await?;

    println!("=== Registered Users ===");
    for user in users {
        println!(
            "User ID: {} | Name: {} | Created: {} | Active: {}",
            user.user_id,
            user.display_name.as_deref().unwrap_or("-"),
            user.created_at,
            user.is_active
        );
    }

    Ok(())
}

async fn revoke_user(config: &Config, admin_key: &str, user_id: &str) -> anyhow::Result<()> {
    check_admin_key(config, admin_key)?;

    let storage = Storage::new(&config.storage.database_path).await?;
    if storage.deactivate_user(user_id).await? {
        println!("User {} has been deactivated", user_id);
    } else {
        println!("No user {}", user_id);
    }

    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Huddle Server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize storage
    let storage = Storage::new(&config.storage.database_path).await?;
    let closed = storage.close_stale_calls(now_millis()).await?;
    if closed > 0 {
        tracing::info!("Closed {} calls left open by the previous run", closed);
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, storage);

    spawn_invite_sweeper(state.clone());
    spawn_cleanup(state.clone());

    let app = router(state);

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
