//! Notesync reference server.
//!
//! Serves the table, view, access-control and change-stream API over an
//! in-memory store, so clients can be exercised end to end.

use anyhow::Result;
use clap::{Parser, Subcommand};
use notesync::api;
use notesync_core::auth::{Hs256Verifier, TokenVerifier};
use notesync_core::backend::MemoryBackend;
use notesync_core::model::UserContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "In-memory notes backend with live change streams")]
struct Cli {
    /// Secret for HS256 bearer tokens
    #[arg(long, env = "NOTESYNC_JWT_SECRET", default_value = "dev-secret")]
    jwt_secret: String,

    /// Listen address
    #[arg(short, long, env = "NOTESYNC_ADDR", default_value = "127.0.0.1:3000")]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server (the default)
    Serve,

    /// Print a bearer token for a user
    Token {
        /// User id placed in the `sub` claim
        user_id: String,

        #[arg(long, default_value = "")]
        email: String,

        /// Lifetime in hours; omit for a token that never expires
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let verifier = Arc::new(Hs256Verifier::new(cli.jwt_secret));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.addr, verifier).await,
        Commands::Token {
            user_id,
            email,
            ttl_hours,
        } => {
            let token = verifier.issue(
                &UserContext::new(user_id, email),
                ttl_hours.map(chrono::Duration::hours),
            )?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(addr: SocketAddr, verifier: Arc<Hs256Verifier>) -> Result<()> {
    let verifier: Arc<dyn TokenVerifier> = verifier;
    let app = api::router(MemoryBackend::new(), verifier);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "notesync listening");
    axum::serve(listener, app).await?;
    Ok(())
}
