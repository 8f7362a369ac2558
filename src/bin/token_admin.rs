//! Operator CLI for issuing, revoking, and listing bearer tokens.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatch_core::config::Config;
use dispatch_core::kernel::tokens::{IssueOutcome, RevokeOutcome};
use dispatch_core::kernel::{PostgresTokenStore, TokenStore};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "token-admin")]
#[command(about = "Issue, revoke, and list dispatch server bearer tokens")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a new token for a user, deactivating any prior active token.
    Issue {
        user_id: String,
        #[arg(long, default_value_t = 30)]
        ttl_days: i64,
        #[arg(long)]
        admin: bool,
    },
    /// Revoke a token by its plaintext value.
    Revoke { token: String },
    /// List all tokens (fingerprints only; plaintext is never stored).
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let store = PostgresTokenStore::new(pool);

    match cli.command {
        Commands::Issue { user_id, ttl_days, admin } => {
            let plaintext = format!("dsp_{}", Uuid::new_v4().simple());
            match store.issue(&user_id, &plaintext, ttl_days, admin).await? {
                IssueOutcome::Ok => {
                    println!("issued token for {user_id} (admin={admin}, ttl_days={ttl_days}):");
                    println!("{plaintext}");
                }
                IssueOutcome::Exists => {
                    println!("a token with this fingerprint already exists; this should not happen for a random token");
                }
            }
        }
        Commands::Revoke { token } => match store.revoke(&token).await? {
            RevokeOutcome::Ok => println!("token revoked"),
            RevokeOutcome::Missing => println!("no active token matched"),
        },
        Commands::List => {
            let rows = store.list().await?;
            if rows.is_empty() {
                println!("no tokens issued");
            }
            for row in rows {
                println!(
                    "{}  user={}  admin={}  active={}  expires_at={}",
                    row.token_fingerprint, row.user_id, row.is_admin, row.is_active, row.expires_at
                );
            }
        }
    }

    Ok(())
}
