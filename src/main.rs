use anyhow::Context;
use clap::Parser;
use meta_ads_mcp::{Config, GraphClient, MetaAdsMcpServer};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Meta Ads MCP server
#[derive(Debug, Parser)]
#[command(name = "meta-ads-mcp", version, about)]
struct Cli {
    /// Log in once, store the token and exit
    #[arg(long, conflicts_with_all = ["logout", "status"])]
    login: bool,

    /// Forget the stored token and exit
    #[arg(long, conflicts_with = "status")]
    logout: bool,

    /// Print the authentication state and exit
    #[arg(long)]
    status: bool,
}

fn init_tracing() {
    // Logs go to stderr; stdout carries the MCP protocol
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "meta_ads_mcp=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_ansi(false),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::from_env_or_file().context("Failed to load configuration")?;
    info!(auth_mode = ?config.auth_mode(), "Configuration loaded");

    let client = Arc::new(GraphClient::from_config(&config)?);

    if cli.login {
        let token = client.login().await?;
        info!(source = ?token.source, "Login succeeded");
        println!(
            "Logged in. Token stored at {}",
            client.token_store().path().display()
        );
        client.callback().stop().await;
        return Ok(());
    }

    if cli.logout {
        client.logout().await?;
        println!("Logged out.");
        return Ok(());
    }

    if cli.status {
        let token = client.token_store().load();
        let status = json!({
            "auth_mode": config.auth_mode(),
            "env_token": client.has_env_token(),
            "token_path": client.token_store().path(),
            "cached_token": token.as_ref().map(|t| json!({
                "source": t.source,
                "expires_at": t.expires_at,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    info!("Starting Meta Ads MCP server on stdio");
    let service = MetaAdsMcpServer::new(client.clone()).serve(stdio()).await?;
    service.waiting().await?;

    client.callback().stop().await;
    Ok(())
}
