use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ActionClient, BatchRequest, ClientConfig, RetryPolicy, SendOptions};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use shared::protocol::ADMIN_KEY_HEADER;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Dispatch actions against an action router endpoint")]
struct Args {
    #[arg(long, env = "ACTION_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server_url: String,
    /// Sent as `x-admin-key` on every request.
    #[arg(long, env = "ACTION_ADMIN_KEY")]
    admin_key: Option<String>,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and print a fresh auth token.
    Token,
    /// Send one action. The payload is a JSON value.
    Send {
        action: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Skip fetching an auth token first.
        #[arg(long)]
        no_token: bool,
        #[arg(long)]
        retry: bool,
    },
    /// Send a JSON file holding `[{"action": ..., "payload": ...}, ...]`.
    Batch {
        file: PathBuf,
        #[arg(long, default_value_t = 3)]
        concurrency: usize,
    },
    /// List registered actions (requires the admin key).
    Actions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::new(&args.server_url);
    config.timeout = Duration::from_secs(args.timeout_secs);
    if let Command::Batch { concurrency, .. } = &args.command {
        config.batch_concurrency = *concurrency;
    }
    let client = ActionClient::with_http(config, http_client(args.admin_key.as_deref())?);

    match args.command {
        Command::Token => {
            println!("{}", client.refresh_auth_token().await?);
        }
        Command::Send {
            action,
            payload,
            no_token,
            retry,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            if !no_token {
                client.refresh_auth_token().await?;
            }
            let mut options = SendOptions::default();
            if retry {
                options = options.with_retry(RetryPolicy::default());
            }
            let data = client.send(&action, payload, &options).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Batch { file, .. } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let requests: Vec<BatchRequest> =
                serde_json::from_str(&raw).context("batch file must be a JSON array")?;
            client.refresh_auth_token().await?;
            info!(count = requests.len(), "sending batch");
            for (request, result) in requests
                .iter()
                .zip(client.send_batch(&requests, &SendOptions::default()).await)
            {
                match result {
                    Ok(data) => println!("{}: ok {data}", request.action),
                    Err(err) => println!("{}: {} {err}", request.action, err.code()),
                }
            }
        }
        Command::Actions => {
            for (name, summary) in client.list_actions().await? {
                let capability = summary.required_capability.as_deref().unwrap_or("-");
                let token = if summary.require_auth_token { "token" } else { "-" };
                println!("{name:<24} {token:<6} {capability:<16} {}", summary.description);
            }
        }
    }
    Ok(())
}

fn http_client(admin_key: Option<&str>) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(key) = admin_key {
        headers.insert(
            ADMIN_KEY_HEADER,
            HeaderValue::from_str(key).context("admin key is not a valid header value")?,
        );
    }
    Ok(reqwest::Client::builder().default_headers(headers).build()?)
}
