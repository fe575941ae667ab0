//! wolfcollectivectl - Command line tool for managing a collective
//!
//! Usage:
//!   wolfcollectivectl show                    - Show collective members
//!   wolfcollectivectl invite <name>           - Invite a new member
//!   wolfcollectivectl join <server> <token>   - Join a collective
//!   wolfcollectivectl delete <name>           - Remove an offline member
//!   wolfcollectivectl status                  - Show local member status

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::{de::DeserializeOwned, Deserialize};
use std::path::PathBuf;

/// WolfCollective Control Tool
#[derive(Parser)]
#[command(name = "wolfcollectivectl")]
#[command(about = "Control and monitor a WolfCollective", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfcollective/wolfcollective.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show collective members and the leader
    Show,
    /// Create an invitation token for a new member
    Invite {
        /// Name the new member will take
        name: String,
    },
    /// Join the collective served by another member
    Join {
        /// Address of an existing member
        server: String,
        /// Invitation token issued by that member
        token: String,
    },
    /// Remove an offline member from the collective
    Delete {
        /// Member name
        name: String,
    },
    /// Show status of the local member
    Status,
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct CollectiveInfo {
    leader: String,
    #[serde(default)]
    active: Vec<String>,
    #[serde(default)]
    offline: Vec<String>,
    #[serde(default)]
    quorum: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    name: String,
    role: String,
    #[serde(default)]
    leader: Option<String>,
    txcount: u64,
    members: usize,
    #[serde(default)]
    followers: Vec<String>,
    quorum: bool,
}

#[derive(Debug, Deserialize)]
struct InviteResponse {
    name: String,
    invitation: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "127.0.0.1:13002".to_string()
}

fn endpoint_from_config(path: &PathBuf) -> String {
    let address = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // A wildcard bind is reached over loopback
    match address.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", address),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Show => show(&client, &endpoint).await,
        Commands::Invite { name } => invite(&client, &endpoint, name).await,
        Commands::Join { server, token } => join(&client, &endpoint, server, token).await,
        Commands::Delete { name } => delete(&client, &endpoint, name).await,
        Commands::Status => status(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Decode a JSON body, turning API errors into their message
async fn read<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    let status = response.status();
    if !status.is_success() {
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => format!("API error: {}", status),
        };
        bail!(message);
    }
    response.json().await.context("unexpected response from API")
}

// ============ Commands ============

async fn show(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/collective", endpoint))
        .send()
        .await
        .with_context(|| format!("unable to reach {}", endpoint))?;
    let info: CollectiveInfo = read(response).await?;

    println!();
    println!("Quorum: {}", match info.quorum {
        Some(true) => "\x1b[32mYes\x1b[0m",
        Some(false) => "\x1b[31mNo\x1b[0m",
        None => "unknown",
    });
    println!("Leader: \x1b[1;34m{}\x1b[0m", info.leader);
    if !info.active.is_empty() {
        println!("Active collective members:");
        for member in &info.active {
            println!("    {}", member);
        }
    }
    if !info.offline.is_empty() {
        println!("Offline collective members:");
        for member in &info.offline {
            println!("    \x1b[31m{}\x1b[0m", member);
        }
    }
    println!();

    Ok(())
}

async fn invite(client: &reqwest::Client, endpoint: &str, name: &str) -> anyhow::Result<()> {
    let response = client
        .post(format!("{}/collective/invite", endpoint))
        .json(&serde_json::json!({ "name": name }))
        .send()
        .await
        .with_context(|| format!("unable to reach {}", endpoint))?;
    let invite: InviteResponse = read(response).await?;

    println!("Invitation for {}:", invite.name);
    println!("{}", invite.invitation);
    Ok(())
}

async fn join(client: &reqwest::Client, endpoint: &str, server: &str, token: &str) -> anyhow::Result<()> {
    let response = client
        .post(format!("{}/collective/join", endpoint))
        .json(&serde_json::json!({ "invitation": token, "server": server }))
        .send()
        .await
        .with_context(|| format!("unable to reach {}", endpoint))?;
    let result: MessageResponse = read(response).await?;

    println!("{}", result.message);
    Ok(())
}

async fn delete(client: &reqwest::Client, endpoint: &str, name: &str) -> anyhow::Result<()> {
    let response = client
        .delete(format!("{}/collective/members/{}", endpoint, name))
        .send()
        .await
        .with_context(|| format!("unable to reach {}", endpoint))?;
    let result: MessageResponse = read(response).await?;

    println!("{}", result.message);
    Ok(())
}

async fn status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/status", endpoint))
        .send()
        .await
        .with_context(|| format!("unable to reach {}", endpoint))?;
    let status: StatusResponse = read(response).await?;

    println!();
    println!("Member Status");
    println!("=============");
    println!();
    println!("Name:         {}", status.name);
    println!("Role:         {}", status.role);
    if let Some(leader) = &status.leader {
        println!("Leader:       {}", leader);
    }
    println!("Transactions: {}", status.txcount);
    println!("Members:      {}", status.members);
    if !status.followers.is_empty() {
        println!("Followers:    {}", status.followers.join(", "));
    }
    println!("Quorum:       {}", if status.quorum { "yes" } else { "no" });
    println!();

    Ok(())
}
