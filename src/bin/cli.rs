//! CLI for a registry node

use anyhow::Context;
use clap::{Parser, Subcommand};
use minipg::common::encode_segment;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "minipg")]
#[command(about = "minipg process-group registry CLI")]
#[command(version)]
struct Cli {
    /// Node URL
    #[arg(long, default_value = "http://localhost:7000")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a member to a group
    Join { group: String, member: String },

    /// Remove a member from a group
    Leave { group: String, member: String },

    /// List a group's members (fast lookup, may lag)
    Members { group: String },

    /// Publish a message to every member of a channel
    Publish { channel: String, message: String },

    /// Move vnodes to their current owners
    Rebalance,

    /// Node health
    Health,
}

async fn check(response: reqwest::Response) -> anyhow::Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.context("invalid response body")?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{}: {}", status, message);
    }
    Ok(body)
}

fn print_members(body: &Value) {
    let members = body["members"].as_array().cloned().unwrap_or_default();
    if members.is_empty() {
        println!("(no members)");
    }
    for member in members {
        println!("  {}", member.as_str().unwrap_or_default());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.node.trim_end_matches('/');

    match cli.command {
        Commands::Join { group, member } => {
            let response = client
                .post(format!("{}/groups/{}/members", base, encode_segment(&group)))
                .json(&json!({ "member": member }))
                .send()
                .await?;
            let body = check(response).await?;
            println!("Joined {} ({})", group, body["request_id"]);
            print_members(&body);
        }

        Commands::Leave { group, member } => {
            let response = client
                .delete(format!(
                    "{}/groups/{}/members/{}",
                    base,
                    encode_segment(&group),
                    encode_segment(&member)
                ))
                .send()
                .await?;
            let body = check(response).await?;
            println!("Left {} ({})", group, body["request_id"]);
            print_members(&body);
        }

        Commands::Members { group } => {
            let response = client
                .get(format!("{}/groups/{}/members", base, encode_segment(&group)))
                .send()
                .await?;
            print_members(&check(response).await?);
        }

        Commands::Publish { channel, message } => {
            let response = client
                .post(format!("{}/channels/{}/publish", base, encode_segment(&channel)))
                .body(message)
                .send()
                .await?;
            let body = check(response).await?;
            let notified = body["notified"].as_array().map(|a| a.len()).unwrap_or(0);
            println!("Published to {} members of {}", notified, channel);
        }

        Commands::Rebalance => {
            let response = client
                .post(format!("{}/admin/rebalance", base))
                .send()
                .await?;
            let body = check(response).await?;
            let report = &body["report"];
            println!("Rebalance report:");
            println!("  Vnodes moved: {}", report["vnodes_moved"]);
            println!("  Groups transferred: {}", report["groups_transferred"]);
            println!("  Failures: {}", report["failures"]);
        }

        Commands::Health => {
            let response = client.get(format!("{}/health", base)).send().await?;
            let body = check(response).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
