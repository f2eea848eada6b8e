//! Match administration utility
//!
//! **Usage:**
//! ```bash
//! skymark-admin new-match --key FINALS [--count 40] [--server http://127.0.0.1:5000]
//! skymark-admin decode 7 FINALS
//! skymark-admin verify FINALS
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use skymark_common::api::{
    DecodeResponse, ErrorResponse, NewMatchRequest, NewMatchResponse, VerifyResponse,
    DECODE_PATH, NEW_MATCH_PATH, VERIFY_MATCH_KEY_PATH,
};

/// Match administration for skymark-scorer
#[derive(Parser, Debug)]
#[command(name = "skymark-admin")]
#[command(about = "Create matches and query the skymark scoring authority")]
#[command(version)]
struct Args {
    /// Scoring authority base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000", env = "SKYMARK_SERVER")]
    server: String,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a match with tag ids "1" through COUNT
    NewMatch {
        /// Match key to register
        #[arg(long)]
        key: String,

        /// Number of tags in play
        #[arg(long, default_value = "40")]
        count: u32,
    },
    /// Look up the points of one tag
    Decode {
        tag_id: String,
        match_key: String,
    },
    /// Check whether a match key is registered
    Verify { match_key: String },
}

/// Tag ids "1".."count"
fn tag_ids(count: u32) -> Vec<String> {
    (1..=count).map(|i| i.to_string()).collect()
}

fn endpoint(server: &str, path: &str) -> String {
    format!("{}{}", server.trim_end_matches('/'), path)
}

/// Error text from a non-2xx response body, falling back to the status line
async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{} ({})", body.error, status),
        Err(_) => status.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
        .context("Failed to build HTTP client")?;

    match args.command {
        Command::NewMatch { key, count } => {
            if count == 0 {
                bail!("--count must be at least 1");
            }
            let request = NewMatchRequest {
                match_key: Some(key),
                tag_ids: Some(tag_ids(count)),
            };
            let response = client
                .post(endpoint(&args.server, NEW_MATCH_PATH))
                .json(&request)
                .send()
                .await
                .with_context(|| format!("Scoring authority not reachable at {}", args.server))?;
            if !response.status().is_success() {
                bail!("Match creation failed: {}", error_text(response).await);
            }
            let created: NewMatchResponse = response
                .json()
                .await
                .context("Malformed match creation response")?;

            println!("Match created: {}", created.match_key);
            println!("Tags: {}", created.tag_count);
            let mut mapping: Vec<_> = created.mapping.into_iter().collect();
            mapping.sort_by_key(|(id, _)| id.parse::<u64>().unwrap_or(u64::MAX));
            for (tag_id, points) in mapping {
                println!("  tag {:>3}: {:>4}", tag_id, points);
            }
        }
        Command::Decode { tag_id, match_key } => {
            let response = client
                .get(endpoint(&args.server, DECODE_PATH))
                .query(&[("tag_id", tag_id.as_str()), ("match_key", match_key.as_str())])
                .send()
                .await
                .with_context(|| format!("Scoring authority not reachable at {}", args.server))?;
            if !response.status().is_success() {
                bail!("Decode failed: {}", error_text(response).await);
            }
            let decoded: DecodeResponse =
                response.json().await.context("Malformed decode response")?;
            println!("Tag {}: {} points", decoded.tag_id, decoded.points);
        }
        Command::Verify { match_key } => {
            let response = client
                .get(endpoint(&args.server, VERIFY_MATCH_KEY_PATH))
                .query(&[("match_key", match_key.as_str())])
                .send()
                .await
                .with_context(|| format!("Scoring authority not reachable at {}", args.server))?;
            let status = response.status();
            if status == reqwest::StatusCode::BAD_REQUEST {
                bail!("Verification failed: {}", error_text(response).await);
            }
            let verified: VerifyResponse = response
                .json()
                .await
                .with_context(|| format!("Malformed verification response ({})", status))?;
            if verified.valid {
                println!("Match key {} is valid", match_key);
            } else {
                println!("Match key {} is not registered", match_key);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
