use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use provis_pipeline::config::Config;
use provis_pipeline::ingest::{ZipGuard, ZipLimits};
use reqwest::{multipart, Client, Response};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "provis-cli")]
#[command(about = "Provis pipeline CLI", long_about = None)]
struct Cli {
    #[arg(short, long, env = "PROVIS_ENDPOINT", default_value = "http://localhost:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a zipped repository and start a job
    Ingest {
        #[arg(value_name = "ZIP")]
        path: PathBuf,

        /// Follow the job's events after uploading
        #[arg(short, long)]
        watch: bool,
    },

    /// Show a job's phase and percentage
    Status {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },

    /// Follow a job's event stream until it ends
    Watch {
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Resume after this event sequence number
        #[arg(short, long)]
        after: Option<u64>,
    },

    /// List artifact versions of a snapshot
    Artifacts {
        #[arg(value_name = "REPO_ID")]
        repo_id: String,

        #[arg(value_name = "SNAPSHOT_ID")]
        snapshot_id: String,
    },

    /// Fetch the latest artifact of one kind for a repo
    Get {
        #[arg(value_name = "REPO_ID")]
        repo_id: String,

        /// tree, files, graph, summaries, capabilities or metrics
        #[arg(value_name = "KIND")]
        kind: String,
    },

    /// Request cancellation of a job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },

    /// Check server health
    Health,

    /// Run the upload checks locally without uploading
    Check {
        #[arg(value_name = "ZIP")]
        path: PathBuf,
    },
}

async fn print_json(response: Response) -> anyhow::Result<serde_json::Value> {
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("request failed with {}", status);
    }
    Ok(body)
}

/// Print SSE frames until the job reaches `done` or `error`
async fn watch(client: &Client, endpoint: &str, job_id: &str, after: Option<u64>) -> anyhow::Result<()> {
    let mut request = client.get(format!("{}/jobs/{}/events", endpoint, job_id));
    if let Some(after) = after {
        request = request.header("Last-Event-ID", after.to_string());
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return print_json(response).await.map(|_| ());
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut event_type = String::new();

    while let Some(chunk) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&chunk?));
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            if let Some(value) = line.strip_prefix("event:") {
                event_type = value.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                println!("[{}] {}", event_type, data.trim());
                if event_type == "done" || event_type == "error" {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Ingest { path, watch: follow } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "repo.zip".to_string());
            let form = multipart::Form::new().part(
                "file",
                multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("application/zip")?,
            );

            let response = client
                .post(format!("{}/ingest", cli.endpoint))
                .multipart(form)
                .send()
                .await?;
            let body = print_json(response).await?;

            if follow {
                let job_id = body["jobId"]
                    .as_str()
                    .context("response has no jobId")?
                    .to_string();
                watch(&client, &cli.endpoint, &job_id, None).await?;
            }
        }

        Commands::Status { job_id } => {
            let response = client
                .get(format!("{}/status/{}", cli.endpoint, job_id))
                .send()
                .await?;
            print_json(response).await?;
        }

        Commands::Watch { job_id, after } => {
            watch(&client, &cli.endpoint, &job_id, after).await?;
        }

        Commands::Artifacts {
            repo_id,
            snapshot_id,
        } => {
            let response = client
                .get(format!(
                    "{}/repos/{}/snapshots/{}/artifacts",
                    cli.endpoint, repo_id, snapshot_id
                ))
                .send()
                .await?;
            print_json(response).await?;
        }

        Commands::Get { repo_id, kind } => {
            let response = client
                .get(format!("{}/repo/{}/{}", cli.endpoint, repo_id, kind))
                .send()
                .await?;
            print_json(response).await?;
        }

        Commands::Cancel { job_id } => {
            let response = client
                .post(format!("{}/jobs/{}/cancel", cli.endpoint, job_id))
                .send()
                .await?;
            print_json(response).await?;
        }

        Commands::Health => {
            let response = client
                .get(format!("{}/health", cli.endpoint))
                .send()
                .await?;
            print_json(response).await?;
        }

        Commands::Check { path } => {
            let config = Config::load()?;
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let guard = ZipGuard::new(ZipLimits::from(&config.ingest));

            match guard.inspect(&bytes) {
                Ok(manifest) => {
                    println!("✅ {} accepted", path.display());
                    println!("   files:        {}", manifest.file_count());
                    println!("   bytes:        {}", manifest.total_bytes);
                    println!("   content hash: {}", manifest.content_hash);
                }
                Err(e) => {
                    println!("❌ {} rejected ({}): {}", path.display(), e.error_code(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
