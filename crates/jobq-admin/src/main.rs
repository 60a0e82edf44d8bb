use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use jobq_core::DeadLetterEntry;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "jq-admin")]
#[command(about = "Job queue admin CLI", long_about = None)]
struct Args {
    /// REST API address
    #[arg(long, env = "JOBQ_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new job
    Submit {
        /// Task type
        #[arg(short, long)]
        task_type: String,

        /// Inline JSON payload
        #[arg(short, long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// File holding the JSON payload
        #[arg(long)]
        payload_file: Option<String>,

        /// Explicit idempotency key; derived from the payload otherwise
        #[arg(short = 'k', long)]
        idempotency_key: Option<String>,

        /// URL notified when the job finishes
        #[arg(long)]
        callback_url: Option<String>,

        /// Records per chunk for bulk jobs
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Get job status
    Status {
        /// Job ID
        job_id: Uuid,
    },

    /// Request cancellation of a job
    Cancel {
        /// Job ID
        job_id: Uuid,
    },

    /// List dead-lettered tasks
    DeadLetters,

    /// Put a dead-lettered task back on the queue
    Requeue {
        /// Dead-letter entry ID
        id: Uuid,
    },

    /// Show service health
    Health,
}

/// Thin wrapper over the broker's REST API
struct ApiClient {
    client: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(base: &str) -> Self {
        ApiClient {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<(u16, Value)> {
        let response = self.client.get(format!("{}{}", self.base, path)).send().await?;
        Self::read(response).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> anyhow::Result<(u16, Value)> {
        let mut request = self.client.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        Self::read(request.send().await?).await
    }

    /// Error responses become errors, except where the status itself is the
    /// answer (health)
    async fn read(response: reqwest::Response) -> anyhow::Result<(u16, Value)> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_client_error() || (status.is_server_error() && body.get("error").is_some()) {
            let message = body["error"].as_str().unwrap_or("request failed");
            anyhow::bail!("{} ({})", message, status);
        }
        Ok((status.as_u16(), body))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let api = ApiClient::new(&args.api);

    match args.command {
        Commands::Submit {
            task_type,
            payload,
            payload_file,
            idempotency_key,
            callback_url,
            chunk_size,
        } => {
            let payload: Value = match (payload, payload_file) {
                (Some(inline), _) => serde_json::from_str(&inline)?,
                (None, Some(path)) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                (None, None) => json!({}),
            };
            let body = submit_body(task_type, payload, idempotency_key, callback_url, chunk_size);

            let (_, response) = api.post("/jobs", Some(body)).await?;
            match args.format {
                Format::Table => println!("Job submitted: {}", response["jobId"].as_str().unwrap_or("")),
                _ => print_value(args.format, &response)?,
            }
        }

        Commands::Status { job_id } => {
            let (_, job) = api.get(&format!("/jobs/{}", job_id)).await?;
            match args.format {
                Format::Table => println!("{}", job_table(&job)),
                _ => print_value(args.format, &job)?,
            }
        }

        Commands::Cancel { job_id } => {
            let (_, job) = api.post(&format!("/jobs/{}/cancel", job_id), None).await?;
            match args.format {
                Format::Table => {
                    if job["status"] == "CANCELLED" {
                        println!("Job {} cancelled", job_id);
                    } else {
                        println!(
                            "Cancel requested for job {} (status {})",
                            job_id,
                            job["status"].as_str().unwrap_or("unknown")
                        );
                    }
                }
                _ => print_value(args.format, &job)?,
            }
        }

        Commands::DeadLetters => {
            let (_, body) = api.get("/dead-letters").await?;
            let entries: Vec<DeadLetterEntry> = serde_json::from_value(body)?;
            match args.format {
                Format::Table => println!("{}", dead_letter_table(&entries)),
                _ => print_value(args.format, &entries)?,
            }
        }

        Commands::Requeue { id } => {
            let (_, response) = api.post(&format!("/dead-letters/{}/requeue", id), None).await?;
            match args.format {
                Format::Table => println!(
                    "Requeued job {}",
                    response["jobId"].as_str().unwrap_or("")
                ),
                _ => print_value(args.format, &response)?,
            }
        }

        Commands::Health => {
            let (status, health) = api.get("/health").await?;
            match args.format {
                Format::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Property", "Value"]);
                    table.add_row(vec!["HTTP Status", &status.to_string()]);
                    table.add_row(vec!["Status", health["status"].as_str().unwrap_or("unknown")]);
                    table.add_row(vec![
                        "Since Last Success (s)",
                        &health["secondsSinceLastSuccess"].to_string(),
                    ]);
                    table.add_row(vec!["Queue Depth", &health["queueDepth"].to_string()]);
                    println!("{table}");
                }
                _ => print_value(args.format, &health)?,
            }
            if status != 200 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn submit_body(
    task_type: String,
    payload: Value,
    idempotency_key: Option<String>,
    callback_url: Option<String>,
    chunk_size: Option<u64>,
) -> Value {
    let mut body = json!({ "taskType": task_type, "payload": payload });
    if let Some(key) = idempotency_key {
        body["idempotencyKey"] = json!(key);
    }
    if let Some(url) = callback_url {
        body["callbackUrl"] = json!(url);
    }
    if let Some(size) = chunk_size {
        body["chunkSize"] = json!(size);
    }
    body
}

fn print_value<T: Serialize>(format: Format, value: &T) -> anyhow::Result<()> {
    match format {
        Format::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn job_table(job: &Value) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Job ID", job["jobId"].as_str().unwrap_or("")]);
    table.add_row(vec!["Status", job["status"].as_str().unwrap_or("")]);
    table.add_row(vec!["Attempts", &job["attempts"].to_string()]);
    if let Some(offset) = job.get("checkpointOffset") {
        table.add_row(vec!["Checkpoint", &offset.to_string()]);
    }
    if let Some(code) = job.get("errorCode").and_then(Value::as_str) {
        table.add_row(vec!["Error Code", code]);
    }
    if job["cancelRequested"] == true {
        table.add_row(vec!["Cancel Requested", "yes"]);
    }
    if let Some(result) = job.get("result") {
        table.add_row(vec!["Result", &result.to_string()]);
    }
    table
}

fn dead_letter_table(entries: &[DeadLetterEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Job", "Type", "Code", "Attempts", "Reason", "Moved"]);
    for entry in entries {
        table.add_row(vec![
            entry.id.to_string(),
            entry.job_id.to_string(),
            entry.task_type.clone(),
            entry.error_code.as_str().to_string(),
            entry.attempts.to_string(),
            entry.failure_reason.clone(),
            entry.moved_at.to_rfc3339(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit() {
        let args = Args::try_parse_from([
            "jq-admin",
            "--format",
            "json",
            "submit",
            "-t",
            "ledger.debit",
            "-p",
            r#"{"amount": 5}"#,
            "-k",
            "pay-1",
        ])
        .unwrap();

        assert_eq!(args.format, Format::Json);
        match args.command {
            Commands::Submit {
                task_type,
                payload,
                idempotency_key,
                ..
            } => {
                assert_eq!(task_type, "ledger.debit");
                assert_eq!(payload.as_deref(), Some(r#"{"amount": 5}"#));
                assert_eq!(idempotency_key.as_deref(), Some("pay-1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_payload_sources_conflict() {
        let result = Args::try_parse_from([
            "jq-admin",
            "submit",
            "-t",
            "echo",
            "-p",
            "{}",
            "--payload-file",
            "payload.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_status_requires_uuid() {
        assert!(Args::try_parse_from(["jq-admin", "status", "not-a-uuid"]).is_err());
        assert!(Args::try_parse_from(["jq-admin", "status", &Uuid::new_v4().to_string()]).is_ok());
    }

    #[test]
    fn test_submit_body_omits_unset_fields() {
        let body = submit_body("echo".to_string(), json!({"a": 1}), None, None, Some(50));
        assert_eq!(
            body,
            json!({"taskType": "echo", "payload": {"a": 1}, "chunkSize": 50})
        );
    }

    #[test]
    fn test_job_table_shows_checkpoint_for_bulk_jobs() {
        let job = json!({
            "jobId": "j-1",
            "status": "RUNNING",
            "attempts": 1,
            "checkpointOffset": 4
        });
        let rendered = job_table(&job).to_string();
        assert!(rendered.contains("Checkpoint"));
        assert!(rendered.contains("RUNNING"));
    }
}
