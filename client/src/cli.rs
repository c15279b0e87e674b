use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::shuffle::{FetchedTask, ShuffleClient, ShuffleRequest};
use common::{JobId, JobInfo, JobSpec, WorkerMetrics};
use reqwest::Client;

/// - In Docker: MASTER_URL=http://master:8080
/// - Locally: defaults to http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Submit and inspect jobs, list workers, pull shuffle output")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submits a job graph read from a JSON file
    Submit {
        #[arg(value_name = "SPEC_JSON")]
        spec: PathBuf,
    },
    /// Shows the state of a job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Print the raw job record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Aborts a running job
    Abort {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lists registered workers
    Workers,
    /// Pulls partitions of finished tasks straight from a worker's shuffle port
    Fetch {
        /// host:port of the worker's shuffle server
        #[arg(value_name = "ADDR")]
        addr: String,
        #[arg(value_name = "JOB_ID")]
        job: JobId,
        #[arg(long = "partition", required = true)]
        partitions: Vec<i32>,
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,
        /// Directory to write `<task>-p<partition>.bin` files into
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit { spec } => {
            let raw = tokio::fs::read_to_string(&spec)
                .await
                .with_context(|| format!("reading {}", spec.display()))?;
            let spec = JobSpec::from_json(&raw)?;

            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.post(&url).json(&spec).send().await?;
            if !resp.status().is_success() {
                bail!("job rejected (status {})", resp.status());
            }
            let job: JobInfo = resp.json().await?;
            println!("Job submitted:");
            print_job(&job);
        }

        Commands::Status { id, json } => {
            let url = format!("{}/api/v1/jobs/{id}", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&job)?);
                } else {
                    print_job(&job);
                }
            } else {
                println!("Job {id} not found (status {})", resp.status());
            }
        }

        Commands::Abort { id } => {
            let url = format!("{}/api/v1/jobs/{id}/abort", base_url);
            let resp = client.post(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                println!("Job {} is now {:?}", job.id, job.status);
            } else {
                println!("Could not abort job {id} (status {})", resp.status());
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("error querying /api/v1/workers (status {})", resp.status());
            }
            let workers: Vec<WorkerMetrics> = resp.json().await?;
            if workers.is_empty() {
                println!("No workers registered.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {} ({})", w.hostname, w.rack);
                println!("  shuffle        : {}", w.shuffle_addr);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  tasks          : running={}, max={}",
                    w.reported_running, w.max_concurrency
                );
                println!();
            }
        }

        Commands::Fetch {
            addr,
            job,
            partitions,
            tasks,
            out,
        } => {
            let request = ShuffleRequest {
                job_id: job,
                partitions,
                task_ids: tasks,
            };
            let fetched = ShuffleClient::new(addr.as_str())
                .fetch(&request)
                .await
                .with_context(|| format!("fetching from {addr}"))?;
            for task in &fetched {
                print_fetched(task);
                if let Some(dir) = &out {
                    write_fetched(dir, task).await?;
                }
            }
        }
    }

    Ok(())
}

fn print_job(job: &JobInfo) {
    println!("  id       : {}", job.id);
    println!("  name     : {}", job.name);
    println!("  status   : {:?}", job.status);
    println!(
        "  tasks    : {}/{} done, {} failed attempts",
        job.completed_tasks, job.total_tasks, job.failed_attempts
    );
    if job.total_tasks > 0 {
        let pct = job.completed_tasks as f64 / job.total_tasks as f64 * 100.0;
        println!("  progress : {:.1}%", pct);
    }
    for stage in &job.stages {
        println!(
            "  stage {:<10} {}/{} finished",
            stage.name, stage.finished, stage.total_tasks
        );
    }
    println!("  submitted: {}", job.submitted_at);
    if let Some(done) = &job.finished_at {
        println!("  finished : {}", done);
    }
    if let Some(failure) = &job.failure {
        println!("  failure  : {}", failure);
    }
}

fn print_fetched(task: &FetchedTask) {
    println!("Task {} ({} bytes)", task.task_id, task.total_bytes);
    for p in &task.partitions {
        match &p.segments {
            Some(segments) => println!(
                "  partition {:>4}: {} segments, {} compressed, {} uncompressed",
                p.partition,
                segments.len(),
                p.compressed_size,
                p.uncompressed_size
            ),
            None => println!("  partition {:>4}: (empty)", p.partition),
        }
    }
}

async fn write_fetched(dir: &std::path::Path, task: &FetchedTask) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for p in &task.partitions {
        let Some(segments) = &p.segments else { continue };
        let bytes: Vec<u8> = segments.iter().flat_map(|s| s.data.iter().copied()).collect();
        let path = dir.join(format!("{}-p{}.bin", task.task_id, p.partition));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
