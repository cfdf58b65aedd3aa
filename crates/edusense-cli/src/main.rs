use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

// `#[zbus::proxy]` generates the async `AttendanceProxy` used below.
#[zbus::proxy(
    interface = "org.edusense.Attendance1",
    default_service = "org.edusense.Attendance1",
    default_path = "/org/edusense/Attendance1"
)]
trait Attendance {
    async fn submit_video(&self, session_id: &str, video_path: &str) -> zbus::Result<String>;
    async fn submit_archive(&self, archive_path: &str, remove_after: bool) -> zbus::Result<String>;
    async fn task_status(&self, task_id: &str) -> zbus::Result<String>;
    async fn list_tasks(&self) -> zbus::Result<String>;
    async fn cancel_task(&self, task_id: &str) -> zbus::Result<bool>;
    async fn session_tallies(&self, session_id: &str) -> zbus::Result<String>;
    async fn override_tally(&self, session_id: &str, identity_id: &str, note: &str) -> zbus::Result<String>;
    async fn flag_dispute(&self, session_id: &str, identity_id: &str, note: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "edusense", about = "EduSense attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take attendance for a session from a lecture video
    Analyze {
        /// Session the video belongs to
        session: String,
        /// Path to the video file
        video: PathBuf,
        /// Wait for the task to finish and print its result
        #[arg(short, long)]
        wait: bool,
    },
    /// Register faces from a ZIP archive of student photos
    Register {
        /// Path to the ZIP archive
        archive: PathBuf,
        /// Delete the archive once the daemon has processed it
        #[arg(long)]
        remove: bool,
        /// Wait for the task to finish and print its result
        #[arg(short, long)]
        wait: bool,
    },
    /// Show one task
    Status {
        id: String,
    },
    /// List all tasks
    Tasks,
    /// Cancel a queued or running task
    Cancel {
        id: String,
    },
    /// Show the tallies of a session
    Tallies {
        session: String,
    },
    /// Mark a student present by hand
    Override {
        session: String,
        identity: String,
        /// Reason for the override
        #[arg(short, long, default_value = "")]
        note: String,
    },
    /// Flag a tally as disputed
    Dispute {
        session: String,
        identity: String,
        /// What is wrong with the tally
        #[arg(short, long)]
        note: String,
    },
    /// Show daemon status
    DaemonStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("edusensed is not reachable")?;

    match cli.command {
        Commands::Analyze { session, video, wait } => {
            let video = absolute(&video)?;
            let id = proxy.submit_video(&session, &video).await?;
            finish_submission(&proxy, &id, wait).await?;
        }
        Commands::Register { archive, remove, wait } => {
            let archive = absolute(&archive)?;
            let id = proxy.submit_archive(&archive, remove).await?;
            finish_submission(&proxy, &id, wait).await?;
        }
        Commands::Status { id } => print_json(&proxy.task_status(&id).await?)?,
        Commands::Tasks => {
            let tasks: Vec<Value> = serde_json::from_str(&proxy.list_tasks().await?)?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in &tasks {
                println!(
                    "{}  {:<18} {:<10} {:>5.1}%",
                    field(task, "task_id"),
                    field(task, "kind"),
                    field(task, "status"),
                    task["progress"].as_f64().unwrap_or(0.0) * 100.0
                );
            }
        }
        Commands::Cancel { id } => {
            if proxy.cancel_task(&id).await? {
                println!("Cancellation requested for {id}");
            } else {
                println!("Task {id} has already finished");
            }
        }
        Commands::Tallies { session } => {
            let tallies: Vec<Value> = serde_json::from_str(&proxy.session_tallies(&session).await?)?;
            if tallies.is_empty() {
                println!("No tallies stored for {session}");
            }
            for t in &tallies {
                let flag = if t["disputed"].as_bool().unwrap_or(false) { " (disputed)" } else { "" };
                println!(
                    "{:<20} {:<20} seen {:>4}  {}{}",
                    field(t, "identity_id"),
                    field(t, "status"),
                    t["appearance_count"].as_u64().unwrap_or(0),
                    t["dominant_emotion"].as_str().unwrap_or("-"),
                    flag
                );
            }
        }
        Commands::Override { session, identity, note } => {
            print_json(&proxy.override_tally(&session, &identity, &note).await?)?;
        }
        Commands::Dispute { session, identity, note } => {
            print_json(&proxy.flag_dispute(&session, &identity, &note).await?)?;
        }
        Commands::DaemonStatus => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

/// The daemon resolves paths itself, so relative ones are made absolute here.
fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("{}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

async fn finish_submission(proxy: &AttendanceProxy<'_>, id: &str, wait: bool) -> Result<()> {
    println!("Task {id} queued");
    if !wait {
        return Ok(());
    }

    tracing::debug!(task_id = id, "waiting for task");
    let mut last_progress = -1.0;
    loop {
        let snapshot: Value = serde_json::from_str(&proxy.task_status(id).await?)?;
        let status = field(&snapshot, "status").to_string();
        let progress = snapshot["progress"].as_f64().unwrap_or(0.0);
        if progress != last_progress {
            eprintln!("{status} {:>5.1}%", progress * 100.0);
            last_progress = progress;
        }
        match status.as_str() {
            "succeeded" => {
                println!("{}", serde_json::to_string_pretty(&snapshot["result"])?);
                return Ok(());
            }
            "cancelled" => bail!("task {id} was cancelled"),
            "failed" => bail!(
                "task {id} failed ({}): {}",
                field(&snapshot["error"], "category"),
                field(&snapshot["error"], "message")
            ),
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("?")
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
