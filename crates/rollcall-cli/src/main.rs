use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Rollcall {
    async fn add_student(&self, student_id: &str, name: &str, email: &str) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn submit_photo(
        &self,
        course: &str,
        date: &str,
        time: &str,
        image: Vec<u8>,
    ) -> zbus::Result<String>;
    async fn attendance(&self, course: &str, date: &str) -> zbus::Result<String>;
    async fn absentees(&self, course: &str, date: &str, roster: Vec<String>)
        -> zbus::Result<String>;
    async fn export_attendance(&self, course: &str, date: &str) -> zbus::Result<(String, Vec<u8>)>;
    async fn start_training(
        &self,
        student_id: &str,
        images: Vec<Vec<u8>>,
        replace: bool,
    ) -> zbus::Result<String>;
    async fn training_status(&self, student_id: &str) -> zbus::Result<String>;
    async fn clear_gallery(&self, student_id: &str) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student
    AddStudent {
        student_id: String,
        name: String,
        email: String,
    },
    /// List registered students
    Students,
    /// Enroll face images for a student
    Enroll {
        student_id: String,
        /// Enrollment images, one face each
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Replace the existing gallery instead of appending
        #[arg(long)]
        replace: bool,
    },
    /// Show the student's latest training job
    TrainingStatus {
        student_id: String,
        /// Poll until the job finishes
        #[arg(long)]
        wait: bool,
    },
    /// Remove every enrolled face for a student
    ClearGallery { student_id: String },
    /// Submit a class photo and mark recognized students present
    Capture {
        course: String,
        image: PathBuf,
        /// Class date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<String>,
        /// Capture time (HH:MM[:SS]), defaults to now
        #[arg(short, long)]
        time: Option<String>,
    },
    /// List attendance for a class session
    Attendance {
        course: String,
        #[arg(short, long)]
        date: Option<String>,
    },
    /// List students with no attendance record for a class session
    Absentees {
        course: String,
        #[arg(short, long)]
        date: Option<String>,
        /// Course roster; defaults to every registered student
        #[arg(long, value_delimiter = ',')]
        roster: Vec<String>,
    },
    /// Write the session's attendance CSV
    Export {
        course: String,
        #[arg(short, long)]
        date: Option<String>,
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Show stored data counts
    Stats,
    /// Show daemon status
    Status,
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
    };
    let conn = conn.context("failed to connect to the message bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::AddStudent {
            student_id,
            name,
            email,
        } => {
            print_json(&proxy.add_student(&student_id, &name, &email).await?)?;
        }
        Commands::Students => {
            print_json(&proxy.list_students().await?)?;
        }
        Commands::Enroll {
            student_id,
            images,
            replace,
        } => {
            let images = images
                .iter()
                .map(|path| read_image(path))
                .collect::<Result<Vec<_>>>()?;
            println!("Submitting {} image(s) for {student_id}", images.len());
            print_json(&proxy.start_training(&student_id, images, replace).await?)?;
        }
        Commands::TrainingStatus { student_id, wait } => {
            let mut last_progress = None;
            loop {
                let job: serde_json::Value =
                    serde_json::from_str(&proxy.training_status(&student_id).await?)?;
                let state = job["state"].as_str().unwrap_or_default().to_string();
                if !wait || state == "succeeded" || state == "failed" {
                    println!("{}", serde_json::to_string_pretty(&job)?);
                    break;
                }
                let progress = job["progress"].as_u64();
                if progress != last_progress {
                    println!("{state}: {}%", progress.unwrap_or(0));
                    last_progress = progress;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Commands::ClearGallery { student_id } => {
            print_json(&proxy.clear_gallery(&student_id).await?)?;
        }
        Commands::Capture {
            course,
            image,
            date,
            time,
        } => {
            let image = read_image(&image)?;
            let date = date_or_today(date);
            let report = proxy
                .submit_photo(&course, &date, time.as_deref().unwrap_or(""), image)
                .await?;
            print_json(&report)?;
        }
        Commands::Attendance { course, date } => {
            print_json(&proxy.attendance(&course, &date_or_today(date)).await?)?;
        }
        Commands::Absentees {
            course,
            date,
            roster,
        } => {
            print_json(&proxy.absentees(&course, &date_or_today(date), roster).await?)?;
        }
        Commands::Export { course, date, out } => {
            let (filename, bytes) = proxy
                .export_attendance(&course, &date_or_today(date))
                .await?;
            let path = out.join(filename);
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        Commands::Stats => {
            print_json(&proxy.stats().await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(bytes)
}

fn date_or_today(date: Option<String>) -> String {
    date.unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
