use anyhow::{bail, Context, Result};
use rollcall_core::{ExportPolicy, FaceExtractor, HistogramExtractor};
use rollcall_store::{AttendanceLedger, Database, EmbeddingStore, JobStore, StudentDirectory};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod extraction;
mod training;

use attendance::AttendanceService;
use config::{BusKind, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use training::TrainingJobManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db_path = %config.db_path.display(),
        embedding_dim = config.embedding_dim,
        threshold = config.similarity_threshold,
        "rollcalld starting"
    );

    let extractor: Arc<dyn FaceExtractor> = Arc::new(HistogramExtractor);
    if extractor.dimensions() != config.embedding_dim {
        bail!(
            "extractor produces {}-dimensional embeddings but embedding_dim is {}",
            extractor.dimensions(),
            config.embedding_dim
        );
    }

    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;

    let jobs = JobStore::new(db.clone());
    jobs.mark_interrupted().await?;

    let students = StudentDirectory::new(db.clone());
    let embeddings = EmbeddingStore::new(db.clone(), config.embedding_dim);
    let training = TrainingJobManager::new(
        embeddings.clone(),
        students.clone(),
        jobs,
        Arc::clone(&extractor),
        config.extract_timeout,
    );
    let attendance = AttendanceService::new(
        extractor,
        embeddings,
        AttendanceLedger::new(db.clone()),
        students.clone(),
        config.similarity_threshold,
        config.extract_timeout,
        ExportPolicy {
            reject_empty: config.reject_empty_export,
        },
    );

    let service = RollcallService {
        db,
        students,
        attendance,
        training,
        db_path: config.db_path.clone(),
        embedding_dim: config.embedding_dim,
        similarity_threshold: config.similarity_threshold,
        started_at: Instant::now(),
    };

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the message bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
