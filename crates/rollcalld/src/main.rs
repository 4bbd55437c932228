use anyhow::{Context, Result};
use rollcall_core::{
    shared_classifier, shared_detector, Dataset, EmbeddingClassifier, EnrollmentManager,
    IdentityStore, RecognitionEngine, ScrfdDetector, TrainingManager,
};
use rollcall_hw::V4l2Opener;
use rollcalld::attendance::SqliteAttendanceStore;
use rollcalld::config::Config;
use rollcalld::coordinator::{Coordinator, Pipeline, SessionSettings};
use rollcalld::dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use rollcalld::report::PdfReportRenderer;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        threshold = config.confidence_threshold,
        "configuration loaded"
    );

    // Models are loaded up front; a missing model is a startup error.
    let scrfd_path = config.scrfd_model_path();
    let detector = shared_detector(
        ScrfdDetector::load(&scrfd_path).with_context(|| format!("loading {scrfd_path}"))?,
    );
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let classifier = shared_classifier(
        EmbeddingClassifier::load(&arcface_path).with_context(|| format!("loading {arcface_path}"))?,
    );
    tracing::info!(path = %arcface_path, "ArcFace classifier loaded");

    let dataset = Arc::new(Dataset::new(config.dataset_dir()));
    let identities = Arc::new(IdentityStore::open(config.trainer_dir()));

    let store = Arc::new(
        SqliteAttendanceStore::open(config.attendance_db_path())
            .context("opening attendance store")?,
    );

    let pipeline = Pipeline {
        recognition: RecognitionEngine::new(
            detector.clone(),
            classifier.clone(),
            identities.clone(),
            config.recognition_detection,
            config.confidence_threshold,
        ),
        enrollment: EnrollmentManager::new(detector.clone(), dataset.clone(), config.enroll_detection),
        training: TrainingManager::new(
            detector,
            classifier,
            dataset,
            identities,
            config.recognition_detection,
        ),
    };

    let opener = V4l2Opener {
        device_path: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        read_timeout: config.read_timeout,
    };
    let coordinator = Arc::new(Coordinator::spawn(
        Box::new(opener),
        pipeline,
        store,
        SessionSettings {
            samples_per_register: config.samples_per_register,
            idle_poll: config.idle_poll,
        },
    )?);

    let service = AttendanceService::new(Arc::clone(&coordinator), Arc::new(PdfReportRenderer));
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    tokio::task::spawn_blocking(move || coordinator.shutdown()).await?;

    Ok(())
}
