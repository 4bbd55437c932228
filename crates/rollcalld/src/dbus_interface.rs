use crate::coordinator::{Coordinator, CoordinatorError, LiveObservation};
use crate::report::ReportRenderer;
use chrono::Local;
use image::RgbImage;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "io.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/io/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.rollcall.Attendance1
/// Object path: /io/rollcall/Attendance1
///
/// Control methods reply `(success, message)` and never fail at the D-Bus
/// level; data methods return their payload or an `org.freedesktop.DBus.Error.Failed`.
pub struct AttendanceService {
    coordinator: Arc<Coordinator>,
    renderer: Arc<dyn ReportRenderer>,
}

impl AttendanceService {
    pub fn new(coordinator: Arc<Coordinator>, renderer: Arc<dyn ReportRenderer>) -> Self {
        Self {
            coordinator,
            renderer,
        }
    }
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    #[zbus(out_args("success", "message"))]
    async fn start_camera(&self) -> (bool, String) {
        let coordinator = Arc::clone(&self.coordinator);
        let result = blocking(move || coordinator.start()).await;
        reply("start_camera", result.map(|()| "Camera started".to_string()))
    }

    #[zbus(out_args("success", "message"))]
    async fn stop_camera(&self) -> (bool, String) {
        let coordinator = Arc::clone(&self.coordinator);
        let result = blocking(move || {
            coordinator.stop();
            Ok(())
        })
        .await;
        reply("stop_camera", result.map(|()| "Camera stopped".to_string()))
    }

    /// Store samples of the face currently in front of the camera under `name`.
    #[zbus(out_args("success", "message"))]
    async fn register(&self, name: String) -> (bool, String) {
        let Some(name) = required_name(&name) else {
            return (false, "Name is required".to_string());
        };
        tracing::info!(name = %name, "register requested");
        let coordinator = Arc::clone(&self.coordinator);
        let result = blocking(move || coordinator.register(&name)).await;
        reply(
            "register",
            result.map(|e| format!("Registered {} samples for {}", e.written, e.name)),
        )
    }

    #[zbus(out_args("success", "message"))]
    async fn train(&self) -> (bool, String) {
        tracing::info!("train requested");
        let coordinator = Arc::clone(&self.coordinator);
        let result = blocking(move || coordinator.train()).await;
        reply(
            "train",
            result.map(|r| {
                format!(
                    "Training complete: {} identities from {} faces (model {})",
                    r.identities, r.examples, r.version
                )
            }),
        )
    }

    #[zbus(out_args("success", "message"))]
    async fn mark_attendance(&self) -> (bool, String) {
        let coordinator = Arc::clone(&self.coordinator);
        let result = blocking(move || coordinator.mark_attendance()).await;
        reply("mark_attendance", result.map(|r| r.to_string()))
    }

    /// Latest observation as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let observation = self.coordinator.observation();
        let active = self.coordinator.is_active();
        Ok(status_json(&observation, active).to_string())
    }

    /// Latest annotated frame as JPEG; empty before the first frame.
    async fn preview(&self) -> zbus::fdo::Result<Vec<u8>> {
        let Some(frame) = self.coordinator.observation().annotated_frame.clone() else {
            return Ok(Vec::new());
        };
        tokio::task::spawn_blocking(move || encode_jpeg(&frame))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(format!("jpeg encoding failed: {e}")))
    }

    /// Today's attendance records as a JSON array.
    async fn todays_attendance(&self) -> zbus::fdo::Result<String> {
        let coordinator = Arc::clone(&self.coordinator);
        let records = blocking(move || {
            let today = Local::now().date_naive();
            Ok(coordinator.store().records_for(today)?)
        })
        .await
        .map_err(failed)?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Today's attendance report as a PDF document.
    async fn daily_report(&self) -> zbus::fdo::Result<Vec<u8>> {
        tracing::info!("daily report requested");
        let coordinator = Arc::clone(&self.coordinator);
        let renderer = Arc::clone(&self.renderer);
        blocking(move || {
            let today = Local::now().date_naive();
            let store = coordinator.store();
            store.ensure_daily(today)?;
            let records = store.records_for(today)?;
            Ok(renderer.render(today, &records)?)
        })
        .await
        .map_err(failed)
    }
}

/// Run a coordinator call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, BlockingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CoordinatorError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(BlockingError::Coordinator),
        Err(e) => Err(BlockingError::Join(e)),
    }
}

#[derive(Debug, thiserror::Error)]
enum BlockingError {
    #[error("{0}")]
    Coordinator(CoordinatorError),
    #[error("worker task failed: {0}")]
    Join(tokio::task::JoinError),
}

fn reply(op: &str, result: Result<String, BlockingError>) -> (bool, String) {
    match result {
        Ok(message) => {
            tracing::info!(op, %message, "request succeeded");
            (true, message)
        }
        Err(BlockingError::Coordinator(e)) => {
            tracing::warn!(op, kind = %e.kind(), error = %e, "request failed");
            (false, capitalize(&e.to_string()))
        }
        Err(e) => {
            tracing::error!(op, error = %e, "request failed");
            (false, e.to_string())
        }
    }
}

fn failed(e: BlockingError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn required_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn status_json(observation: &LiveObservation, camera_active: bool) -> serde_json::Value {
    serde_json::json!({
        "name": observation.recognized_name,
        "faces": observation.face_count,
        "status": observation.status_text,
        "camera_active": camera_active,
        "model_version": observation.model_version.map(|v| v.to_string()),
        "sequence": observation.sequence,
    })
}

fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = std::io::Cursor::new(Vec::new());
    frame.write_to(&mut out, image::ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}
