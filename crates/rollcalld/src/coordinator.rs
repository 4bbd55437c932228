//! Live session: camera lifecycle, the acquisition loop, and the control
//! operations that read its latest observation.
//!
//! The loop runs on its own OS thread and is the only writer of the
//! observation. Each ingested frame produces one fully-formed
//! [`LiveObservation`], published with a single swap, so readers never see
//! fields from different frames.

use crate::attendance::{AttendanceStore, StoreError};
use crate::report::ReportError;
use chrono::{Local, NaiveDateTime};
use image::RgbImage;
use rollcall_core::{
    EnrollmentManager, Enrollment, ErrorKind, ModelVersion, PipelineError, RecognitionEngine,
    TrainingManager, TrainingReport, UNKNOWN,
};
use rollcall_hw::{CameraError, CameraOpener, FrameSource};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}), proxy blocked")]
    MultipleFacesDetected(usize),
    #[error("unknown face, register and train first")]
    UnknownFace,
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[source] CameraError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("attendance store: {0}")]
    Store(#[from] StoreError),
    #[error("report: {0}")]
    Report(#[from] ReportError),
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoFaceDetected => ErrorKind::NoFaceDetected,
            Self::MultipleFacesDetected(_) => ErrorKind::MultipleFacesDetected,
            Self::UnknownFace => ErrorKind::UnknownFace,
            Self::CameraUnavailable(_) | Self::Spawn(_) => ErrorKind::DeviceFailure,
            Self::Pipeline(e) => e.kind(),
            Self::Store(_) | Self::Report(_) => ErrorKind::StorageFailure,
        }
    }
}

/// Presence verdict for the latest frame, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceStatus {
    /// No frame ingested yet.
    Waiting,
    NoFace,
    ProxyBlocked,
    UnknownFace,
    Recognized(String),
}

impl PresenceStatus {
    pub fn derive(face_count: usize, name: &str) -> Self {
        match face_count {
            0 => Self::NoFace,
            1 if name == UNKNOWN => Self::UnknownFace,
            1 => Self::Recognized(name.to_string()),
            _ => Self::ProxyBlocked,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => f.write_str("Waiting..."),
            Self::NoFace => f.write_str("No face detected"),
            Self::ProxyBlocked => f.write_str("Multiple faces detected (Proxy blocked)"),
            Self::UnknownFace => f.write_str("Unknown face (Register + Train first)"),
            Self::Recognized(name) => write!(f, "Recognized: {name}"),
        }
    }
}

/// Snapshot of what the acquisition loop last saw.
#[derive(Debug, Clone)]
pub struct LiveObservation {
    pub recognized_name: String,
    pub face_count: usize,
    pub status: PresenceStatus,
    pub status_text: String,
    /// Most recently ingested frame, whatever recognition made of it.
    pub last_raw_frame: Option<Arc<RgbImage>>,
    pub annotated_frame: Option<Arc<RgbImage>>,
    /// Frames ingested since the daemon started.
    pub sequence: u64,
    pub model_version: Option<ModelVersion>,
}

impl Default for LiveObservation {
    fn default() -> Self {
        Self {
            recognized_name: UNKNOWN.to_string(),
            face_count: 0,
            status_text: PresenceStatus::Waiting.to_string(),
            status: PresenceStatus::Waiting,
            last_raw_frame: None,
            annotated_frame: None,
            sequence: 0,
            model_version: None,
        }
    }
}

/// Result of a successful attendance mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkReport {
    pub name: String,
    pub already_marked: bool,
}

impl fmt::Display for MarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.already_marked {
            write!(f, "Already marked today for {}", self.name)
        } else {
            write!(f, "Attendance marked for {}", self.name)
        }
    }
}

/// The pipeline stages the coordinator drives.
pub struct Pipeline {
    pub recognition: RecognitionEngine,
    pub enrollment: EnrollmentManager,
    pub training: TrainingManager,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub samples_per_register: usize,
    pub idle_poll: Duration,
}

struct CameraSession {
    active: bool,
    /// Open handle, `None` before the first start and while a read holds it.
    device: Option<Box<dyn FrameSource>>,
    /// The acquisition loop has the handle checked out for a read.
    reading: bool,
}

struct Shared {
    session: Mutex<CameraSession>,
    opener: Box<dyn CameraOpener>,
    observation: watch::Sender<Arc<LiveObservation>>,
    shutdown: AtomicBool,
    pipeline: Pipeline,
    store: Arc<dyn AttendanceStore>,
    settings: SessionSettings,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, CameraSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Coordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawn the acquisition loop. The camera stays closed until [`start`].
    ///
    /// [`start`]: Coordinator::start
    pub fn spawn(
        opener: Box<dyn CameraOpener>,
        pipeline: Pipeline,
        store: Arc<dyn AttendanceStore>,
        settings: SessionSettings,
    ) -> Result<Self, CoordinatorError> {
        let (observation, _) = watch::channel(Arc::new(LiveObservation::default()));
        let shared = Arc::new(Shared {
            session: Mutex::new(CameraSession {
                active: false,
                device: None,
                reading: false,
            }),
            opener,
            observation,
            shutdown: AtomicBool::new(false),
            pipeline,
            store,
            settings,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("rollcall-acquire".into())
                .spawn(move || acquisition_loop(&shared))
                .map_err(CoordinatorError::Spawn)?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Open the camera if no handle is held yet, then mark the session active.
    ///
    /// Never waits for an in-flight frame read.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let mut session = self.shared.session();
        if session.device.is_none() && !session.reading {
            let device = self
                .shared
                .opener
                .open()
                .map_err(CoordinatorError::CameraUnavailable)?;
            session.device = Some(device);
        }
        if !session.active {
            tracing::info!("camera started");
        }
        session.active = true;
        Ok(())
    }

    /// Pause acquisition. The device handle is kept for the next [`start`].
    ///
    /// [`start`]: Coordinator::start
    pub fn stop(&self) {
        let mut session = self.shared.session();
        if session.active {
            tracing::info!("camera stopped");
        }
        session.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.shared.session().active
    }

    /// Latest published observation.
    pub fn observation(&self) -> Arc<LiveObservation> {
        Arc::clone(&self.shared.observation.borrow())
    }

    /// Enroll the single face in the most recently ingested frame.
    pub fn register(&self, name: &str) -> Result<Enrollment, CoordinatorError> {
        let frame = self.observation().last_raw_frame.clone();
        let enrollment = self.shared.pipeline.enrollment.register(
            name,
            frame.as_deref(),
            self.shared.settings.samples_per_register,
        )?;
        Ok(enrollment)
    }

    pub fn train(&self) -> Result<TrainingReport, CoordinatorError> {
        Ok(self.shared.pipeline.training.train()?)
    }

    /// Mark the identity currently in front of the camera as present today.
    pub fn mark_attendance(&self) -> Result<MarkReport, CoordinatorError> {
        self.mark_attendance_at(Local::now().naive_local())
    }

    pub fn mark_attendance_at(&self, at: NaiveDateTime) -> Result<MarkReport, CoordinatorError> {
        let observation = self.observation();
        match observation.face_count {
            0 => return Err(CoordinatorError::NoFaceDetected),
            1 => {}
            n => return Err(CoordinatorError::MultipleFacesDetected(n)),
        }
        if observation.recognized_name == UNKNOWN {
            return Err(CoordinatorError::UnknownFace);
        }

        let name = observation.recognized_name.clone();
        self.shared.store.ensure_daily(at.date())?;
        let outcome = self.shared.store.mark(&name, at)?;
        Ok(MarkReport {
            name,
            already_marked: outcome.already_marked,
        })
    }

    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.shared.store
    }

    /// Stop the acquisition thread and wait for it to exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("acquisition thread panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Pull {
    Idle,
    Frame(RgbImage),
    Failed(CameraError),
}

/// Read one frame if the session is active.
///
/// The handle is taken out of the session for the read, so control calls
/// only ever wait for the flag update, not for the device.
fn pull(shared: &Shared) -> Pull {
    let mut device = {
        let mut session = shared.session();
        if !session.active {
            return Pull::Idle;
        }
        let Some(device) = session.device.take() else {
            return Pull::Idle;
        };
        session.reading = true;
        device
    };

    let result = device.read_frame();

    let mut session = shared.session();
    session.device = Some(device);
    session.reading = false;
    drop(session);

    match result {
        Ok(frame) => Pull::Frame(frame.image),
        Err(e) => Pull::Failed(e),
    }
}

fn acquisition_loop(shared: &Shared) {
    tracing::info!("acquisition thread started");
    let mut sequence: u64 = 0;
    let mut failures: u32 = 0;

    while !shared.shutdown.load(Ordering::SeqCst) {
        let image = match pull(shared) {
            Pull::Idle => {
                std::thread::sleep(shared.settings.idle_poll);
                continue;
            }
            Pull::Failed(e) => {
                failures += 1;
                if failures == 1 || failures % 100 == 0 {
                    tracing::warn!(error = %e, failures, "frame read failed, retrying");
                } else {
                    tracing::debug!(error = %e, "frame read failed");
                }
                std::thread::sleep(shared.settings.idle_poll);
                continue;
            }
            Pull::Frame(image) => image,
        };
        failures = 0;
        sequence += 1;

        let raw = Arc::new(image);
        let recognition = shared.pipeline.recognition.recognize(&raw);
        let status = PresenceStatus::derive(recognition.face_count, &recognition.name);

        shared.observation.send_replace(Arc::new(LiveObservation {
            recognized_name: recognition.name,
            face_count: recognition.face_count,
            status_text: status.to_string(),
            status,
            last_raw_frame: Some(raw),
            annotated_frame: Some(Arc::new(recognition.annotated)),
            sequence,
            model_version: recognition.model_version,
        }));
    }
    tracing::info!(frames = sequence, "acquisition thread exiting");
}
