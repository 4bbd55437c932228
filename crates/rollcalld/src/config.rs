use rollcall_core::recognition::DEFAULT_CONFIDENCE_THRESHOLD;
use rollcall_core::DetectionParams;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root for the sample dataset, trained model and attendance database.
    pub data_dir: PathBuf,
    /// Classifier distance must be strictly below this to accept a match.
    pub confidence_threshold: f32,
    /// Samples written per registration.
    pub samples_per_register: usize,
    /// Detector profile for registration.
    pub enroll_detection: DetectionParams,
    /// Detector profile for training and live recognition.
    pub recognition_detection: DetectionParams,
    /// Wait between loop iterations while idle or after a failed read.
    pub idle_poll: Duration,
    /// Longest a single frame read may block before it counts as failed.
    pub read_timeout: Duration,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_home = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_home.clone());

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_home.join("models"));

        let nms_threshold = env_or("ROLLCALL_NMS_THRESHOLD", DetectionParams::RECOGNITION.nms_threshold);
        let min_face_size = env_or("ROLLCALL_MIN_FACE_SIZE", DetectionParams::RECOGNITION.min_face_size);

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_or("ROLLCALL_CAMERA_WIDTH", 640),
            camera_height: env_or("ROLLCALL_CAMERA_HEIGHT", 480),
            model_dir,
            data_dir,
            confidence_threshold: env_or("ROLLCALL_CONFIDENCE_THRESHOLD", DEFAULT_CONFIDENCE_THRESHOLD),
            samples_per_register: env_or("ROLLCALL_SAMPLES_PER_REGISTER", 10),
            enroll_detection: DetectionParams {
                confidence_threshold: env_or(
                    "ROLLCALL_ENROLL_DETECTION_CONFIDENCE",
                    DetectionParams::ENROLLMENT.confidence_threshold,
                ),
                nms_threshold,
                min_face_size,
            },
            recognition_detection: DetectionParams {
                confidence_threshold: env_or(
                    "ROLLCALL_DETECTION_CONFIDENCE",
                    DetectionParams::RECOGNITION.confidence_threshold,
                ),
                nms_threshold,
                min_face_size,
            },
            idle_poll: Duration::from_millis(env_or("ROLLCALL_IDLE_POLL_MS", 50)),
            read_timeout: Duration::from_millis(env_or("ROLLCALL_READ_TIMEOUT_MS", 2000)),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("dataset")
    }

    pub fn trainer_dir(&self) -> PathBuf {
        self.data_dir.join("trainer")
    }

    pub fn attendance_db_path(&self) -> PathBuf {
        self.data_dir.join("attendance.db")
    }
}

/// Parse `key` from the environment, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}
