use rollcall_core::DEFAULT_THRESHOLD;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where enrollment snapshots are written.
    pub image_dir: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Target period of the detection loop.
    pub tick_interval: Duration,
    /// Frames discarded after opening the camera (exposure settling).
    pub warmup_frames: usize,
    /// Start the camera as soon as the daemon is up.
    pub autostart: bool,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir: env_path("ROLLCALL_MODEL_DIR", data_dir.join("models")),
            db_path: env_path("ROLLCALL_DB_PATH", data_dir.join("rollcall.db")),
            image_dir: env_path("ROLLCALL_IMAGE_DIR", data_dir.join("images")),
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", DEFAULT_THRESHOLD),
            tick_interval: Duration::from_millis(env_u64("ROLLCALL_TICK_INTERVAL_MS", 100)),
            warmup_frames: env_usize("ROLLCALL_WARMUP_FRAMES", 4),
            autostart: env_flag("ROLLCALL_AUTOSTART", true),
            system_bus: env_flag("ROLLCALL_SYSTEM_BUS", false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Fresh location for an enrollment snapshot that has no record yet.
    ///
    /// Every call yields a distinct path; the file is renamed after the
    /// record ID is known.
    pub fn pending_snapshot_path(&self) -> PathBuf {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        self.image_dir
            .join(format!(".pending-{}-{millis}-{seq}.jpg", std::process::id()))
    }
}

/// Final snapshot location for an enrolled record, next to `pending`.
pub fn snapshot_path_for(pending: &Path, record_id: i64) -> PathBuf {
    pending.with_file_name(format!("{record_id}.jpg"))
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
