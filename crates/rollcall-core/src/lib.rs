//! rollcall-core: Recognition and attendance core.
//!
//! Turns a detected face region into a 128-d embedding, matches it against
//! the enrolled gallery, and decides when a match may be credited as an
//! attendance record. SCRFD face detection runs via ONNX Runtime.

pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod gate;
pub mod matcher;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod types;

pub use detector::FaceDetector;
pub use extractor::{ExtractError, FeatureExtractor, FrameSample};
pub use gallery::{GalleryError, GalleryStore, LoadSummary};
pub use gate::{DetectionGate, DetectionState};
pub use matcher::{CosineMatcher, Matcher, DEFAULT_THRESHOLD};
pub use pipeline::{FrameOutcome, Recognizer};
pub use session::{AttendanceSession, CommitRejection, Observation, DETECTION_WINDOW_MS};
pub use types::{
    AttendanceRecord, Embedding, EmbeddingError, FaceBox, Identity, IdentityRecord, RecognitionResult,
    EMBEDDING_DIM,
};
